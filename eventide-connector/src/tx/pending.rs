//! Index of broadcast transactions waiting for commit or timeout.
//!
//! `by_hash` is the source of truth. `by_timeout` only holds keys into it, ordered
//! by timeout height so a block sweep touches nothing that has not expired. Both
//! live under one mutex, which is never held across an await.

use crate::error::TxError;
use eventide_observable::{error_channel, ErrorHandle, ErrorSender};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::Mutex,
};

/// How many unmatched commits are remembered.
const RECENTLY_COMMITTED_CAPACITY: usize = 1024;

struct PendingTx {
    timeout_height: u64,
    sender: ErrorSender<TxError>,
    handle: ErrorHandle<TxError>,
}

#[derive(Default)]
struct Index {
    by_hash: HashMap<String, PendingTx>,
    by_timeout: BTreeMap<u64, BTreeSet<String>>,
    // Commits seen before their hash was registered.
    recently_committed: VecDeque<String>,
    recently_committed_set: HashSet<String>,
}

impl Index {
    fn remember_commit(&mut self, hash: &str) {
        if !self.recently_committed_set.insert(hash.to_string()) {
            return;
        }
        self.recently_committed.push_back(hash.to_string());
        if self.recently_committed.len() > RECENTLY_COMMITTED_CAPACITY {
            if let Some(evicted) = self.recently_committed.pop_front() {
                self.recently_committed_set.remove(&evicted);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingTxs {
    index: Mutex<Index>,
}

impl PendingTxs {
    fn lock(&self) -> std::sync::MutexGuard<'_, Index> {
        // Nothing panics while holding the lock, so a poisoned index is still consistent.
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tracks `hash` until commit or `timeout_height`, returning its error handle.
    ///
    /// Registering a hash that is already tracked returns the existing handle. A hash
    /// whose commit was already observed resolves immediately with no error.
    pub(crate) fn register(&self, hash: &str, timeout_height: u64) -> ErrorHandle<TxError> {
        let mut index = self.lock();
        if let Some(pending) = index.by_hash.get(hash) {
            return pending.handle.clone();
        }

        let (sender, handle) = error_channel();
        if index.recently_committed_set.contains(hash) {
            sender.close();
            return handle;
        }

        index
            .by_timeout
            .entry(timeout_height)
            .or_default()
            .insert(hash.to_string());
        index.by_hash.insert(
            hash.to_string(),
            PendingTx {
                timeout_height,
                sender,
                handle: handle.clone(),
            },
        );
        handle
    }

    /// Resolves `hash` as committed. Returns whether it was being tracked.
    pub(crate) fn commit(&self, hash: &str) -> bool {
        let mut index = self.lock();
        let Some(pending) = index.by_hash.remove(hash) else {
            index.remember_commit(hash);
            return false;
        };

        if let Some(hashes) = index.by_timeout.get_mut(&pending.timeout_height) {
            hashes.remove(hash);
            if hashes.is_empty() {
                index.by_timeout.remove(&pending.timeout_height);
            }
        }
        pending.sender.close();
        true
    }

    /// Removes every transaction whose timeout height is at or below `height` and
    /// hands back their senders. Heights that were never swept are included.
    pub(crate) fn expire_up_to(&self, height: u64) -> Vec<(String, ErrorSender<TxError>)> {
        let mut index = self.lock();
        let expired = match height.checked_add(1) {
            Some(next) => {
                let later = index.by_timeout.split_off(&next);
                std::mem::replace(&mut index.by_timeout, later)
            }
            None => std::mem::take(&mut index.by_timeout),
        };

        expired
            .into_values()
            .flatten()
            .filter_map(|hash| {
                let pending = index.by_hash.remove(&hash)?;
                Some((hash, pending.sender))
            })
            .collect()
    }

    /// Stops tracking everything. Outstanding handles never resolve.
    pub(crate) fn abandon_all(&self) {
        let mut index = self.lock();
        index.by_hash.clear();
        index.by_timeout.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().by_hash.len()
    }
}
