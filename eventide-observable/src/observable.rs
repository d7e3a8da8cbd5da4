//! # Observable Core
//!
//! A single [`Shared`] state backs both plain and replay observables. It owns the
//! observer registry and, for replay observables, the bounded backlog. Publishing,
//! subscribing and closing all happen under one lock, so a new subscriber can never
//! miss or double-receive a value that is published while it registers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::stream::{self, Stream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// The default capacity of each observer's delivery buffer.
pub const DEFAULT_OBSERVER_BUFFER: usize = 1024;

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    /// Woken whenever a value lands in the replay buffer or the observable closes.
    pub(crate) buffered: Notify,
    /// Cancelled once the observable is closed; lets helper tasks exit.
    pub(crate) lifetime: CancellationToken,
    observer_buffer: usize,
}

pub(crate) struct State<T> {
    next_id: u64,
    observers: Vec<Registration<T>>,
    pub(crate) replay: Option<ReplayBuffer<T>>,
    pub(crate) closed: bool,
}

struct Registration<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    token: CancellationToken,
}

pub(crate) struct ReplayBuffer<T> {
    pub(crate) capacity: usize,
    pub(crate) values: VecDeque<T>,
}

impl<T> ReplayBuffer<T> {
    fn push(&mut self, value: T) {
        if self.capacity == 0 {
            return;
        }
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

impl<T: Clone + Send + 'static> Shared<T> {
    pub(crate) fn new(observer_buffer: usize, replay_capacity: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                next_id: 0,
                observers: Vec::new(),
                replay: replay_capacity.map(|capacity| ReplayBuffer {
                    capacity,
                    values: VecDeque::with_capacity(capacity),
                }),
                closed: false,
            }),
            buffered: Notify::new(),
            lifetime: CancellationToken::new(),
            observer_buffer: observer_buffer.max(1),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, value: T) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(replay) = state.replay.as_mut() {
            replay.push(value.clone());
        }

        state.observers.retain(|observer| {
            if observer.token.is_cancelled() {
                return false;
            }
            match observer.tx.try_send(value.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        observer_id = observer.id,
                        "Observer buffer is full, dropping notification."
                    );
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        let is_replay = state.replay.is_some();
        drop(state);

        if is_replay {
            self.buffered.notify_waiters();
        }
    }

    fn subscribe(self: &Arc<Self>, ctx: &CancellationToken) -> Observer<T> {
        let token = ctx.child_token();
        let mut state = self.lock();

        let backlog: Vec<T> = state
            .replay
            .as_ref()
            .map(|replay| replay.values.iter().cloned().collect())
            .unwrap_or_default();
        let (tx, mut rx) = mpsc::channel(self.observer_buffer.max(backlog.len()).max(1));
        for value in backlog {
            // The channel was sized to hold the whole backlog.
            let _ = tx.try_send(value);
        }

        let id = state.next_id;
        state.next_id += 1;

        if state.closed || token.is_cancelled() {
            token.cancel();
            rx.close();
        } else {
            state.observers.push(Registration {
                id,
                tx,
                token: token.clone(),
            });
        }
        drop(state);

        Observer {
            id,
            rx,
            token,
            shared: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        let mut state = self.lock();
        state.observers.retain(|observer| observer.id != id);
    }

    pub(crate) fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        for observer in state.observers.drain(..) {
            observer.token.cancel();
        }
        drop(state);

        self.lifetime.cancel();
        self.buffered.notify_waiters();
    }

    fn observer_count(&self) -> usize {
        self.lock()
            .observers
            .iter()
            .filter(|observer| !observer.token.is_cancelled())
            .count()
    }
}

/// A broadcast source of values of type `T`.
///
/// Cloning an `Observable` yields another handle to the same stream.
pub struct Observable<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observable")
            .field("ptr", &Arc::as_ptr(&self.shared))
            .finish()
    }
}

impl<T: Clone + Send + 'static> Observable<T> {
    /// Creates a new observable and the publish handle that feeds it.
    pub fn new() -> (Self, Publisher<T>) {
        Self::with_buffer(DEFAULT_OBSERVER_BUFFER)
    }

    /// Like [`Observable::new`] with an explicit per-observer buffer capacity.
    pub fn with_buffer(observer_buffer: usize) -> (Self, Publisher<T>) {
        let shared = Shared::new(observer_buffer, None);
        (
            Self {
                shared: shared.clone(),
            },
            Publisher { shared },
        )
    }

    /// Registers a new observer.
    ///
    /// The observer's channel closes when `ctx` is cancelled, when the observer
    /// unsubscribes or is dropped, or when the observable is closed.
    pub fn subscribe(&self, ctx: &CancellationToken) -> Observer<T> {
        self.shared.subscribe(ctx)
    }

    /// Closes every current observer. Observers subscribing afterwards receive an
    /// already-closed channel.
    pub fn unsubscribe_all(&self) {
        self.shared.close();
    }

    /// Returns `true` once the observable has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// The number of observers currently registered.
    pub fn observer_count(&self) -> usize {
        self.shared.observer_count()
    }

    /// Returns `true` if both handles refer to the same underlying stream.
    pub fn same_as(&self, other: &Observable<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// The private publish handle of an observable.
///
/// Dropping the publisher closes the observable, like closing a producer channel.
pub struct Publisher<T: Clone + Send + 'static> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    /// Delivers `value` to every current observer.
    ///
    /// Publishing to a closed observable, or to an observer whose buffer is full or
    /// that has gone away, is a no-op for that observer.
    pub fn publish(&self, value: T) {
        self.shared.publish(value);
    }

    /// Returns `true` once the observable has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<T: Clone + Send + 'static> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// A per-subscriber delivery handle.
#[derive(Debug)]
pub struct Observer<T: Clone + Send + 'static> {
    id: u64,
    rx: mpsc::Receiver<T>,
    token: CancellationToken,
    shared: Weak<Shared<T>>,
}

impl<T: Clone + Send + 'static> Observer<T> {
    /// Receives the next value. Returns `None` once the channel is closed and every
    /// buffered value has been received.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.token.is_cancelled() {
                self.rx.close();
                return self.rx.recv().await;
            }
            tokio::select! {
                biased;
                value = self.rx.recv() => return value,
                _ = self.token.cancelled() => continue,
            }
        }
    }

    /// Receives a buffered value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Stops delivery to this observer. Other observers are unaffected.
    pub fn unsubscribe(&mut self) {
        self.token.cancel();
        self.rx.close();
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }

    /// Returns `true` once this observer will receive no new values.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled() || self.rx.is_closed()
    }

    /// Converts the observer into a [`Stream`] of values.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut observer| async move {
            observer.recv().await.map(|value| (value, observer))
        }))
    }
}

impl<T: Clone + Send + 'static> Drop for Observer<T> {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl<T> std::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("observer_buffer", &self.observer_buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsubscribing_one_observer_leaves_others_intact() {
        let ctx = CancellationToken::new();
        let (observable, publisher) = Observable::<u32>::new();
        let mut first = observable.subscribe(&ctx);
        let mut second = observable.subscribe(&ctx);

        first.unsubscribe();
        publisher.publish(7);

        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, Some(7));
        assert_eq!(observable.observer_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_publisher_closes_observers() {
        let ctx = CancellationToken::new();
        let (observable, publisher) = Observable::<u32>::new();
        let mut observer = observable.subscribe(&ctx);

        publisher.publish(1);
        drop(publisher);

        assert_eq!(observer.recv().await, Some(1));
        assert_eq!(observer.recv().await, None);
        assert!(observable.is_closed());
    }

    #[tokio::test]
    async fn full_observer_buffer_drops_instead_of_blocking() {
        let ctx = CancellationToken::new();
        let (observable, publisher) = Observable::<u32>::with_buffer(2);
        let mut observer = observable.subscribe(&ctx);

        for value in 0..5 {
            publisher.publish(value);
        }

        assert_eq!(observer.try_recv(), Some(0));
        assert_eq!(observer.try_recv(), Some(1));
        assert_eq!(observer.try_recv(), None);
    }

    #[tokio::test]
    async fn dropped_observer_is_removed_from_registry() {
        let ctx = CancellationToken::new();
        let (observable, _publisher) = Observable::<u32>::new();
        let observer = observable.subscribe(&ctx);
        assert_eq!(observable.observer_count(), 1);

        drop(observer);
        assert_eq!(observable.observer_count(), 0);
    }
}
