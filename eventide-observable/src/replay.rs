use std::ops::Deref;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::observable::{Observable, Publisher, Shared, DEFAULT_OBSERVER_BUFFER};

/// An [`Observable`] that keeps the last `N` published values.
///
/// Observers that subscribe late first receive the buffered backlog in publish
/// order, then live values. The backlog is copied into the new observer under
/// the same lock that publishing takes, so nothing is lost or duplicated at the
/// boundary.
pub struct ReplayObservable<T> {
    inner: Observable<T>,
}

impl<T> Clone for ReplayObservable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ReplayObservable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReplayObservable").field(&self.inner).finish()
    }
}

impl<T> Deref for ReplayObservable<T> {
    type Target = Observable<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Clone + Send + 'static> ReplayObservable<T> {
    /// Creates a replay observable holding up to `replay_buffer_size` values.
    ///
    /// The observable unsubscribes all of its observers once `ctx` is cancelled.
    /// Must be called from within a Tokio runtime.
    pub fn new(ctx: &CancellationToken, replay_buffer_size: usize) -> (Self, Publisher<T>) {
        Self::with_buffer(ctx, replay_buffer_size, DEFAULT_OBSERVER_BUFFER)
    }

    /// Like [`ReplayObservable::new`] with an explicit per-observer buffer capacity.
    pub fn with_buffer(
        ctx: &CancellationToken,
        replay_buffer_size: usize,
        observer_buffer: usize,
    ) -> (Self, Publisher<T>) {
        let shared = Shared::new(observer_buffer, Some(replay_buffer_size));

        let watched = Arc::downgrade(&shared);
        let lifetime = shared.lifetime.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {
                    if let Some(shared) = watched.upgrade() {
                        shared.close();
                    }
                }
                _ = lifetime.cancelled() => {}
            }
        });

        (
            Self {
                inner: Observable {
                    shared: shared.clone(),
                },
            },
            Publisher { shared },
        )
    }

    /// The capacity of the replay buffer fixed at construction.
    pub fn replay_buffer_size(&self) -> usize {
        self.inner
            .shared
            .lock()
            .replay
            .as_ref()
            .map_or(0, |replay| replay.capacity)
    }

    /// Returns the plain observable view of this replay observable.
    pub fn observable(&self) -> &Observable<T> {
        &self.inner
    }

    /// Returns up to `n` of the most recently published values, oldest first.
    ///
    /// Waits until at least one value has been buffered. Values are not consumed;
    /// other observers still receive them. Returns an empty vector if `ctx` is
    /// cancelled, or if the observable closes before anything was buffered.
    pub async fn last(&self, ctx: &CancellationToken, n: usize) -> Vec<T> {
        if n == 0 {
            return Vec::new();
        }

        let capacity = self.replay_buffer_size();
        let n = if n > capacity {
            tracing::warn!(
                requested = n,
                replay_buffer_size = capacity,
                "Requested more values than the replay buffer holds, returning at most the buffer size."
            );
            capacity
        } else {
            n
        };

        let shared = &self.inner.shared;
        loop {
            let notified = shared.buffered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = shared.lock();
                if let Some(replay) = state.replay.as_ref() {
                    if !replay.values.is_empty() {
                        let skip = replay.values.len().saturating_sub(n);
                        return replay.values.iter().skip(skip).cloned().collect();
                    }
                }
                if state.closed || n == 0 {
                    return Vec::new();
                }
            }

            tokio::select! {
                _ = ctx.cancelled() => return Vec::new(),
                _ = &mut notified => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn last_clamps_to_buffer_size() {
        let ctx = CancellationToken::new();
        let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 3);
        for value in 0..5 {
            publisher.publish(value);
        }

        assert_eq!(replay.last(&ctx, 10).await, vec![2, 3, 4]);
        assert_eq!(replay.last(&ctx, 2).await, vec![3, 4]);
    }

    #[tokio::test]
    async fn last_waits_for_first_value() {
        let ctx = CancellationToken::new();
        let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 2);

        let reader = {
            let replay = replay.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { replay.last(&ctx, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        publisher.publish(42);
        let values = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("last should return after a publish")
            .expect("reader task panicked");
        assert_eq!(values, vec![42]);
    }

    #[tokio::test]
    async fn last_returns_empty_when_context_cancelled() {
        let ctx = CancellationToken::new();
        let (replay, _publisher) = ReplayObservable::<u32>::new(&ctx, 2);

        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(replay.last(&waiter, 1).await.is_empty());
    }

    #[tokio::test]
    async fn cancelling_construction_context_closes_observers() {
        let ctx = CancellationToken::new();
        let (replay, publisher) = ReplayObservable::<u32>::new(&ctx, 2);
        let mut observer = replay.subscribe(&CancellationToken::new());

        publisher.publish(1);
        ctx.cancel();

        assert_eq!(observer.recv().await, Some(1));
        let end = tokio::time::timeout(Duration::from_secs(1), observer.recv()).await;
        assert_eq!(end.ok().flatten(), None);
        assert!(replay.is_closed());
    }
}
