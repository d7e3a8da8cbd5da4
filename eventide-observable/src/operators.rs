use tokio_util::sync::CancellationToken;

use crate::observable::{Observable, Publisher};
use crate::replay::ReplayObservable;

/// Calls `f` for every value of `observable` until `ctx` is cancelled or the
/// observable closes.
pub async fn for_each<T, F>(ctx: &CancellationToken, observable: &Observable<T>, mut f: F)
where
    T: Clone + Send + 'static,
    F: FnMut(T),
{
    let mut observer = observable.subscribe(ctx);
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            value = observer.recv() => match value {
                Some(value) => f(value),
                None => break,
            },
        }
    }
}

/// Derives an observable by applying `f` to every value of `src`. Values for
/// which `f` returns `None` are skipped.
///
/// The subscription to `src` is taken before this function returns, so nothing
/// published afterwards is missed. The derived observable closes when `src`
/// closes or `ctx` is cancelled.
pub fn map<T, U, F>(ctx: &CancellationToken, src: &Observable<T>, f: F) -> Observable<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    let (dst, publisher) = Observable::new();
    forward(ctx, src, publisher, f);
    dst
}

/// Like [`map`], but the derived observable replays its last `replay_buffer_size`
/// values to late subscribers.
pub fn map_replay<T, U, F>(
    ctx: &CancellationToken,
    replay_buffer_size: usize,
    src: &Observable<T>,
    f: F,
) -> ReplayObservable<U>
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    let (dst, publisher) = ReplayObservable::new(ctx, replay_buffer_size);
    forward(ctx, src, publisher, f);
    dst
}

fn forward<T, U, F>(ctx: &CancellationToken, src: &Observable<T>, publisher: Publisher<U>, mut f: F)
where
    T: Clone + Send + 'static,
    U: Clone + Send + 'static,
    F: FnMut(T) -> Option<U> + Send + 'static,
{
    let mut observer = src.subscribe(ctx);
    let closed = publisher.shared.lifetime.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                value = observer.recv() => match value {
                    Some(value) => {
                        if let Some(mapped) = f(value) {
                            publisher.publish(mapped);
                        }
                    }
                    None => break,
                },
            }
        }
        // Dropping the publisher closes the derived observable.
    });
}
