//! Value-or-error shapes.
//!
//! [`Either`] carries a failure through an observable as an ordinary value, so an
//! error notification does not have to terminate the stream. [`AsyncError`] is the
//! return shape of operations that may fail immediately or later: the caller checks
//! for a synchronous error first and, if there is none, awaits the [`ErrorHandle`]
//! once for the eventual outcome.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;

/// Exactly one of a value (`Ok`) or an error (`Err`).
pub type Either<T, E> = Result<T, E>;

/// Creates a single-shot error notification channel.
pub fn error_channel<E: Clone>() -> (ErrorSender<E>, ErrorHandle<E>) {
    let (tx, rx) = oneshot::channel();
    (
        ErrorSender { tx },
        ErrorHandle {
            inner: rx.shared(),
            abandoned: false,
        },
    )
}

/// The resolving side of an [`ErrorHandle`].
///
/// Both [`ErrorSender::send`] and [`ErrorSender::close`] consume the sender, so an
/// outcome is delivered at most once. Dropping the sender without calling either
/// abandons every handle.
#[derive(Debug)]
pub struct ErrorSender<E> {
    tx: oneshot::Sender<Option<E>>,
}

impl<E> ErrorSender<E> {
    /// Delivers `err` and closes the channel.
    pub fn send(self, err: E) {
        let _ = self.tx.send(Some(err));
    }

    /// Closes the channel without an error, signalling success.
    pub fn close(self) {
        let _ = self.tx.send(None);
    }

    /// Returns `true` if every handle has been dropped.
    pub fn is_unobserved(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A future resolving to the outcome of an asynchronous operation.
///
/// Resolves to `None` on success and `Some(err)` on failure. Clones share the same
/// outcome. If the sender was dropped without resolving, the handle is abandoned
/// and never resolves; race it against a cancellation token.
#[derive(Clone)]
pub struct ErrorHandle<E: Clone> {
    inner: Shared<oneshot::Receiver<Option<E>>>,
    abandoned: bool,
}

impl<E: Clone> ErrorHandle<E> {
    /// Returns `true` once the outcome has been delivered.
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.clone().now_or_never(), Some(Ok(_)))
    }

    /// Returns `true` if the sender was dropped without resolving.
    pub fn is_abandoned(&self) -> bool {
        self.abandoned || matches!(self.inner.clone().now_or_never(), Some(Err(_)))
    }
}

impl<E: Clone> Future for ErrorHandle<E> {
    type Output = Option<E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.abandoned {
            return Poll::Pending;
        }
        match self.inner.poll_unpin(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => {
                self.abandoned = true;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<E: Clone> std::fmt::Debug for ErrorHandle<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandle")
            .field("resolved", &self.is_resolved())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Either an immediate failure or a handle to an eventual one.
#[derive(Debug)]
pub enum AsyncError<E: Clone> {
    Sync(E),
    Async(ErrorHandle<E>),
}

impl<E: Clone> AsyncError<E> {
    /// Splits into the synchronous error, or the handle to await.
    pub fn sync_or_async(self) -> Result<ErrorHandle<E>, E> {
        match self {
            AsyncError::Sync(err) => Err(err),
            AsyncError::Async(handle) => Ok(handle),
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, AsyncError::Sync(_))
    }

    /// Waits for the final outcome, whichever form it takes.
    pub async fn resolve(self) -> Option<E> {
        match self {
            AsyncError::Sync(err) => Some(err),
            AsyncError::Async(handle) => handle.await,
        }
    }
}

impl<E: Clone> From<ErrorHandle<E>> for AsyncError<E> {
    fn from(handle: ErrorHandle<E>) -> Self {
        AsyncError::Async(handle)
    }
}
