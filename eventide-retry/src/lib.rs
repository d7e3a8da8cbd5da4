//! Retry helpers for long-running and one-shot fallible work.
//!
//! *   [`on_error`] supervises work that reports failures over a channel, such as a
//!     socket subscription that may drop at any time, and restarts it after each
//!     error. The retry counter resets once the work has run error-free for a while.
//!     [`on_error_with_backoff`] does the same with a growing restart delay.
//! *   [`call`] repeats a single fallible async operation under a [`RetryStrategy`],
//!     by default [`ExponentialBackoff`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Exponential backoff factor: `initial_delay * FACTOR^retry_count`.
const EXPONENTIAL_BACKOFF_FACTOR: u32 = 2;

pub const DEFAULT_MAX_RETRY_COUNT: u32 = 25;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Growth of the restart delay after each retry of [`on_error_with_backoff`].
pub const DEFAULT_DELAY_MULTIPLIER: f64 = 1.5;

/// Restart delay schedule for [`on_error_with_backoff`]: starts at
/// `initial_delay`, multiplied by `multiplier` after every retry, never above
/// `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayBackoff {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl DelayBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier: DEFAULT_DELAY_MULTIPLIER,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// The same delay before every restart.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// The delay that follows `current`.
    pub fn next(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Runs `work_fn` and restarts it every time it reports an error, until `ctx` is
/// cancelled, the error channel closes, or the retry limit is reached.
///
/// * `retry_limit`: how many times to restart after an error. Negative means
///   no limit.
/// * `retry_delay`: pause before each restart.
/// * `retry_reset_timeout`: if no error arrives for this long, the retry count
///   goes back to zero.
///
/// Returns `Ok(())` on cancellation or when the channel closes, and the last
/// error once the limit has been exhausted.
pub async fn on_error<E, F>(
    ctx: &CancellationToken,
    retry_limit: i64,
    retry_delay: Duration,
    retry_reset_timeout: Duration,
    work_name: &str,
    work_fn: F,
) -> Result<(), E>
where
    E: Display,
    F: FnMut() -> mpsc::Receiver<E>,
{
    on_error_with_backoff(
        ctx,
        retry_limit,
        &DelayBackoff::fixed(retry_delay),
        retry_reset_timeout,
        work_name,
        work_fn,
    )
    .await
}

/// Like [`on_error`], but the pause before each restart follows `backoff`. A quiet
/// period of `retry_reset_timeout` resets both the retry count and the delay.
pub async fn on_error_with_backoff<E, F>(
    ctx: &CancellationToken,
    retry_limit: i64,
    backoff: &DelayBackoff,
    retry_reset_timeout: Duration,
    work_name: &str,
    mut work_fn: F,
) -> Result<(), E>
where
    E: Display,
    F: FnMut() -> mpsc::Receiver<E>,
{
    let mut retry_count: i64 = 0;
    let mut current_delay = backoff.initial_delay;
    let mut err_rx = work_fn();

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = tokio::time::sleep(retry_reset_timeout) => {
                retry_count = 0;
                current_delay = backoff.initial_delay;
            }
            received = err_rx.recv() => {
                let Some(err) = received else {
                    tracing::warn!(work_name, "Error channel closed, will no longer retry on error.");
                    return Ok(());
                };

                if retry_limit >= 0 && retry_count >= retry_limit {
                    return Err(err);
                }

                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(current_delay) => {}
                }

                retry_count += 1;
                err_rx = work_fn();
                tracing::error!(
                    work_name,
                    retry_count,
                    retry_delay_ms = current_delay.as_millis() as u64,
                    error = %err,
                    "Retrying after error."
                );
                current_delay = backoff.next(current_delay);
            }
        }
    }
}

/// Classifies errors for [`call`]. Non-retryable errors end the loop at once.
pub trait Retryable {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Decides whether [`call`] should try again after the `retry_count`-th failure,
/// waiting as long as it sees fit before answering.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    async fn should_retry(&self, ctx: &CancellationToken, retry_count: u32) -> bool;
}

/// Doubles the delay after each failure, up to `max_delay`, giving up after
/// `max_retries` attempts or when the context is cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRY_COUNT,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ExponentialBackoff {
    /// The pause before the retry that follows the `retry_count`-th failure.
    pub fn delay(&self, retry_count: u32) -> Duration {
        EXPONENTIAL_BACKOFF_FACTOR
            .checked_pow(retry_count)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[async_trait]
impl RetryStrategy for ExponentialBackoff {
    async fn should_retry(&self, ctx: &CancellationToken, retry_count: u32) -> bool {
        if retry_count >= self.max_retries {
            return false;
        }
        tokio::select! {
            _ = ctx.cancelled() => false,
            _ = tokio::time::sleep(self.delay(retry_count)) => true,
        }
    }
}

/// Calls `work` until it succeeds, fails with a non-retryable error, or
/// `strategy` gives up. Returns the last result.
pub async fn call<T, E, F, Fut, S>(
    ctx: &CancellationToken,
    mut work: F,
    strategy: &S,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: RetryStrategy + ?Sized,
{
    let mut retry_count = 0;
    loop {
        let err = match work().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if !strategy.should_retry(ctx, retry_count).await {
            return Err(err);
        }

        tracing::debug!(retry_count, error = %err, "Retrying call.");
        retry_count += 1;
    }
}
