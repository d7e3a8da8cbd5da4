//! # Typed Event Replay Client
//!
//! [`EventsReplayClient`] turns the raw frames of one query into a stream of typed
//! events. Decoded events go to a single [`ReplayObservable`] that stays the same
//! across reconnections, so observers never need to resubscribe.
//!
//! Frames that do not decode (subscription acks, other event types, malformed
//! payloads) are skipped. A lost connection or closed subscription is reported to
//! [`eventide_retry::on_error_with_backoff`], which resubscribes after a delay that
//! starts at `retry_delay` and grows by half on every retry up to `max_retry_delay`.
//! Once `conn_retry_limit` consecutive retries have failed, the client waits
//! `retry_delay` and starts a fresh round of retries.

use crate::{
    config::EventsConfig,
    error::{DecodeError, EventsQueryError},
    events_query::{EventsBytes, EventsQueryClient},
};
use eventide_observable::{Observer, Publisher, ReplayObservable};
use eventide_retry::DelayBackoff;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// Retry without limit.
pub const DEFAULT_CONN_RETRY_LIMIT: i64 = -1;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_RESET_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 1;

/// Decodes one raw frame into a typed event.
pub type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync>;

/// A replayable stream of typed events for one query.
pub struct EventsReplayClient<T> {
    query: String,
    sequence: ReplayObservable<T>,
    events_client: Arc<dyn EventsQueryClient>,
    token: CancellationToken,
}

pub struct EventsReplayClientBuilder<T> {
    query: String,
    decode: DecodeFn<T>,
    buffer_size: usize,
    conn_retry_limit: i64,
    retry_delay: Duration,
    max_retry_delay: Duration,
    retry_reset_timeout: Duration,
    span: Option<Span>,
}

impl<T> EventsReplayClientBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// How many recent events late observers receive.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// How many times to resubscribe in a row before giving up; negative means
    /// forever.
    pub fn conn_retry_limit(mut self, limit: i64) -> Self {
        self.conn_retry_limit = limit;
        self
    }

    /// The delay before the first resubscription of a round of retries.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Ceiling of the growing delay between resubscriptions.
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    pub fn retry_reset_timeout(mut self, timeout: Duration) -> Self {
        self.retry_reset_timeout = timeout;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Applies the retry settings of an `[events]` config section.
    pub fn with_config(self, config: &EventsConfig) -> Self {
        self.conn_retry_limit(config.conn_retry_limit)
            .retry_delay(config.retry_delay())
            .max_retry_delay(config.max_retry_delay())
            .retry_reset_timeout(config.retry_reset_timeout())
    }

    /// Subscribes to the query and starts publishing decoded events.
    ///
    /// Fails if the first subscription cannot be opened. Later connection losses
    /// are retried in the background for as long as `ctx` lives.
    pub async fn build(
        self,
        ctx: &CancellationToken,
        events_client: Arc<dyn EventsQueryClient>,
    ) -> Result<EventsReplayClient<T>, EventsQueryError> {
        let token = ctx.child_token();
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("events_replay_client", query = %self.query));

        // The first attempt runs here so observers subscribing right after `build`
        // returns cannot miss events.
        let attempt = token.child_token();
        let observable = events_client
            .events_bytes(&attempt, &self.query)
            .await
            .inspect_err(|e| {
                tracing::error!(parent: &span, error = %e, "Initial events subscription failed.")
            })?;
        let first = observable.subscribe(&attempt);

        let (sequence, publisher) = ReplayObservable::new(&token, self.buffer_size);
        let publishing = Publishing {
            query: self.query.clone(),
            decode: self.decode,
            events_client: events_client.clone(),
            publisher: Arc::new(publisher),
            conn_retry_limit: self.conn_retry_limit,
            backoff: DelayBackoff::new(self.retry_delay, self.max_retry_delay),
            retry_reset_timeout: self.retry_reset_timeout,
            span: span.clone(),
        };
        tokio::spawn(
            publishing
                .run(token.clone(), Some((attempt, first)))
                .instrument(span),
        );

        Ok(EventsReplayClient {
            query: self.query,
            sequence,
            events_client,
            token,
        })
    }
}

impl<T> EventsReplayClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn builder(
        query: impl Into<String>,
        decode: impl Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync + 'static,
    ) -> EventsReplayClientBuilder<T> {
        EventsReplayClientBuilder {
            query: query.into(),
            decode: Arc::new(decode),
            buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
            conn_retry_limit: DEFAULT_CONN_RETRY_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            retry_reset_timeout: DEFAULT_RETRY_RESET_TIMEOUT,
            span: None,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The replay observable of decoded events. The same instance is returned for
    /// the lifetime of the client.
    pub fn events_sequence(&self) -> ReplayObservable<T> {
        self.sequence.clone()
    }

    /// Returns up to `n` of the latest events, oldest first, waiting for the first
    /// event if none has arrived yet.
    pub async fn last_n_events(&self, ctx: &CancellationToken, n: usize) -> Vec<T> {
        self.sequence.last(ctx, n).await
    }

    /// Stops publishing and closes the underlying events client.
    pub async fn close(&self) {
        self.token.cancel();
        self.events_client.close().await;
    }
}

/// State of the background publishing loop.
struct Publishing<T: Clone + Send + Sync + 'static> {
    query: String,
    decode: DecodeFn<T>,
    events_client: Arc<dyn EventsQueryClient>,
    publisher: Arc<Publisher<T>>,
    conn_retry_limit: i64,
    backoff: DelayBackoff,
    retry_reset_timeout: Duration,
    span: Span,
}

impl<T> Publishing<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(
        self,
        token: CancellationToken,
        mut first: Option<(CancellationToken, Observer<EventsBytes>)>,
    ) {
        loop {
            let outcome = eventide_retry::on_error_with_backoff(
                &token,
                self.conn_retry_limit,
                &self.backoff,
                self.retry_reset_timeout,
                "publish_events",
                || match first.take() {
                    Some((attempt, observer)) => self.forward(attempt, observer),
                    None => self.resubscribe(&token),
                },
            )
            .await;

            let Err(e) = outcome else { break };
            tracing::error!(
                error = %e,
                retry_delay_ms = self.backoff.initial_delay.as_millis() as u64,
                "Events subscription failed after max retries, starting over."
            );
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.backoff.initial_delay) => {}
            }
        }
        tracing::debug!("Stopped publishing events.");
    }

    /// Opens a new subscription in the background and forwards it.
    fn resubscribe(&self, token: &CancellationToken) -> mpsc::Receiver<EventsQueryError> {
        let (err_tx, err_rx) = mpsc::channel(1);
        let attempt = token.child_token();
        let query = self.query.clone();
        let events_client = self.events_client.clone();
        let forwarder = self.forwarder();

        tokio::spawn(
            async move {
                match events_client.events_bytes(&attempt, &query).await {
                    Ok(observable) => {
                        tracing::info!("Resubscribed to events.");
                        let observer = observable.subscribe(&attempt);
                        forwarder.run(attempt, observer, err_tx).await;
                    }
                    // Nothing to resubscribe to; closing the channel ends the retries.
                    Err(EventsQueryError::ClientClosed) => drop(err_tx),
                    Err(e) => {
                        let _ = err_tx.send(e).await;
                    }
                }
            }
            .instrument(self.span.clone()),
        );
        err_rx
    }

    fn forward(
        &self,
        attempt: CancellationToken,
        observer: Observer<EventsBytes>,
    ) -> mpsc::Receiver<EventsQueryError> {
        let (err_tx, err_rx) = mpsc::channel(1);
        let forwarder = self.forwarder();
        tokio::spawn(
            async move { forwarder.run(attempt, observer, err_tx).await }
                .instrument(self.span.clone()),
        );
        err_rx
    }

    fn forwarder(&self) -> Forwarder<T> {
        Forwarder {
            query: self.query.clone(),
            decode: self.decode.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

/// Decodes the frames of one subscription attempt and republishes them.
struct Forwarder<T: Clone + Send + Sync + 'static> {
    query: String,
    decode: DecodeFn<T>,
    publisher: Arc<Publisher<T>>,
}

impl<T> Forwarder<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(
        self,
        attempt: CancellationToken,
        mut observer: Observer<EventsBytes>,
        err_tx: mpsc::Sender<EventsQueryError>,
    ) {
        let _cancel_on_exit = attempt.clone().drop_guard();
        loop {
            tokio::select! {
                _ = attempt.cancelled() => return,
                next = observer.recv() => match next {
                    Some(Ok(frame)) => match (self.decode)(&frame) {
                        Ok(event) => self.publisher.publish(event),
                        Err(e) => tracing::debug!(error = %e, "Skipping undecodable event."),
                    },
                    Some(Err(e)) => {
                        let _ = err_tx.send(e).await;
                        return;
                    }
                    None => {
                        let _ = err_tx
                            .send(EventsQueryError::ObservableClosed(self.query.clone()))
                            .await;
                        return;
                    }
                },
            }
        }
    }
}
