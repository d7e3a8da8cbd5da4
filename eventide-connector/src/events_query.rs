//! # Event Subscription Client
//!
//! [`QueryClient`] multiplexes event subscriptions over websocket connections, one
//! connection per distinct query string. Every subscription is published as an
//! [`Observable`] of raw frames or errors, shared by all callers asking for the
//! same query.
//!
//! ## Lifecycle of a subscription
//! 1. The first [`EventsQueryClient::events_bytes`] call for a query dials the node
//!    and sends the `subscribe` request while holding the subscription map lock, so
//!    concurrent callers cannot open duplicate subscriptions. The caller's context
//!    and [`EventsQueryClient::close`] both abort a dial that is still in flight.
//! 2. A reader task publishes each received frame as `Ok(bytes)`.
//! 3. When the read fails, the reader publishes one
//!    [`EventsQueryError::ConnectionClosed`] (unless the subscription's own context
//!    was cancelled) and tears the subscription down.
//! 4. Cancelling the caller's context, or [`EventsQueryClient::close`], also tears
//!    the subscription down and closes its observable.
//!
//! The client never reconnects on its own. Callers that need a resilient stream wrap
//! it in an [`crate::replay::EventsReplayClient`].

use crate::{
    config::ClientConfig,
    error::{EventsQueryError, TransportError},
    rpc,
    transport::{Connection, Dialer, WebsocketDialer},
};
use async_trait::async_trait;
use eventide_observable::{Either, Observable, Publisher, DEFAULT_OBSERVER_BUFFER};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// A raw event frame, or the error that ended its subscription.
pub type EventsBytes = Either<Vec<u8>, EventsQueryError>;
pub type EventsBytesObservable = Observable<EventsBytes>;

/// Subscribes to node events by query string.
#[async_trait]
pub trait EventsQueryClient: Send + Sync {
    /// Returns the observable for `query`, opening a subscription only if there is
    /// no live one yet.
    async fn events_bytes(
        &self,
        ctx: &CancellationToken,
        query: &str,
    ) -> Result<EventsBytesObservable, EventsQueryError>;

    /// Tears down every subscription. Safe to call more than once.
    async fn close(&self);
}

/// The default [`EventsQueryClient`].
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    dialer: Arc<dyn Dialer>,
    observer_buffer: usize,
    span: Span,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_conn_id: AtomicU64,
    closing: CancellationToken,
}

struct Subscription {
    observable: EventsBytesObservable,
    conn: Arc<dyn Connection>,
    token: CancellationToken,
    conn_id: u64,
}

pub struct QueryClientBuilder {
    url: String,
    dialer: Option<Arc<dyn Dialer>>,
    observer_buffer: usize,
    span: Option<Span>,
}

impl QueryClientBuilder {
    /// Replaces the default websocket dialer.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Per-observer buffer of every subscription observable.
    pub fn observer_buffer(mut self, capacity: usize) -> Self {
        self.observer_buffer = capacity;
        self
    }

    /// Parent span for the client's log records and background tasks.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> QueryClient {
        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("events_query_client", url = %self.url));
        QueryClient {
            inner: Arc::new(Inner {
                url: self.url,
                dialer: self.dialer.unwrap_or_else(|| Arc::new(WebsocketDialer)),
                observer_buffer: self.observer_buffer,
                span,
                subscriptions: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                closing: CancellationToken::new(),
            }),
        }
    }
}

impl QueryClient {
    /// Starts building a client for the websocket endpoint at `url`.
    pub fn builder(url: impl Into<String>) -> QueryClientBuilder {
        QueryClientBuilder {
            url: url.into(),
            dialer: None,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            span: None,
        }
    }

    /// Starts building a client for the node and buffer settings of `config`.
    pub fn from_config(config: &ClientConfig) -> QueryClientBuilder {
        Self::builder(config.node.websocket_url.clone())
            .observer_buffer(config.events.observer_buffer)
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// The number of live query subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }
}

#[async_trait]
impl EventsQueryClient for QueryClient {
    async fn events_bytes(
        &self,
        ctx: &CancellationToken,
        query: &str,
    ) -> Result<EventsBytesObservable, EventsQueryError> {
        let inner = &self.inner;
        let mut subscriptions = inner.subscriptions.lock().await;

        if inner.closing.is_cancelled() {
            return Err(EventsQueryError::ClientClosed);
        }

        if let Some(existing) = subscriptions.get(query) {
            if !existing.token.is_cancelled() {
                return Ok(existing.observable.clone());
            }
            // Cancelled but its reader has not cleaned up yet.
            if let Some(stale) = subscriptions.remove(query) {
                stale.observable.unsubscribe_all();
            }
        }

        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let opening = inner
            .open_subscription(ctx, query)
            .instrument(tracing::debug_span!(parent: &inner.span, "subscribe", query, conn_id));
        let conn = tokio::select! {
            _ = inner.closing.cancelled() => return Err(EventsQueryError::ClientClosed),
            _ = ctx.cancelled() => return Err(EventsQueryError::Dial(TransportError::Cancelled)),
            opened = opening => opened?,
        };

        let token = ctx.child_token();
        let (observable, publisher) = Observable::with_buffer(inner.observer_buffer);
        subscriptions.insert(
            query.to_string(),
            Subscription {
                observable: observable.clone(),
                conn: conn.clone(),
                token: token.clone(),
                conn_id,
            },
        );
        drop(subscriptions);

        tracing::info!(parent: &inner.span, query, conn_id, "Subscribed to events.");

        let reader_span = tracing::debug_span!(parent: &inner.span, "read_events", query, conn_id);
        tokio::spawn(
            read_events(
                self.inner.clone(),
                query.to_string(),
                conn,
                publisher,
                token,
                conn_id,
            )
            .instrument(reader_span),
        );

        Ok(observable)
    }

    async fn close(&self) {
        let inner = &self.inner;
        // Cancelled before locking, so a dial holding the lock gives way.
        inner.closing.cancel();
        let drained: Vec<(String, Subscription)> =
            inner.subscriptions.lock().await.drain().collect();

        for (query, subscription) in drained {
            subscription.token.cancel();
            subscription.observable.unsubscribe_all();
            if let Err(e) = subscription.conn.close().await {
                tracing::debug!(parent: &inner.span, query = %query, error = %e, "Error while closing connection.");
            }
            tracing::info!(
                parent: &inner.span,
                query = %query,
                conn_id = subscription.conn_id,
                "Unsubscribed from events."
            );
        }
    }
}

impl Inner {
    /// Dials the node and sends the subscribe request for `query`.
    ///
    /// A connection whose subscribe request fails is closed before returning.
    async fn open_subscription(
        &self,
        ctx: &CancellationToken,
        query: &str,
    ) -> Result<Arc<dyn Connection>, EventsQueryError> {
        let request = rpc::subscribe_request(query).map_err(|e| EventsQueryError::Subscribe {
            query: query.to_string(),
            source: TransportError::Send(e.to_string()),
        })?;

        let conn = self
            .dialer
            .dial(ctx, &self.url)
            .await
            .map_err(EventsQueryError::Dial)?;

        if let Err(source) = conn.send(request).await {
            if let Err(close_err) = conn.close().await {
                tracing::warn!(error = %close_err, "Failed to close connection after subscribe failure.");
            }
            return Err(EventsQueryError::Subscribe {
                query: query.to_string(),
                source,
            });
        }

        tracing::debug!(url = %self.url, "Connection established.");
        Ok(conn)
    }

    /// Removes the subscription for `query` if it still belongs to `conn_id`.
    async fn remove_subscription(&self, query: &str, conn_id: u64) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions
            .get(query)
            .is_some_and(|subscription| subscription.conn_id == conn_id)
        {
            if let Some(subscription) = subscriptions.remove(query) {
                subscription.observable.unsubscribe_all();
                tracing::info!(query, conn_id, "Unsubscribed from events.");
            }
        }
    }
}

async fn read_events(
    inner: Arc<Inner>,
    query: String,
    conn: Arc<dyn Connection>,
    publisher: Publisher<EventsBytes>,
    token: CancellationToken,
    conn_id: u64,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = conn.receive() => match received {
                Ok(frame) => publisher.publish(Ok(frame)),
                Err(source) => {
                    // A read that fails because we cancelled is not an error.
                    if !token.is_cancelled() {
                        tracing::warn!(error = %source, "Events connection lost.");
                        publisher.publish(Err(EventsQueryError::ConnectionClosed {
                            query: query.clone(),
                            source,
                        }));
                    }
                    break;
                }
            },
        }
    }

    token.cancel();
    if let Err(e) = conn.close().await {
        tracing::debug!(error = %e, "Error while closing connection.");
    }
    inner.remove_subscription(&query, conn_id).await;
    // Dropping the publisher closes the observable for every observer.
    drop(publisher);
}
