//! Client-side event subscriptions and transaction lifecycle tracking for
//! Tendermint-style nodes.
//!
//! This crate talks to a node's websocket JSON-RPC endpoint, turns pushed event
//! frames into typed, replayable streams, and follows broadcast transactions until
//! they are committed or time out.
//!
//! # Key Components
//!
//! *   [`events_query::QueryClient`]: one websocket subscription per distinct query,
//!     shared by every caller, published as an observable of raw frames or errors.
//! *   [`replay::EventsReplayClient`]: decodes one query's frames into typed events
//!     and keeps a stable replay observable across reconnections.
//! *   [`block::ReplayBlockClient`]: the latest committed block, built on the replay
//!     client.
//! *   [`tx::TxClient`]: signs and broadcasts transactions and resolves each one's
//!     outcome (committed or timed out) asynchronously.
pub mod block;
/// Configuration structures and loading.
pub mod config;
pub mod error;
/// The event subscription client.
pub mod events_query;
/// Typed, replayable event streams with automatic resubscription.
pub mod replay;
/// JSON-RPC envelopes and well-known queries.
pub mod rpc;
pub mod transport;
/// The transaction lifecycle client.
pub mod tx;

pub use block::{Block, BlockClient, ReplayBlockClient};
pub use config::{load_config, ClientConfig};
pub use error::{DecodeError, EventsQueryError, TransportError, TxError};
pub use events_query::{EventsQueryClient, QueryClient};
pub use replay::EventsReplayClient;
pub use tx::TxClient;
