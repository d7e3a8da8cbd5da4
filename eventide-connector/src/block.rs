//! Committed blocks, decoded from `NewBlock` events.

use crate::{
    error::{DecodeError, EventsQueryError},
    events_query::EventsQueryClient,
    replay::{EventsReplayClient, EventsReplayClientBuilder},
    rpc::{self, EventResult},
};
use async_trait::async_trait;
use eventide_observable::ReplayObservable;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const NEW_BLOCK_EVENT_TYPE: &str = "tendermint/event/NewBlock";

/// A committed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: i64,
    pub hash: String,
}

/// Source of committed blocks.
#[async_trait]
pub trait BlockClient: Send + Sync {
    /// Committed blocks in commit order. Late observers get the latest block first.
    fn committed_blocks_sequence(&self) -> ReplayObservable<Block>;

    /// The latest committed block, waiting for one if none has been seen yet.
    /// `None` if `ctx` is cancelled first or the client is closed.
    async fn last_block(&self, ctx: &CancellationToken) -> Option<Block>;

    async fn close(&self);
}

#[derive(Deserialize)]
struct NewBlockValue {
    block: RawBlock,
    block_id: RawBlockId,
}

#[derive(Deserialize)]
struct RawBlock {
    header: RawHeader,
}

#[derive(Deserialize)]
struct RawHeader {
    height: String,
}

#[derive(Deserialize)]
struct RawBlockId {
    hash: String,
}

/// Decodes a `NewBlock` event frame.
pub fn decode_block(frame: &[u8]) -> Result<Block, DecodeError> {
    let result: EventResult<serde_json::Value> = rpc::parse_result(frame)?;
    if result.data.kind != NEW_BLOCK_EVENT_TYPE {
        return Err(DecodeError::UnexpectedEvent {
            expected: NEW_BLOCK_EVENT_TYPE,
        });
    }

    let value: NewBlockValue = serde_json::from_value(result.data.value)?;
    Ok(Block {
        height: rpc::parse_int("block.header.height", &value.block.header.height)?,
        hash: value.block_id.hash,
    })
}

/// The default [`BlockClient`]: a replay client over `tm.event='NewBlock'` that
/// keeps only the latest block.
pub struct ReplayBlockClient {
    events: EventsReplayClient<Block>,
}

impl ReplayBlockClient {
    /// A replay client builder preset for blocks. Retry settings may still be
    /// changed before building.
    pub fn builder() -> EventsReplayClientBuilder<Block> {
        EventsReplayClient::builder(rpc::NEW_BLOCK_QUERY, decode_block).buffer_size(1)
    }

    pub async fn new(
        ctx: &CancellationToken,
        events_client: Arc<dyn EventsQueryClient>,
    ) -> Result<Self, EventsQueryError> {
        Self::from_builder(ctx, events_client, Self::builder()).await
    }

    pub async fn from_builder(
        ctx: &CancellationToken,
        events_client: Arc<dyn EventsQueryClient>,
        builder: EventsReplayClientBuilder<Block>,
    ) -> Result<Self, EventsQueryError> {
        Ok(Self {
            events: builder.build(ctx, events_client).await?,
        })
    }
}

#[async_trait]
impl BlockClient for ReplayBlockClient {
    fn committed_blocks_sequence(&self) -> ReplayObservable<Block> {
        self.events.events_sequence()
    }

    async fn last_block(&self, ctx: &CancellationToken) -> Option<Block> {
        self.events.last_n_events(ctx, 1).await.pop()
    }

    async fn close(&self) {
        self.events.close().await;
    }
}
