//! # Transaction Lifecycle Client
//!
//! [`TxClient`] signs and broadcasts transactions, then tracks each one until it is
//! either observed in a committed block or its timeout height passes.
//!
//! ## Flow
//! 1. [`TxClient::sign_and_broadcast`] validates, simulates, builds, signs, encodes and
//!    broadcasts. Any failure up to and including node admission is returned as
//!    [`AsyncError::Sync`].
//! 2. An admitted transaction is registered by hash and the caller gets
//!    [`AsyncError::Async`] with a handle to the eventual outcome.
//! 3. A background task watches the signer's own committed transactions and
//!    resolves matching handles with no error.
//! 4. Another task watches committed blocks. Every transaction whose timeout height
//!    has been reached is looked up by hash and resolved with [`TxError::Timeout`].
//!
//! Steps 3 and 4 race for the same records. Each record is removed under one lock by
//! whichever gets there first, so every handle resolves exactly once.

mod context;
mod event;
mod pending;

pub use context::{
    Coin, GasPrice, Msg, SignedTx, TxContext, TxResponse, TxResult, UnsignedTx,
};
pub use event::{decode_tx_event, tx_hash_hex, TxEvent};

use crate::{
    block::{Block, BlockClient},
    config::{EventsConfig, TxConfig},
    error::{MsgValidationError, TxError},
    events_query::EventsQueryClient,
    replay::EventsReplayClient,
    rpc,
};
use eventide_observable::{AsyncError, ErrorHandle, ErrorSender, Observer};
use pending::PendingTxs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

pub const DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET: u64 = 5;
pub const DEFAULT_GAS_PRICE: &str = "0.000001upokt";

pub struct TxClientBuilder {
    signing_key_name: String,
    commit_timeout_height_offset: i64,
    gas_price: String,
    memo: String,
    events: Option<EventsConfig>,
    span: Option<Span>,
}

impl TxClientBuilder {
    /// Name of the keyring entry that signs every transaction.
    pub fn signing_key_name(mut self, name: impl Into<String>) -> Self {
        self.signing_key_name = name.into();
        self
    }

    /// How many blocks past the latest one a transaction stays valid. Values of
    /// zero or less fall back to [`DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET`].
    pub fn commit_timeout_height_offset(mut self, offset: i64) -> Self {
        self.commit_timeout_height_offset = offset;
        self
    }

    pub fn gas_price(mut self, gas_price: impl Into<String>) -> Self {
        self.gas_price = gas_price.into();
        self
    }

    pub fn memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    /// Buffer and retry settings for the own-transactions subscription.
    pub fn events_config(mut self, config: EventsConfig) -> Self {
        self.events = Some(config);
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Applies every setting of a `[tx]` config section.
    pub fn from_config(self, config: &TxConfig) -> Self {
        self.signing_key_name(config.signing_key_name.clone())
            .commit_timeout_height_offset(config.commit_timeout_height_offset)
            .gas_price(config.gas_price.clone())
            .memo(config.memo.clone())
    }

    /// Resolves the signing key, subscribes to the signer's committed transactions
    /// and starts tracking commits and timeouts.
    pub async fn build(
        self,
        ctx: &CancellationToken,
        tx_ctx: Arc<dyn TxContext>,
        events_client: Arc<dyn EventsQueryClient>,
        block_client: Arc<dyn BlockClient>,
    ) -> Result<TxClient, TxError> {
        if self.signing_key_name.is_empty() {
            return Err(TxError::EmptySigningKeyName);
        }
        let gas_price: GasPrice = self.gas_price.parse()?;

        let signing_address = tx_ctx
            .key_address(&self.signing_key_name)
            .await
            .map_err(|e| TxError::SigningKey {
                name: self.signing_key_name.clone(),
                reason: format!("{e:#}"),
            })?
            .ok_or_else(|| TxError::NoSuchSigningKey(self.signing_key_name.clone()))?;

        let commit_timeout_height_offset = u64::try_from(self.commit_timeout_height_offset)
            .ok()
            .filter(|offset| *offset > 0)
            .unwrap_or(DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET);

        let span = self.span.unwrap_or_else(|| {
            tracing::info_span!(
                "tx_client",
                signing_key = %self.signing_key_name,
                address = %signing_address
            )
        });
        let token = ctx.child_token();

        let mut own_txs = EventsReplayClient::builder(
            rpc::tx_with_sender_query(&signing_address),
            decode_tx_event,
        )
        .span(span.clone());
        if let Some(config) = &self.events {
            own_txs = own_txs
                .buffer_size(config.replay_buffer_size)
                .with_config(config);
        }
        let own_txs = own_txs
            .build(&token, events_client)
            .await
            .map_err(TxError::Subscribe)?;

        let pending = Arc::new(PendingTxs::default());
        let commits = own_txs.events_sequence().subscribe(&token);
        let blocks = block_client.committed_blocks_sequence().subscribe(&token);

        tokio::spawn(handle_commits(pending.clone(), commits).instrument(span.clone()));
        tokio::spawn(
            sweep_timeouts(pending.clone(), tx_ctx.clone(), blocks, token.clone())
                .instrument(span.clone()),
        );

        tracing::info!(
            parent: &span,
            commit_timeout_height_offset,
            gas_price = %gas_price,
            "Transaction client started."
        );

        Ok(TxClient {
            tx_ctx,
            block_client,
            signing_key_name: self.signing_key_name,
            signing_address,
            commit_timeout_height_offset,
            gas_price,
            memo: self.memo,
            pending,
            token,
            span,
        })
    }
}

/// Signs, broadcasts and tracks transactions for one signing key.
pub struct TxClient {
    tx_ctx: Arc<dyn TxContext>,
    block_client: Arc<dyn BlockClient>,
    signing_key_name: String,
    signing_address: String,
    commit_timeout_height_offset: u64,
    gas_price: GasPrice,
    memo: String,
    pending: Arc<PendingTxs>,
    token: CancellationToken,
    span: Span,
}

impl TxClient {
    pub fn builder() -> TxClientBuilder {
        TxClientBuilder {
            signing_key_name: String::new(),
            commit_timeout_height_offset: DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET as i64,
            gas_price: DEFAULT_GAS_PRICE.to_string(),
            memo: String::new(),
            events: None,
            span: None,
        }
    }

    pub fn signing_address(&self) -> &str {
        &self.signing_address
    }

    pub fn commit_timeout_height_offset(&self) -> u64 {
        self.commit_timeout_height_offset
    }

    /// Signs and broadcasts `msgs` as one transaction.
    ///
    /// Returns [`AsyncError::Sync`] if the transaction never reached the mempool.
    /// Otherwise the returned handle resolves to `None` once the transaction is
    /// committed, or to [`TxError::Timeout`] once its timeout height passes first.
    /// If the client is closed before either happens, the handle never resolves.
    pub async fn sign_and_broadcast(
        &self,
        ctx: &CancellationToken,
        msgs: Vec<Box<dyn Msg>>,
    ) -> AsyncError<TxError> {
        match self
            .broadcast(ctx, msgs)
            .instrument(self.span.clone())
            .await
        {
            Ok(handle) => AsyncError::Async(handle),
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "Transaction was not broadcast.");
                AsyncError::Sync(e)
            }
        }
    }

    async fn broadcast(
        &self,
        ctx: &CancellationToken,
        msgs: Vec<Box<dyn Msg>>,
    ) -> Result<ErrorHandle<TxError>, TxError> {
        validate_msgs(&msgs)?;

        let gas_limit = self
            .tx_ctx
            .simulate_gas(&self.signing_key_name, &msgs)
            .await
            .map_err(|e| TxError::Simulate(format!("{e:#}")))?;

        let latest = self
            .block_client
            .last_block(ctx)
            .await
            .ok_or(TxError::NoLatestBlock)?;
        let timeout_height = self.timeout_height(&latest)?;

        let fee = self.gas_price.fee_for(gas_limit).ok_or_else(|| {
            TxError::Build(format!(
                "fee for {gas_limit} gas at {} overflows",
                self.gas_price
            ))
        })?;

        let unsigned = UnsignedTx {
            msgs,
            gas_limit,
            fee,
            timeout_height,
            memo: self.memo.clone(),
        };
        let signed = self
            .tx_ctx
            .sign(&self.signing_key_name, unsigned)
            .await
            .map_err(|e| TxError::Sign(format!("{e:#}")))?;
        signed.validate_basic()?;

        let tx_bytes = self
            .tx_ctx
            .encode_tx(&signed)
            .map_err(|e| TxError::Encode(format!("{e:#}")))?;

        let response = self
            .tx_ctx
            .broadcast_tx(tx_bytes)
            .await
            .map_err(|e| TxError::Broadcast(format!("{e:#}")))?;
        if response.code != 0 {
            return Err(TxError::CheckTx {
                code: response.code,
                raw_log: response.raw_log,
            });
        }

        let tx_hash = response.tx_hash.to_lowercase();
        if tx_hash.is_empty() || hex::decode(&tx_hash).is_err() {
            return Err(TxError::InvalidTxHash(response.tx_hash));
        }

        tracing::info!(
            tx_hash = %tx_hash,
            timeout_height,
            gas_limit,
            "Transaction broadcast, waiting for commit."
        );
        Ok(self.pending.register(&tx_hash, timeout_height))
    }

    fn timeout_height(&self, latest: &Block) -> Result<u64, TxError> {
        u64::try_from(latest.height)
            .ok()
            .and_then(|height| height.checked_add(self.commit_timeout_height_offset))
            .ok_or_else(|| {
                TxError::Build(format!("invalid latest block height {}", latest.height))
            })
    }

    /// The number of broadcast transactions still waiting for commit or timeout.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Stops tracking. Handles of transactions still pending never resolve.
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.pending.abandon_all();
        tracing::info!(parent: &self.span, "Transaction client closed.");
    }
}

fn validate_msgs(msgs: &[Box<dyn Msg>]) -> Result<(), TxError> {
    if msgs.is_empty() {
        return Err(TxError::InvalidTx("transaction has no messages".to_string()));
    }

    let failures: Vec<MsgValidationError> = msgs
        .iter()
        .enumerate()
        .filter_map(|(index, msg)| {
            msg.validate_basic().err().map(|e| MsgValidationError {
                index,
                reason: format!("{e:#}"),
            })
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(TxError::InvalidMsgs(failures))
    }
}

async fn handle_commits(pending: Arc<PendingTxs>, mut commits: Observer<TxEvent>) {
    while let Some(event) = commits.recv().await {
        let tx_hash = event.hash();
        if !pending.commit(&tx_hash) {
            tracing::debug!(tx_hash = %tx_hash, height = event.height, "Observed untracked transaction.");
            continue;
        }
        if event.code == 0 {
            tracing::info!(tx_hash = %tx_hash, height = event.height, "Transaction committed.");
        } else {
            tracing::warn!(
                tx_hash = %tx_hash,
                height = event.height,
                code = event.code,
                log = %event.log,
                "Transaction committed with a failed result."
            );
        }
    }
    tracing::debug!("Stopped watching committed transactions.");
}

async fn sweep_timeouts(
    pending: Arc<PendingTxs>,
    tx_ctx: Arc<dyn TxContext>,
    mut blocks: Observer<Block>,
    token: CancellationToken,
) {
    while let Some(block) = blocks.recv().await {
        let Ok(height) = u64::try_from(block.height) else {
            continue;
        };

        for (tx_hash, sender) in pending.expire_up_to(height) {
            tokio::select! {
                // Dropping the sender abandons the handle.
                _ = token.cancelled() => return,
                _ = resolve_timeout(tx_ctx.as_ref(), &tx_hash, height, sender) => {}
            }
        }
    }
    tracing::debug!("Stopped watching for transaction timeouts.");
}

async fn resolve_timeout(
    tx_ctx: &dyn TxContext,
    tx_hash: &str,
    height: u64,
    sender: ErrorSender<TxError>,
) {
    let err = match hex::decode(tx_hash) {
        Err(_) => TxError::InvalidTxHash(tx_hash.to_string()),
        Ok(hash) => match tx_ctx.query_tx(&hash).await {
            Ok(result) => TxError::Timeout {
                hash: tx_hash.to_string(),
                log: result.log,
            },
            Err(e) => TxError::QueryTx {
                hash: tx_hash.to_string(),
                reason: format!("{e:#}"),
            },
        },
    };
    tracing::warn!(tx_hash, height, error = %err, "Transaction timed out.");
    sender.send(err);
}
