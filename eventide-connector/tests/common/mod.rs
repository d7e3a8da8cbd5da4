#![allow(dead_code)]

use async_trait::async_trait;
use base64::{prelude::BASE64_STANDARD, Engine};
use eventide_connector::{
    block::{Block, BlockClient},
    error::TransportError,
    transport::{Connection, Dialer},
    tx::{Msg, SignedTx, TxContext, TxResponse, TxResult, UnsignedTx},
};
use eventide_observable::{Publisher, ReplayObservable};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const NODE_URL: &str = "ws://127.0.0.1:26657/websocket";

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// --- Transport ---

type Incoming = Result<Vec<u8>, TransportError>;

/// An in-memory connection. Frames pushed by the test come out of `receive`.
pub struct MockConnection {
    incoming_tx: mpsc::UnboundedSender<Incoming>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Incoming>>,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: CancellationToken,
    fail_send: bool,
}

impl MockConnection {
    fn new(fail_send: bool) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            sent: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
            fail_send,
        })
    }

    pub fn push(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.incoming_tx.send(Ok(frame.into()));
    }

    /// Makes the next `receive` fail.
    pub fn fail(&self, err: TransportError) {
        let _ = self.incoming_tx.send(Err(err));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    /// The query of the subscribe request sent on this connection.
    pub fn subscribed_query(&self) -> Option<String> {
        let sent = self.sent();
        let request: Value = serde_json::from_slice(sent.first()?).ok()?;
        request["params"]["query"].as_str().map(str::to_string)
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(TransportError::Send("broken pipe".to_string()));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut incoming = self.incoming_rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            next = incoming.recv() => next.unwrap_or(Err(TransportError::Closed)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        Ok(())
    }
}

#[derive(Default)]
struct DialerState {
    fail_dial: bool,
    hang_dial: bool,
    fail_send: bool,
    dial_attempts: usize,
    connections: Vec<Arc<MockConnection>>,
}

/// Hands out [`MockConnection`]s and remembers every one of them.
#[derive(Default)]
pub struct MockDialer {
    state: Mutex<DialerState>,
}

impl MockDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_dial(&self, fail: bool) {
        self.state.lock().unwrap().fail_dial = fail;
    }

    /// Dials from now on never complete, whatever their context.
    pub fn set_hang_dial(&self, hang: bool) {
        self.state.lock().unwrap().hang_dial = hang;
    }

    /// Connections dialed from now on reject every send.
    pub fn set_fail_send(&self, fail: bool) {
        self.state.lock().unwrap().fail_send = fail;
    }

    /// Every dial, including the failed and unfinished ones.
    pub fn dial_attempts(&self) -> usize {
        self.state.lock().unwrap().dial_attempts
    }

    pub fn dial_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.state.lock().unwrap().connections[index].clone()
    }

    /// The most recent connection that subscribed to `query`.
    pub fn connection_for(&self, query: &str) -> Option<Arc<MockConnection>> {
        self.state
            .lock()
            .unwrap()
            .connections
            .iter()
            .rev()
            .find(|conn| conn.subscribed_query().as_deref() == Some(query))
            .cloned()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(
        &self,
        _ctx: &CancellationToken,
        url: &str,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.dial_attempts += 1;
            state.hang_dial
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_dial {
            return Err(TransportError::Dial {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let conn = MockConnection::new(state.fail_send);
        state.connections.push(conn.clone());
        Ok(conn)
    }
}

// --- Frames ---

pub fn subscribe_ack() -> Vec<u8> {
    serde_json::to_vec(&json!({"jsonrpc": "2.0", "id": "ack", "result": {}})).unwrap()
}

pub fn new_block_frame(height: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": "sub",
        "result": {
            "query": "tm.event='NewBlock'",
            "data": {
                "type": "tendermint/event/NewBlock",
                "value": {
                    "block": {"header": {"height": height.to_string()}},
                    "block_id": {"hash": format!("BLOCK{height}")}
                }
            }
        }
    }))
    .unwrap()
}

pub fn tx_frame(tx: &[u8], height: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "id": "sub",
        "result": {
            "query": "tm.event='Tx'",
            "data": {
                "type": "tendermint/event/Tx",
                "value": {
                    "TxResult": {
                        "height": height.to_string(),
                        "index": 0,
                        "tx": BASE64_STANDARD.encode(tx),
                        "result": {"code": 0, "log": "[]"}
                    }
                }
            }
        }
    }))
    .unwrap()
}

// --- Blocks ---

/// A block client driven by the test through [`MockBlockClient::advance`].
pub struct MockBlockClient {
    sequence: ReplayObservable<Block>,
    publisher: Publisher<Block>,
}

impl MockBlockClient {
    pub fn new(ctx: &CancellationToken) -> Arc<Self> {
        let (sequence, publisher) = ReplayObservable::new(ctx, 1);
        Arc::new(Self {
            sequence,
            publisher,
        })
    }

    pub fn advance(&self, height: i64) {
        self.publisher.publish(Block {
            height,
            hash: format!("BLOCK{height}"),
        });
    }
}

#[async_trait]
impl BlockClient for MockBlockClient {
    fn committed_blocks_sequence(&self) -> ReplayObservable<Block> {
        self.sequence.clone()
    }

    async fn last_block(&self, ctx: &CancellationToken) -> Option<Block> {
        self.sequence.last(ctx, 1).await.pop()
    }

    async fn close(&self) {}
}

// --- Transactions ---

#[derive(Debug)]
pub struct TestMsg {
    pub valid: bool,
}

impl TestMsg {
    pub fn valid() -> Box<dyn Msg> {
        Box::new(Self { valid: true })
    }

    pub fn invalid() -> Box<dyn Msg> {
        Box::new(Self { valid: false })
    }
}

impl Msg for TestMsg {
    fn type_url(&self) -> &str {
        "/eventide.test.MsgTest"
    }

    fn validate_basic(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.valid, "sender address is empty");
        Ok(())
    }
}

/// What the transaction client put into a signed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedFields {
    pub gas_limit: u64,
    pub fee: String,
    pub timeout_height: u64,
    pub memo: String,
}

struct TxState {
    keys: HashMap<String, String>,
    gas: u64,
    broadcast_code: u32,
    broadcast_log: String,
    query_fails: bool,
    signed: Vec<SignedFields>,
    broadcasts: Vec<Vec<u8>>,
}

/// A keyring with fixed keys and a node that admits every transaction unless told
/// otherwise. Transaction hashes are reported in uppercase, like a real node.
pub struct MockTxContext {
    state: Mutex<TxState>,
}

impl MockTxContext {
    pub fn new(key_name: &str, address: &str) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TxState {
                keys: HashMap::from([(key_name.to_string(), address.to_string())]),
                gas: 200_000,
                broadcast_code: 0,
                broadcast_log: String::new(),
                query_fails: false,
                signed: Vec::new(),
                broadcasts: Vec::new(),
            }),
        })
    }

    pub fn set_gas(&self, gas: u64) {
        self.state.lock().unwrap().gas = gas;
    }

    pub fn reject_broadcasts(&self, code: u32, log: &str) {
        let mut state = self.state.lock().unwrap();
        state.broadcast_code = code;
        state.broadcast_log = log.to_string();
    }

    pub fn set_query_fails(&self, fails: bool) {
        self.state.lock().unwrap().query_fails = fails;
    }

    pub fn broadcasts(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn last_broadcast(&self) -> Vec<u8> {
        self.broadcasts().pop().expect("nothing was broadcast")
    }

    pub fn last_signed(&self) -> SignedFields {
        self.state
            .lock()
            .unwrap()
            .signed
            .last()
            .cloned()
            .expect("nothing was signed")
    }

    /// The hash the client tracks for `tx`: lowercase hex SHA-256.
    pub fn hash_of(tx: &[u8]) -> String {
        hex::encode(Sha256::digest(tx))
    }
}

#[async_trait]
impl TxContext for MockTxContext {
    async fn key_address(&self, key_name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.state.lock().unwrap().keys.get(key_name).cloned())
    }

    async fn simulate_gas(&self, _key_name: &str, _msgs: &[Box<dyn Msg>]) -> anyhow::Result<u64> {
        Ok(self.state.lock().unwrap().gas)
    }

    async fn sign(&self, key_name: &str, tx: UnsignedTx) -> anyhow::Result<SignedTx> {
        let mut state = self.state.lock().unwrap();
        state.signed.push(SignedFields {
            gas_limit: tx.gas_limit,
            fee: tx.fee.to_string(),
            timeout_height: tx.timeout_height,
            memo: tx.memo.clone(),
        });
        let signature = format!("{key_name}-{}", state.signed.len()).into_bytes();
        Ok(SignedTx {
            unsigned: tx,
            signatures: vec![signature],
        })
    }

    fn encode_tx(&self, tx: &SignedTx) -> anyhow::Result<Vec<u8>> {
        let type_urls: Vec<&str> = tx.unsigned.msgs.iter().map(|msg| msg.type_url()).collect();
        Ok(format!(
            "{}|{}|{}|{}|{}",
            type_urls.join(","),
            tx.unsigned.timeout_height,
            tx.unsigned.fee,
            tx.unsigned.memo,
            hex::encode(&tx.signatures[0])
        )
        .into_bytes())
    }

    async fn broadcast_tx(&self, tx_bytes: Vec<u8>) -> anyhow::Result<TxResponse> {
        let mut state = self.state.lock().unwrap();
        let tx_hash = hex::encode_upper(Sha256::digest(&tx_bytes));
        state.broadcasts.push(tx_bytes);
        Ok(TxResponse {
            code: state.broadcast_code,
            raw_log: state.broadcast_log.clone(),
            tx_hash,
        })
    }

    async fn query_tx(&self, hash: &[u8]) -> anyhow::Result<TxResult> {
        anyhow::ensure!(
            !self.state.lock().unwrap().query_fails,
            "tx ({}) not found",
            hex::encode_upper(hash)
        );
        Ok(TxResult {
            height: 0,
            code: 0,
            log: "tx not included before timeout height".to_string(),
        })
    }
}
