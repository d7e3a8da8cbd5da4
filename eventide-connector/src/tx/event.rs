//! Committed transactions, decoded from `Tx` events.

use crate::{
    error::DecodeError,
    rpc::{self, EventResult},
};
use base64::{prelude::BASE64_STANDARD, Engine};
use serde::Deserialize;
use sha2::{Digest, Sha256};

const TX_EVENT_TYPE: &str = "tendermint/event/Tx";

/// A transaction included in a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEvent {
    /// The encoded transaction.
    pub tx: Vec<u8>,
    pub height: i64,
    /// Execution result code; 0 is success.
    pub code: u32,
    pub log: String,
}

impl TxEvent {
    /// The transaction hash as the node reports it, normalized to lowercase hex.
    pub fn hash(&self) -> String {
        tx_hash_hex(&self.tx)
    }
}

/// Lowercase hex SHA-256 of an encoded transaction.
pub fn tx_hash_hex(tx: &[u8]) -> String {
    hex::encode(Sha256::digest(tx))
}

#[derive(Deserialize)]
struct TxValue {
    #[serde(rename = "TxResult")]
    tx_result: RawTxResult,
}

#[derive(Deserialize)]
struct RawTxResult {
    height: String,
    tx: String,
    #[serde(default)]
    result: RawExecResult,
}

#[derive(Deserialize, Default)]
struct RawExecResult {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    log: String,
}

/// Decodes a `Tx` event frame.
pub fn decode_tx_event(frame: &[u8]) -> Result<TxEvent, DecodeError> {
    let result: EventResult<serde_json::Value> = rpc::parse_result(frame)?;
    if result.data.kind != TX_EVENT_TYPE {
        return Err(DecodeError::UnexpectedEvent {
            expected: TX_EVENT_TYPE,
        });
    }

    let value: TxValue = serde_json::from_value(result.data.value)?;
    let raw = value.tx_result;
    let tx = BASE64_STANDARD
        .decode(raw.tx.as_bytes())
        .map_err(|e| DecodeError::InvalidField {
            field: "TxResult.tx",
            reason: e.to_string(),
        })?;

    Ok(TxEvent {
        tx,
        height: rpc::parse_int("TxResult.height", &raw.height)?,
        code: raw.result.code,
        log: raw.result.log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_frame(tx_b64: &str) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","id":"x","result":{{"query":"tm.event='Tx'","data":{{"type":"tendermint/event/Tx","value":{{"TxResult":{{"height":"7","index":0,"tx":"{tx_b64}","result":{{"code":0,"log":"ok"}}}}}}}}}}}}"#
        )
    }

    #[test]
    fn decodes_tx_event_and_hashes_bytes() {
        let frame = tx_frame(&BASE64_STANDARD.encode(b"signed-tx"));
        let event = decode_tx_event(frame.as_bytes()).unwrap();

        assert_eq!(event.tx, b"signed-tx");
        assert_eq!(event.height, 7);
        assert_eq!(event.log, "ok");
        assert_eq!(event.hash(), hex::encode(Sha256::digest(b"signed-tx")));
        assert_eq!(event.hash(), event.hash().to_lowercase());
    }

    #[test]
    fn rejects_invalid_base64() {
        let frame = tx_frame("***");
        assert!(matches!(
            decode_tx_event(frame.as_bytes()),
            Err(DecodeError::InvalidField { field: "TxResult.tx", .. })
        ));
    }
}
