//! JSON-RPC 2.0 envelopes exchanged with the node's websocket endpoint.

use crate::error::DecodeError;
use base64::{prelude::BASE64_STANDARD, Engine};
use rand::RngCore;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Query for every committed block.
pub const NEW_BLOCK_QUERY: &str = "tm.event='NewBlock'";

/// Query for committed transactions signed by `sender`.
pub fn tx_with_sender_query(sender: &str) -> String {
    format!("tm.event='Tx' AND message.sender='{sender}'")
}

#[derive(Serialize)]
struct SubscribeRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    id: String,
    params: SubscribeParams<'a>,
}

#[derive(Serialize)]
struct SubscribeParams<'a> {
    query: &'a str,
}

/// Serializes a `subscribe` request for `query` with a fresh random id.
pub fn subscribe_request(query: &str) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&SubscribeRequest {
        jsonrpc: "2.0",
        method: "subscribe",
        id: rand_request_id(),
        params: SubscribeParams { query },
    })
}

/// 8 random bytes, base64 encoded.
fn rand_request_id() -> String {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    BASE64_STANDARD.encode(id)
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<String>,
}

/// Extracts and deserializes the `result` of a JSON-RPC response frame.
///
/// Subscription acknowledgements carry an empty `{}` result and are reported as
/// [`DecodeError::EmptyResult`], like null results and error envelopes.
pub fn parse_result<R: DeserializeOwned>(frame: &[u8]) -> Result<R, DecodeError> {
    let response: RpcResponse = serde_json::from_slice(frame)?;

    if let Some(err) = response.error {
        let detail = err.data.map(|d| format!(" ({d})")).unwrap_or_default();
        return Err(DecodeError::Rpc(format!(
            "code {}: {}{detail}",
            err.code, err.message
        )));
    }

    match response.result {
        None | Some(Value::Null) => Err(DecodeError::EmptyResult),
        Some(Value::Object(fields)) if fields.is_empty() => Err(DecodeError::EmptyResult),
        Some(result) => Ok(serde_json::from_value(result)?),
    }
}

/// The `data` member of a pushed event: a type tag and its payload.
#[derive(Debug, Deserialize)]
pub struct EventData<V> {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: V,
}

/// The `result` of a pushed event frame.
#[derive(Debug, Deserialize)]
pub struct EventResult<V> {
    #[serde(default)]
    pub query: String,
    pub data: EventData<V>,
}

/// Heights and similar integers arrive as JSON strings.
pub(crate) fn parse_int<T: std::str::FromStr>(
    field: &'static str,
    raw: &str,
) -> Result<T, DecodeError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| DecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_has_expected_shape() {
        let frame = subscribe_request(NEW_BLOCK_QUERY).unwrap();
        let request: Value = serde_json::from_slice(&frame).unwrap();

        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "subscribe");
        assert_eq!(request["params"]["query"], "tm.event='NewBlock'");
        let id = request["id"].as_str().unwrap();
        assert_eq!(BASE64_STANDARD.decode(id).unwrap().len(), 8);
    }

    #[test]
    fn empty_and_error_results_are_decode_errors() {
        let ack = br#"{"jsonrpc":"2.0","id":"x","result":{}}"#;
        assert_eq!(parse_result::<Value>(ack), Err(DecodeError::EmptyResult));

        let err = br#"{"jsonrpc":"2.0","id":"x","error":{"code":-32600,"message":"bad query"}}"#;
        assert!(matches!(parse_result::<Value>(err), Err(DecodeError::Rpc(_))));

        assert!(matches!(
            parse_result::<Value>(b"not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn sender_query_interpolates_address() {
        assert_eq!(
            tx_with_sender_query("pokt1abc"),
            "tm.event='Tx' AND message.sender='pokt1abc'"
        );
    }
}
