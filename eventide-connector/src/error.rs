use thiserror::Error;

/// Failures at the socket boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("Failed to dial {url}: {reason}")]
    Dial { url: String, reason: String },

    #[error("Failed to send frame: {0}")]
    Send(String),

    #[error("Failed to receive frame: {0}")]
    Receive(String),

    #[error("Connection closed")]
    Closed,

    #[error("Dial cancelled")]
    Cancelled,
}

/// Errors of the event subscription client.
///
/// These are cloned into every observer of a query, so they carry owned data only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventsQueryError {
    #[error("Failed to dial events endpoint: {0}")]
    Dial(TransportError),

    #[error("Failed to subscribe to query '{query}': {source}")]
    Subscribe {
        query: String,
        source: TransportError,
    },

    #[error("Events connection for query '{query}' closed: {source}")]
    ConnectionClosed {
        query: String,
        source: TransportError,
    },

    #[error("Events observable for query '{0}' closed")]
    ObservableClosed(String),

    #[error("Events query client is closed")]
    ClientClosed,
}

/// A frame that could not be turned into a typed event. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed JSON-RPC message: {0}")]
    Json(String),

    #[error("JSON-RPC error response: {0}")]
    Rpc(String),

    #[error("Empty JSON-RPC result")]
    EmptyResult,

    #[error("Message is not a {expected} event")]
    UnexpectedEvent { expected: &'static str },

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Json(err.to_string())
    }
}

/// A message that failed basic validation, by position in the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgValidationError {
    pub index: usize,
    pub reason: String,
}

impl std::fmt::Display for MsgValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "in msg with index {}: {}", self.index, self.reason)
    }
}

fn join_msg_errors(errors: &[MsgValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors of the transaction client, both synchronous and asynchronous.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("Invalid messages: {}", join_msg_errors(.0))]
    InvalidMsgs(Vec<MsgValidationError>),

    #[error("Gas simulation failed: {0}")]
    Simulate(String),

    #[error("Failed to build transaction: {0}")]
    Build(String),

    #[error("No committed block is available to compute the timeout height")]
    NoLatestBlock,

    #[error("Failed to sign transaction: {0}")]
    Sign(String),

    #[error("Invalid signed transaction: {0}")]
    InvalidTx(String),

    #[error("Failed to encode transaction: {0}")]
    Encode(String),

    #[error("Failed to broadcast transaction: {0}")]
    Broadcast(String),

    #[error("Transaction rejected with code {code}: {raw_log}")]
    CheckTx { code: u32, raw_log: String },

    #[error("Transaction timed out with hash {hash}: {log}")]
    Timeout { hash: String, log: String },

    #[error("Failed to query transaction with hash {hash}: {reason}")]
    QueryTx { hash: String, reason: String },

    #[error("Invalid transaction hash '{0}'")]
    InvalidTxHash(String),

    #[error("Invalid gas price '{0}'")]
    InvalidGasPrice(String),

    #[error("Signing key name is empty")]
    EmptySigningKeyName,

    #[error("No signing key named '{0}'")]
    NoSuchSigningKey(String),

    #[error("Failed to resolve signing key '{name}': {reason}")]
    SigningKey { name: String, reason: String },

    #[error("Failed to subscribe to own transactions: {0}")]
    Subscribe(EventsQueryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_msgs_lists_every_failure() {
        let err = TxError::InvalidMsgs(vec![
            MsgValidationError {
                index: 0,
                reason: "empty sender".to_string(),
            },
            MsgValidationError {
                index: 2,
                reason: "zero amount".to_string(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "Invalid messages: in msg with index 0: empty sender; in msg with index 2: zero amount"
        );
    }
}
