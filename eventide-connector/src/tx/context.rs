//! The chain-specific capabilities the transaction client is built on.
//!
//! [`TxContext`] hides key management, gas simulation, signing, encoding and the
//! node's broadcast and query endpoints behind one trait, so the lifecycle logic in
//! [`super::TxClient`] stays independent of any particular chain SDK.

use crate::error::TxError;
use async_trait::async_trait;
use std::{fmt, str::FromStr};

/// A transaction message.
pub trait Msg: Send + Sync + fmt::Debug {
    /// The fully qualified type URL, e.g. `/cosmos.bank.v1beta1.MsgSend`.
    fn type_url(&self) -> &str;

    /// Stateless checks run before anything is simulated or signed.
    fn validate_basic(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub denom: String,
    pub amount: u128,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Decimals beyond this would overflow the fee arithmetic.
const MAX_GAS_PRICE_DECIMALS: u32 = 18;

/// A decimal price per unit of gas, such as `0.000001upokt`.
///
/// Kept as an integer mantissa and a decimal scale so fees are computed exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasPrice {
    mantissa: u128,
    scale: u32,
    denom: String,
}

impl GasPrice {
    pub fn denom(&self) -> &str {
        &self.denom
    }

    /// The fee for `gas` units: the exact product rounded up to a whole unit.
    /// `None` on overflow.
    pub fn fee_for(&self, gas: u64) -> Option<Coin> {
        let product = u128::from(gas).checked_mul(self.mantissa)?;
        let divisor = 10u128.checked_pow(self.scale)?;
        let mut amount = product / divisor;
        if product % divisor != 0 {
            amount = amount.checked_add(1)?;
        }
        Some(Coin {
            denom: self.denom.clone(),
            amount,
        })
    }
}

impl FromStr for GasPrice {
    type Err = TxError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || TxError::InvalidGasPrice(raw.to_string());

        let trimmed = raw.trim();
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        let (number, denom) = trimmed.split_at(split);
        if number.is_empty() || !denom.starts_with(|c: char| c.is_ascii_alphabetic()) {
            return Err(invalid());
        }

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let scale = u32::try_from(fraction.len()).map_err(|_| invalid())?;
        if scale > MAX_GAS_PRICE_DECIMALS {
            return Err(invalid());
        }
        let mantissa = format!("{whole}{fraction}")
            .parse::<u128>()
            .map_err(|_| invalid())?;

        Ok(Self {
            mantissa,
            scale,
            denom: denom.to_string(),
        })
    }
}

impl fmt::Display for GasPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = format!("{:0>width$}", self.mantissa, width = self.scale as usize + 1);
        let (whole, fraction) = digits.split_at(digits.len() - self.scale as usize);
        if fraction.is_empty() {
            write!(f, "{whole}{}", self.denom)
        } else {
            write!(f, "{whole}.{fraction}{}", self.denom)
        }
    }
}

/// A transaction ready to be signed.
#[derive(Debug)]
pub struct UnsignedTx {
    pub msgs: Vec<Box<dyn Msg>>,
    pub gas_limit: u64,
    pub fee: Coin,
    /// The last height at which the transaction may be included.
    pub timeout_height: u64,
    pub memo: String,
}

#[derive(Debug)]
pub struct SignedTx {
    pub unsigned: UnsignedTx,
    pub signatures: Vec<Vec<u8>>,
}

impl SignedTx {
    /// Stateless checks on the signed envelope.
    pub fn validate_basic(&self) -> Result<(), TxError> {
        if self.unsigned.msgs.is_empty() {
            return Err(TxError::InvalidTx("transaction has no messages".to_string()));
        }
        if self.signatures.is_empty() || self.signatures.iter().any(Vec::is_empty) {
            return Err(TxError::InvalidTx("transaction is not signed".to_string()));
        }
        if self.unsigned.timeout_height == 0 {
            return Err(TxError::InvalidTx("timeout height is not set".to_string()));
        }
        Ok(())
    }
}

/// The node's synchronous admission answer to a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResponse {
    pub code: u32,
    pub raw_log: String,
    /// Hex encoded, in whatever case the node uses.
    pub tx_hash: String,
}

/// The status of a transaction looked up by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxResult {
    pub height: i64,
    pub code: u32,
    pub log: String,
}

/// Keyring, signer and node endpoints used by [`super::TxClient`].
#[async_trait]
pub trait TxContext: Send + Sync {
    /// The address of the key called `key_name`, or `None` if no such key exists.
    async fn key_address(&self, key_name: &str) -> anyhow::Result<Option<String>>;

    /// Gas needed to execute `msgs` signed by `key_name`.
    async fn simulate_gas(&self, key_name: &str, msgs: &[Box<dyn Msg>]) -> anyhow::Result<u64>;

    async fn sign(&self, key_name: &str, tx: UnsignedTx) -> anyhow::Result<SignedTx>;

    fn encode_tx(&self, tx: &SignedTx) -> anyhow::Result<Vec<u8>>;

    /// Broadcasts in sync mode: returns once the node has run its admission checks.
    async fn broadcast_tx(&self, tx_bytes: Vec<u8>) -> anyhow::Result<TxResponse>;

    async fn query_tx(&self, hash: &[u8]) -> anyhow::Result<TxResult>;
}
