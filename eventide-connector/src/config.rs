use anyhow::{Context, Result};
use eventide_logger::LogConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::{
    replay::{
        DEFAULT_CONN_RETRY_LIMIT, DEFAULT_MAX_RETRY_DELAY, DEFAULT_REPLAY_BUFFER_SIZE,
        DEFAULT_RETRY_DELAY, DEFAULT_RETRY_RESET_TIMEOUT,
    },
    tx::{DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET, DEFAULT_GAS_PRICE},
};
use eventide_observable::DEFAULT_OBSERVER_BUFFER;

/// The top-level configuration of an eventide client.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub tx: TxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Node connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    pub websocket_url: String,
}

/// Event subscription settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct EventsConfig {
    /// How many recent events a replay client keeps for late observers.
    pub replay_buffer_size: usize,
    /// Per-observer buffer; values for a full observer are dropped.
    pub observer_buffer: usize,
    /// Consecutive resubscriptions before a replay client starts over. Negative
    /// means no limit.
    pub conn_retry_limit: i64,
    pub retry_delay_ms: u64,
    /// Ceiling of the reconnect delay, which grows by half after every retry.
    pub max_retry_delay_ms: u64,
    pub retry_reset_timeout_ms: u64,
}

/// Transaction client settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TxConfig {
    pub signing_key_name: String,
    pub commit_timeout_height_offset: i64,
    /// Decimal amount followed by a denom, e.g. "0.000001upokt".
    pub gas_price: String,
    pub memo: String,
}

impl EventsConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn retry_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_reset_timeout_ms)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            websocket_url: "ws://127.0.0.1:26657/websocket".to_string(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            replay_buffer_size: DEFAULT_REPLAY_BUFFER_SIZE,
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            conn_retry_limit: DEFAULT_CONN_RETRY_LIMIT,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
            max_retry_delay_ms: DEFAULT_MAX_RETRY_DELAY.as_millis() as u64,
            retry_reset_timeout_ms: DEFAULT_RETRY_RESET_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            signing_key_name: String::new(),
            commit_timeout_height_offset: DEFAULT_COMMIT_TIMEOUT_HEIGHT_OFFSET as i64,
            gas_price: DEFAULT_GAS_PRICE.to_string(),
            memo: String::new(),
        }
    }
}

/// Prefix of the environment variables that override the config file.
pub const ENV_PREFIX: &str = "EVENTIDE";

/// Loads the client configuration from a TOML file, with overrides from
/// `EVENTIDE__<SECTION>__<KEY>` environment variables.
pub fn load_config(path: &str) -> Result<ClientConfig> {
    load_config_with_env_prefix(path, ENV_PREFIX)
}

/// Like [`load_config`], reading overrides from `<env_prefix>__<SECTION>__<KEY>`.
pub fn load_config_with_env_prefix(path: &str, env_prefix: &str) -> Result<ClientConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix(env_prefix).separator("__"));

    let settings: ClientConfig = builder
        .build()
        .context(format!("Failed to build configuration from '{}'", path))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}
