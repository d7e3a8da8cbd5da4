//! Process-wide `tracing` subscriber setup for applications built on `eventide`.
//!
//! Library crates in the workspace only emit through `tracing` macros and accept an
//! optional span from their callers; installing a subscriber is left to the
//! application, which does it once at startup with [`init`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs::File, str::FromStr, sync::Mutex};
use tracing::Level;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{self, writer::MakeWriterExt},
    prelude::*,
    Layer, Registry,
};

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file_path: Option<String>,
    /// Extra `EnvFilter` directives, e.g. `eventide_connector=debug`.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            filter: None,
        }
    }
}

/// Parses a level name, falling back to `INFO` for anything unrecognised.
pub fn parse_level(level: &str) -> Level {
    Level::from_str(level.trim()).unwrap_or(Level::INFO)
}

/// Installs the global subscriber described by `config`.
///
/// Fails if the log file cannot be created, the filter directives do not parse,
/// or a global subscriber is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let log_level = parse_level(&config.level);
    let level_filter = LevelFilter::from_level(log_level);

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .parse(config.filter.as_deref().unwrap_or_default())
        .with_context(|| format!("Invalid log filter directives: {:?}", config.filter))?;

    Registry::default()
        .with(output_layer(config, log_level)?.with_filter(env_filter))
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

fn output_layer(
    config: &LogConfig,
    log_level: Level,
) -> Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let layer = match config.output {
        LogOutput::File => {
            let file_path = config.file_path.as_deref().ok_or_else(|| {
                anyhow::anyhow!("Log output is 'file' but 'file_path' is not specified")
            })?;
            let log_file = File::create(file_path)
                .with_context(|| format!("Failed to create log file at {file_path}"))?;
            let file_writer = Mutex::new(log_file).with_max_level(log_level);

            match config.format {
                LogFormat::Json => fmt::layer().with_writer(file_writer).json().boxed(),
                LogFormat::Plain => fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .pretty()
                    .boxed(),
            }
        }
        LogOutput::Stdout => {
            let stdout_writer = std::io::stdout.with_max_level(log_level);
            match config.format {
                LogFormat::Json => fmt::layer().with_writer(stdout_writer).json().boxed(),
                LogFormat::Plain => fmt::layer().with_writer(stdout_writer).pretty().boxed(),
            }
        }
    };

    Ok(layer)
}
