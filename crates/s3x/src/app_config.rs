//! 🔧 App Configuration: the sacred TOML-and-env-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every operator at 3am) 🦆
//!
//! 🏗️ Powered by Figment. Environment variables prefixed `S3X_` form the base
//! layer, nested keys split on `__` (`S3X_TRANSFER__CHUNK_SIZE=8388608`), and an
//! optional TOML file is merged on top. The file wins on conflicts.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{TransferError, TransferResult};
use crate::transport::TransportConfig;

/// 📏 The smallest part most object stores accept (except the last one).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// 📦 The AppConfig: where the bytes go and how they get there.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// 🎛️ How big the chunks are and how many move at once.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per ranged GET, and bytes per uploaded part.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Chunk fillers per reader, and parts in flight per writer.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

fn default_chunk_size() -> u64 {
    64 * 1024 * 1024
}

fn default_parallelism() -> usize {
    4
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            parallelism: default_parallelism(),
        }
    }
}

impl TransferConfig {
    /// ✅ Zero anything is a setup error. Small parts are allowed but the store may refuse them.
    pub fn validate(&self) -> TransferResult<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::Setup("transfer.chunk_size must be greater than zero".into()));
        }
        if self.parallelism == 0 {
            return Err(TransferError::Setup("transfer.parallelism must be greater than zero".into()));
        }
        if self.chunk_size < MIN_PART_SIZE {
            warn!(
                "⚠️ chunk_size {} is below {MIN_PART_SIZE}; uploads with more than one part may be rejected",
                self.chunk_size
            );
        }
        Ok(())
    }
}

fn figment(config_file_name: Option<&Path>) -> Figment {
    let config = Figment::new().merge(Env::prefixed("S3X_").split("__"));
    match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    }
}

/// 🚀 Load the config from `S3X_*` env vars plus an optional TOML file.
///
/// 📐 No file means env only. Nothing defaults to `s3x.toml` behind your back.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name.map_or_else(|| "<env only>".to_string(), |p| p.display().to_string())
    );

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (S3X_*). \
             The file exists in our hearts, but apparently not in a shape serde recognizes.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (S3X_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = figment(config_file_name).extract().context(context_msg)?;
    app_config
        .transfer
        .validate()
        .context("💀 The configuration parsed, but the transfer settings make no sense")?;
    Ok(app_config)
}
