//! Configuration for slashtagd

use clap::Parser;
use slashtag_core::Bytes32;
use std::path::PathBuf;
use std::time::Duration;

/// slashtagd - Slashtag identity and replication node
#[derive(Parser, Debug, Clone)]
#[command(name = "slashtagd")]
#[command(about = "Slashtag identity, connection and replication node")]
pub struct Config {
    /// Name of the local slashtag
    #[arg(short, long, env = "SLASHTAG_NAME", default_value = "default")]
    pub name: String,

    /// Storage directory (temporary storage when unset)
    #[arg(short, long, env = "SLASHTAG_STORAGE")]
    pub storage: Option<PathBuf>,

    /// Primary seed as 64 hex characters
    #[arg(long, env = "SLASHTAG_SEED")]
    pub seed: Option<String>,

    /// Bound on discovering and dialing a peer, in milliseconds
    #[arg(long, env = "SLASHTAG_DISCOVERY_TIMEOUT_MS", default_value = "10000")]
    pub discovery_timeout_ms: u64,

    /// Bound on one replication update, in milliseconds
    #[arg(long, env = "SLASHTAG_UPDATE_TIMEOUT_MS", default_value = "5000")]
    pub update_timeout_ms: u64,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            storage: None,
            seed: None,
            discovery_timeout_ms: 10_000,
            update_timeout_ms: 5_000,
            log_format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Slashtag name cannot be empty");
        }
        if self.discovery_timeout_ms == 0 || self.update_timeout_ms == 0 {
            anyhow::bail!("Timeouts must be positive");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Log format must be json or pretty, got {}", self.log_format);
        }
        self.primary_seed()?;
        Ok(())
    }

    /// Decoded primary seed, if configured
    pub fn primary_seed(&self) -> anyhow::Result<Option<Bytes32>> {
        let Some(seed) = &self.seed else {
            return Ok(None);
        };
        let bytes = hex::decode(seed)?;
        let seed: Bytes32 = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Seed must be 32 bytes"))?;
        Ok(Some(seed))
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }
}
