//! slashtagd - Slashtag identity node
//!
//! Opens the configured slashtag on an in-memory overlay, publishes its
//! profile, and reads it back through a second, read-only SDK.

use clap::Parser;
use slashtag_net::Testnet;
use slashtagd::{Config, Sdk};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();
    init_logging(&config.log_format);

    info!("slashtagd v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("slashtagd failed: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("slashtagd=info,slashtag_net=info,slashtag_store=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;

    let testnet = Testnet::new();
    let sdk = Sdk::new(&config, Arc::new(testnet.clone()))?;
    let slashtag = sdk.slashtag(&config.name)?;
    slashtag.ready().await?;
    slashtag.listen().await?;
    slashtag.set_profile(&serde_json::json!({ "name": config.name }))?;
    info!("serving {} at {}", config.name, slashtag.url());

    let reader_config = Config {
        storage: None,
        seed: None,
        ..config.clone()
    };
    let reader = Sdk::new(&reader_config, Arc::new(testnet))?;
    let remote = reader.slashtag_from_url(&slashtag.url())?;
    let profile: serde_json::Value = remote.get_profile().await?;
    info!("read profile of {}: {}", remote.id(), profile);

    reader.close().await?;
    sdk.close().await?;
    Ok(())
}
