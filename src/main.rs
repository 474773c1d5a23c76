//! cipclient - interactive CIP client
//!
//! Connects to a Crestron control processor and opens a console for reading,
//! setting and watching joins.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cipclient::{CipClient, ClientConfig};

mod cli;

/// CIP client - talk to a Crestron control processor from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Processor hostname or IP address
    #[arg(long, env = "CIP_HOST")]
    host: Option<String>,

    /// IP-ID to register as (decimal or 0x-prefixed hex)
    #[arg(long, env = "CIP_IPID", value_parser = parse_ip_id)]
    ip_id: Option<u8>,

    /// Processor port
    #[arg(short, long, env = "CIP_PORT")]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

fn parse_ip_id(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid IP-ID '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    let config = load_config(&args).await?;
    info!(
        "Processor {}:{} as IP-ID 0x{:02x}",
        config.host, config.port, config.ip_id
    );

    let client = Arc::new(CipClient::new(config)?);
    client.subscribe_connection_state(|state| info!("📡 Connection {}", state));
    client.start().await?;

    let repl = tokio::task::spawn_blocking({
        let client = Arc::clone(&client);
        move || cli::run_repl(&client)
    });

    let repl_finished = tokio::select! {
        result = repl => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Console error: {:#}", e),
                Err(e) => warn!("Console task failed: {}", e),
            }
            true
        }
        _ = shutdown_signal() => false,
    };

    client.stop().await;
    info!("CIP client shutdown complete");

    if !repl_finished {
        // The console thread is parked in a blocking read
        std::process::exit(0);
    }
    Ok(())
}

/// Config file first, then command-line overrides
async fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration file: {}", path);
            ClientConfig::load(path).await?
        }
        None => {
            let host = args
                .host
                .clone()
                .context("--host is required when no --config file is given")?;
            let ip_id = args
                .ip_id
                .context("--ip-id is required when no --config file is given")?;
            ClientConfig::new(host, ip_id)
        }
    };

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(ip_id) = args.ip_id {
        config.ip_id = ip_id;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_id() {
        assert_eq!(parse_ip_id("0x03"), Ok(3));
        assert_eq!(parse_ip_id("0XFE"), Ok(254));
        assert_eq!(parse_ip_id("10"), Ok(10));
        assert!(parse_ip_id("0x100").is_err());
        assert!(parse_ip_id("abc").is_err());
    }

    #[tokio::test]
    async fn test_load_config_from_flags() {
        let args = Args::parse_from(["cipclient", "--host", "10.0.0.5", "--ip-id", "0x1a", "--port", "41795"]);
        let config = load_config(&args).await.unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.ip_id, 0x1a);
        assert_eq!(config.port, 41795);
    }
}
