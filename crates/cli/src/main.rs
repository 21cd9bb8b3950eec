//! `gbsip`: starts the GB28181 SIP signaling server

mod config;
mod logging;
mod observer;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use gbsip_sip_stack::{SipObserver, StackConfigurator, start_sip_server};

use crate::config::ServerConfig;
use crate::logging::{LoggingConfig, setup_logging};
use crate::observer::LoggingObserver;

#[derive(Parser, Debug)]
#[command(name = "gbsip", version, about = "GB28181 SIP signaling server")]
pub struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "GBSIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local address to listen on
    #[arg(long, env = "GBSIP_MONITOR_IP")]
    pub monitor_ip: Option<String>,

    /// SIP port, shared by TCP and UDP
    #[arg(short, long, env = "GBSIP_PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Enable signaling engine debug diagnostics
    #[arg(long)]
    pub debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::load(&args)?;

    setup_logging(&LoggingConfig::from_section(&config.logging)?)?;
    info!("Starting gbsip v{}", env!("CARGO_PKG_VERSION"));

    let observer = Arc::new(LoggingObserver::new());
    let shared: Arc<dyn SipObserver> = observer.clone();

    let server = start_sip_server(
        StackConfigurator::global(),
        config.engine_options()?,
        config.sip.port,
        config.sip.transports.as_slice(),
        &shared,
    )
    .context("Failed to configure the signaling engine")?;

    if server.transports.is_empty() {
        warn!("No SIP transport is running; the server will not receive any signaling");
    } else if server.transports.is_degraded() {
        warn!(
            "SIP server running with {} of {} transports",
            server.transports.endpoints().len(),
            config.sip.transports.len()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    server.shutdown().await;
    info!(
        "Stopped after {} messages and {} I/O errors",
        observer.messages(),
        observer.errors()
    );
    Ok(())
}
