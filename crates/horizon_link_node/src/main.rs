//! Standalone Horizon link node.
//!
//! Joins the link configured in `link.toml` with its own identity, answers the
//! built-in diagnostic actions and optionally pings its peers once. Mostly
//! useful for checking broker connectivity and group/target setups without a
//! full game server or proxy.

mod cli;
mod config;
mod diagnostics;
mod logging;
mod signals;

use anyhow::{Context, Result};
use cli::CliArgs;
use config::AppConfig;
use horizon_link::{LinkBus, LinkHost, StandaloneHost, Target, TransportSettings};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Displays the startup banner with version information.
fn display_banner() {
    info!("🔗 Horizon Link Node v{}", env!("CARGO_PKG_VERSION"));
}

async fn start_bus(config: &AppConfig, host: Arc<StandaloneHost>) -> Result<LinkBus> {
    let host: Arc<dyn LinkHost> = host;
    let bus = match &config.link.transport {
        TransportSettings::Relay(relay) => {
            // A standalone process has no carrier connections, so relay
            // broadcasts only accumulate in the backlog.
            warn!("Relay transport selected; no carrier connections exist in a standalone node");
            let (bus, _relay) = LinkBus::relay(host, &config.link.correlation, relay)?;
            bus
        }
        _ => LinkBus::from_settings(host, &config.link).await?,
    };
    Ok(bus)
}

async fn run(args: CliArgs) -> Result<()> {
    let mut config = AppConfig::load_from_file(&args.config_path)
        .await
        .context("Failed to load configuration")?;
    config.apply_cli(&args)?;
    config.validate().context("Configuration validation failed")?;

    logging::setup_logging(&config.logging)?;
    display_banner();

    let host = Arc::new(StandaloneHost::new(config.identity()));
    for session in &config.node.sessions {
        host.add_session(session.clone());
    }

    let bus = start_bus(&config, Arc::clone(&host)).await?;
    diagnostics::register(&bus);
    info!(
        "✅ {} node {} ready (group '{}', transport {})",
        bus.identity().side(),
        bus.identity().name(),
        bus.identity().group(),
        bus.transport_kind()
    );

    if let Some(target) = &args.ping {
        let target: Target = target.parse()?;
        diagnostics::ping(
            &bus,
            target,
            args.hint.as_deref(),
            config.link.correlation.completion_ttl(),
        )
        .await?;
    }

    let signal = signals::wait_for_shutdown().await?;
    info!(%signal, "🛑 Shutdown signal received, closing link...");

    let stats = bus.stats();
    bus.close().await?;
    info!(
        sent = stats.messages_sent,
        received = stats.frames_received,
        dispatched = stats.messages_dispatched,
        dropped = stats.messages_dropped,
        "✅ Link node stopped"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    if let Err(e) = run(args).await {
        error!("❌ {e:#}");
        return Err(e);
    }
    Ok(())
}
