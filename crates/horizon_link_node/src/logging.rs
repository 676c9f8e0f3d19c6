//! Logging setup for the link node.
//!
//! The configured level applies to the node itself. The link library can be
//! turned up separately with `link_level`, and the broker client crates are
//! held at `warn` so their connection chatter does not drown the link events.

use crate::config::LoggingSettings;
use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Client crates whose output is capped at `warn`.
const QUIET_CRATES: [&str; 2] = ["rumqttc", "pulsar"];

/// Filter directives for the configured levels.
pub fn filter_directives(config: &LoggingSettings) -> String {
    let mut directives = vec![config.level.clone()];
    if let Some(link_level) = &config.link_level {
        directives.push(format!("horizon_link={link_level}"));
    }
    directives.extend(QUIET_CRATES.iter().map(|krate| format!("{krate}=warn")));
    directives.join(",")
}

/// Installs the global subscriber. `RUST_LOG` replaces the configured filter when set.
pub fn setup_logging(config: &LoggingSettings) -> Result<()> {
    let directives = filter_directives(config);
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&directives))?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.json_format {
        registry
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .try_init()
    };
    installed.map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    info!(filter = %directives, json = config.json_format, "🔧 Logging initialized");
    Ok(())
}
