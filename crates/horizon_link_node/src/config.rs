//! Configuration management for the link node.
//!
//! Loads the `[node]`, `[link]` and `[logging]` sections from TOML, applies
//! command-line overrides and validates the result before anything starts.

use crate::cli::CliArgs;
use anyhow::{anyhow, bail, Context, Result};
use horizon_link::{LinkSettings, NodeIdentity, NodeSide};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Who this node is on the link
    pub node: NodeSettings,
    /// Correlation and transport settings
    #[serde(default)]
    pub link: LinkSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node name; proxies get the reserved prefix added automatically
    pub name: String,
    pub side: NodeSide,
    /// Isolation group, empty to accept every group
    #[serde(default)]
    pub group: String,
    /// User sessions this node reports as hosted, for `*_WITH_PLAYERS` targets
    #[serde(default)]
    pub sessions: Vec<String>,
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Separate level for the link library, defaults to `level`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_level: Option<String>,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                name: "survival-1".to_string(),
                side: NodeSide::Server,
                group: String::new(),
                sessions: Vec::new(),
            },
            link: LinkSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                link_level: None,
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at the
    /// specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// The loaded or default configuration, or an error if loading/creation failed.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_cli(&mut self, args: &CliArgs) -> Result<()> {
        if let Some(node) = &args.node {
            self.node.name = node.clone();
        }
        if let Some(side) = &args.side {
            self.node.side = side.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(group) = &args.group {
            self.node.group = group.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        Ok(())
    }

    /// Validates the configuration for consistency and correctness.
    pub fn validate(&self) -> Result<()> {
        if self.node.name.trim().is_empty() {
            bail!("Node name cannot be empty");
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let levels = std::iter::once(&self.logging.level).chain(self.logging.link_level.as_ref());
        for level in levels {
            if !valid_levels.contains(&level.as_str()) {
                bail!("Invalid log level: {level}. Must be one of: {valid_levels:?}");
            }
        }

        self.link.validate()?;
        Ok(())
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.node.side, self.node.name.trim(), self.node.group.trim())
    }
}
