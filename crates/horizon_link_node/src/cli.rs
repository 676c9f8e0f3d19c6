//! Command-line interface for the link node.
//!
//! Every option overrides the matching value from the configuration file.

use clap::{Arg, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the node name
    pub node: Option<String>,
    /// Optional override for the node side (`server` or `proxy`)
    pub side: Option<String>,
    /// Optional override for the isolation group
    pub group: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Target of a one-shot ping sent after start-up
    pub ping: Option<String>,
    /// Receiver hint for the ping
    pub hint: Option<String>,
}

impl CliArgs {
    /// Parses command line arguments using clap.
    ///
    /// # Returns
    ///
    /// A `CliArgs` instance containing all parsed command-line options.
    pub fn parse() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    fn command() -> Command {
        Command::new("Horizon Link Node")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Standalone node on the Horizon server/proxy link")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("link.toml"),
            )
            .arg(
                Arg::new("node")
                    .short('n')
                    .long("node")
                    .value_name("NAME")
                    .help("Node name on the link"),
            )
            .arg(
                Arg::new("side")
                    .short('s')
                    .long("side")
                    .value_name("SIDE")
                    .help("Node side (server, proxy)"),
            )
            .arg(
                Arg::new("group")
                    .short('g')
                    .long("group")
                    .value_name("NAME")
                    .help("Isolation group (empty accepts every group)"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("ping")
                    .long("ping")
                    .value_name("TARGET")
                    .help("Send a ping to TARGET (e.g. ALL_QUEUE, SERVER) after start-up"),
            )
            .arg(
                Arg::new("hint")
                    .long("hint")
                    .value_name("HINT")
                    .help("Receiver hint for --ping"),
            )
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("link.toml")),
            node: matches.get_one::<String>("node").cloned(),
            side: matches.get_one::<String>("side").cloned(),
            group: matches.get_one::<String>("group").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            ping: matches.get_one::<String>("ping").cloned(),
            hint: matches.get_one::<String>("hint").cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let argv = std::iter::once("horizon_link_node").chain(args.iter().copied());
        CliArgs::from_matches(CliArgs::command().get_matches_from(argv))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.config_path, PathBuf::from("link.toml"));
        assert!(args.node.is_none());
        assert!(!args.json_logs);
        assert!(args.ping.is_none());
    }

    #[test]
    fn overrides() {
        let args = parse(&[
            "--config", "edge.toml", "-n", "edge-1", "--side", "proxy", "-g", "alpha", "--json-logs",
            "--ping", "SERVER", "--hint", "lobby",
        ]);
        assert_eq!(args.config_path, PathBuf::from("edge.toml"));
        assert_eq!(args.node.as_deref(), Some("edge-1"));
        assert_eq!(args.side.as_deref(), Some("proxy"));
        assert_eq!(args.group.as_deref(), Some("alpha"));
        assert!(args.json_logs);
        assert_eq!(args.ping.as_deref(), Some("SERVER"));
        assert_eq!(args.hint.as_deref(), Some("lobby"));
    }
}
