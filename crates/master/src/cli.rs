//! Command-line interface of the `master` binary.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Which role this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Accepts clients, rooms and spawners
    Master,
    /// Registers with a master and launches game server processes
    Spawner,
}

/// Command line arguments parsed from user input.
///
/// Every option except `mode` and `config_path` overrides the matching
/// value of the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub mode: RunMode,
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the master bind address
    pub bind_address: Option<String>,
    /// Optional override for the address a spawner connects to
    pub master_address: Option<String>,
    /// Optional override for the spawner region
    pub region: Option<String>,
    /// Optional override for the log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        let mode = match matches.get_one::<String>("mode").map(String::as_str) {
            Some("spawner") => RunMode::Spawner,
            _ => RunMode::Master,
        };

        Self {
            mode,
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("master.toml")),
            bind_address: matches.get_one::<String>("bind").cloned(),
            master_address: matches.get_one::<String>("master").cloned(),
            region: matches.get_one::<String>("region").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

fn command() -> Command {
    Command::new("Master Server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Master server and spawner for multiplayer game backends")
        .arg(
            Arg::new("mode")
                .value_name("MODE")
                .help("Run mode")
                .value_parser(["master", "spawner"])
                .default_value("master"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("master.toml"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Master bind address (e.g., 0.0.0.0:5000)"),
        )
        .arg(
            Arg::new("master")
                .short('m')
                .long("master")
                .value_name("ADDRESS")
                .help("Master address a spawner connects to"),
        )
        .arg(
            Arg::new("region")
                .short('r')
                .long("region")
                .value_name("REGION")
                .help("Region served by the spawner"),
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
                .action(ArgAction::SetTrue),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let matches = command().try_get_matches_from(args).unwrap();
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn defaults_to_master_mode() {
        let args = parse(&["master"]);
        assert_eq!(args.mode, RunMode::Master);
        assert_eq!(args.config_path, PathBuf::from("master.toml"));
        assert!(args.bind_address.is_none());
        assert!(!args.json_logs);
    }

    #[test]
    fn spawner_mode_with_overrides() {
        let args = parse(&[
            "master", "spawner", "-c", "eu.toml", "--master", "10.0.0.1:5000", "--region", "EU",
            "--json-logs",
        ]);
        assert_eq!(args.mode, RunMode::Spawner);
        assert_eq!(args.config_path, PathBuf::from("eu.toml"));
        assert_eq!(args.master_address.as_deref(), Some("10.0.0.1:5000"));
        assert_eq!(args.region.as_deref(), Some("EU"));
        assert!(args.json_logs);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(command().try_get_matches_from(["master", "relay"]).is_err());
    }
}
