//! CLI argument parsing for kdrain

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// kdrain - cordon, drain and inspect Kubernetes nodes
#[derive(Debug, Parser)]
#[command(name = "kdrain")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/kdrain/config.yaml")]
    pub config: PathBuf,

    /// Kubeconfig file (defaults to the standard kubeconfig lookup or in-cluster config)
    #[arg(long, env = "KDRAIN_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// API server URL, overriding the kubeconfig's server
    #[arg(long, env = "KDRAIN_SERVER")]
    pub server: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KDRAIN_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "KDRAIN_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - log actions but don't execute
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// How often to check whether removed pods are gone (e.g. 5s)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// How long to wait for removed pods to be gone (e.g. 5m)
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Print Prometheus metrics to stdout when the command finishes
    #[arg(long)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Report whether the API server supports pod eviction
    Probe,

    /// List nodes
    Nodes {
        /// Label selector to filter nodes
        #[arg(short = 'l', long)]
        selector: Option<String>,
    },

    /// List pods, optionally only those bound to a node
    Pods {
        /// Node name
        #[arg(long)]
        node: Option<String>,
    },

    /// Mark a node unschedulable
    Cordon {
        /// Node name
        node: String,
    },

    /// Mark a node schedulable
    Uncordon {
        /// Node name
        node: String,
    },

    /// Cordon a node and evict (or delete) its pods
    Drain {
        /// Node name
        node: String,

        /// Delete pods even if the server supports eviction
        #[arg(long)]
        disable_eviction: bool,

        /// Also remove pods owned by DaemonSets
        #[arg(long)]
        include_daemon_sets: bool,
    },

    /// Delete a node object
    DeleteNode {
        /// Node name
        node: String,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["kdrain", "probe"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/kdrain/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.dry_run);
        assert!(cli.timeout.is_none());
        assert_eq!(cli.command, Command::Probe);
    }

    #[test]
    fn test_cli_drain() {
        let cli = Cli::try_parse_from([
            "kdrain",
            "--dry-run",
            "--timeout",
            "2m",
            "--interval",
            "500ms",
            "drain",
            "worker-1",
            "--disable-eviction",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.timeout, Some(Duration::from_secs(120)));
        assert_eq!(cli.interval, Some(Duration::from_millis(500)));
        assert_eq!(
            cli.command,
            Command::Drain {
                node: "worker-1".to_string(),
                disable_eviction: true,
                include_daemon_sets: false,
            }
        );
    }

    #[test]
    fn test_cli_nodes_selector() {
        let cli = Cli::try_parse_from(["kdrain", "nodes", "-l", "role=worker"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Nodes {
                selector: Some("role=worker".to_string())
            }
        );
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["kdrain"]).is_err());
    }

    #[test]
    fn test_cli_rejects_bad_duration() {
        assert!(Cli::try_parse_from(["kdrain", "--timeout", "soon", "probe"]).is_err());
    }
}
