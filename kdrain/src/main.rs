//! kdrain
//!
//! Command line front end for the kdrain cluster adapter: inspect nodes and
//! pods, probe eviction support, cordon and drain nodes.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::api::ListParams;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};
use config::Config;
use kdrain_core::cluster::ClusterClient;
use kdrain_core::metrics::MetricsRegistry;
use kdrain_k8s::client::KubeCluster;
use kdrain_k8s::node_ops::{DrainConfig, DrainError, DrainOperator};

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Convert config drain settings to the operator's drain config
fn to_drain_config(config: &config::DrainSettings) -> DrainConfig {
    DrainConfig {
        ignore_daemon_sets: config.ignore_daemon_sets,
        disable_eviction: config.disable_eviction,
    }
}

/// Connect to the API server described by the configuration
async fn connect(config: &Config) -> Result<KubeCluster> {
    match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read kubeconfig: {:?}", path))?;
            KubeCluster::from_kubeconfig(
                config.api_server_url.as_deref(),
                &kubeconfig,
                config.poll,
            )
            .await
            .context("Failed to create Kubernetes client from kubeconfig")
        }
        None => {
            if config.api_server_url.is_some() {
                warn!("api_server_url is only applied together with a kubeconfig, ignoring it");
            }
            KubeCluster::try_default(config.poll)
                .await
                .context("Failed to create Kubernetes client")
        }
    }
}

/// Run a single subcommand
async fn run(
    command: Command,
    config: &Config,
    client: Arc<dyn ClusterClient>,
    metrics: Arc<MetricsRegistry>,
) -> Result<()> {
    match command {
        Command::Probe => match client.supports_eviction().await? {
            Some(version) => println!("eviction supported ({})", version),
            None => println!("eviction unsupported"),
        },
        Command::Nodes { selector } => {
            let mut params = ListParams::default();
            if let Some(selector) = &selector {
                params = params.labels(selector);
            }
            for node in client.list_nodes_with(&params).await? {
                let unschedulable = node
                    .spec
                    .as_ref()
                    .and_then(|s| s.unschedulable)
                    .unwrap_or(false);
                println!(
                    "{}\t{}",
                    node.metadata.name.as_deref().unwrap_or_default(),
                    if unschedulable {
                        "SchedulingDisabled"
                    } else {
                        "Schedulable"
                    }
                );
            }
        }
        Command::Pods { node } => {
            let pods = match node {
                Some(name) => {
                    let node = client.get_node(&name).await?;
                    client.list_pods(&node).await?
                }
                None => client.list_all_pods().await?,
            };
            for pod in pods {
                println!(
                    "{}/{}\t{}",
                    pod.metadata.namespace.as_deref().unwrap_or_default(),
                    pod.metadata.name.as_deref().unwrap_or_default(),
                    pod.status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .unwrap_or("Unknown")
                );
            }
        }
        Command::Cordon { node } => {
            let operator = operator(config, to_drain_config(&config.drain), client, metrics);
            operator.cordon(&node).await?;
        }
        Command::Uncordon { node } => {
            let operator = operator(config, to_drain_config(&config.drain), client, metrics);
            operator.uncordon(&node).await?;
        }
        Command::Drain {
            node,
            disable_eviction,
            include_daemon_sets,
        } => {
            let mut drain_config = to_drain_config(&config.drain);
            drain_config.disable_eviction |= disable_eviction;
            if include_daemon_sets {
                drain_config.ignore_daemon_sets = false;
            }

            let operator = operator(config, drain_config, client, metrics);
            match operator.drain(&node).await {
                Ok(report) => {
                    let verb = if report.using_eviction {
                        "evicted"
                    } else {
                        "deleted"
                    };
                    for pod in &report.removed {
                        println!("pod {} {}", pod, verb);
                    }
                    for pod in &report.skipped {
                        println!("pod {} skipped", pod);
                    }
                    println!("node {} drained", node);
                }
                Err(DrainError::Wait(e)) => {
                    for pod in e.pending() {
                        error!(
                            namespace = %pod.namespace,
                            pod = %pod.name,
                            "Pod still present"
                        );
                    }
                    return Err(e).with_context(|| format!("Failed to drain node {}", node));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to drain node {}", node));
                }
            }
        }
        Command::DeleteNode { node } => {
            let operator = operator(config, to_drain_config(&config.drain), client, metrics);
            operator.delete_node(&node).await?;
        }
    }

    Ok(())
}

fn operator(
    config: &Config,
    drain_config: DrainConfig,
    client: Arc<dyn ClusterClient>,
    metrics: Arc<MetricsRegistry>,
) -> DrainOperator {
    DrainOperator::new(client, drain_config, metrics, config.dry_run)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "kdrain starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        info!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    // Apply CLI overrides
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.kubeconfig.is_some() {
        config.kubeconfig = cli.kubeconfig;
    }
    if cli.server.is_some() {
        config.api_server_url = cli.server;
    }
    if let Some(interval) = cli.interval {
        config.poll.interval = interval;
    }
    if let Some(timeout) = cli.timeout {
        config.poll.timeout = timeout;
    }

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    info!(dry_run = config.dry_run, poll = ?config.poll, "Configuration loaded");

    let metrics = Arc::new(MetricsRegistry::new());
    let client: Arc<dyn ClusterClient> = Arc::new(connect(&config).await?);

    let result = run(cli.command, &config, client, metrics.clone()).await;

    if cli.print_metrics {
        print!("{}", metrics.gather_text());
    }

    result
}
