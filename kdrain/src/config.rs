//! Configuration module for kdrain
//!
//! Handles loading and validating configuration from YAML files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use kdrain_core::cluster::PollSettings;
use serde::{Deserialize, Serialize};

/// Upper bound for `poll.timeout`
const MAX_POLL_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Drain behaviour configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainSettings {
    /// Leave DaemonSet pods on the node
    #[serde(default = "default_true")]
    pub ignore_daemon_sets: bool,

    /// Delete pods even when eviction is supported
    #[serde(default)]
    pub disable_eviction: bool,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            ignore_daemon_sets: true,
            disable_eviction: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// API server URL overriding the kubeconfig's server
    #[serde(default)]
    pub api_server_url: Option<String>,

    /// Kubeconfig file; the default lookup is used when unset
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,

    /// Pod removal polling
    #[serde(default)]
    pub poll: PollSettings,

    /// Drain behaviour
    #[serde(default)]
    pub drain: DrainSettings,

    /// Dry run mode - log actions but don't execute
    #[serde(default)]
    pub dry_run: bool,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll.interval.is_zero() {
            anyhow::bail!("poll.interval must be > 0");
        }
        if self.poll.timeout.is_zero() {
            anyhow::bail!("poll.timeout must be > 0");
        }
        if self.poll.timeout > MAX_POLL_TIMEOUT {
            anyhow::bail!(
                "poll.timeout must not exceed {}",
                humantime::format_duration(MAX_POLL_TIMEOUT)
            );
        }
        if let Some(url) = &self.api_server_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                anyhow::bail!("api_server_url must start with http:// or https://");
            }
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
