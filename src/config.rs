//! Configuration file support
//!
//! Settings come from three layers, highest priority first: command-line
//! flags (and their `TUNWIRE_*` environment variables), the YAML file given
//! with `--config`, then built-in defaults.

use crate::Cli;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tunwire_agent::AgentConfig;

const DEFAULT_RECONNECT_DELAY_SECS: u64 = 1;
const DEFAULT_MAX_RECONNECT_DELAY_SECS: u64 = 60;

/// On-disk configuration
///
/// ```yaml
/// controller:
///   address: 10.0.0.1:7070
///   max_reconnect_attempts: 0
///   reconnect_delay: 1
///   max_reconnect_delay: 60
/// agent:
///   read_chunk_size: 16384
///   max_message_size: 65536
///   preferred_family: ipv4
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub controller: ControllerSection,
    pub agent: AgentConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerSection {
    pub address: Option<String>,
    pub max_reconnect_attempts: Option<usize>,
    /// Seconds
    pub reconnect_delay: Option<u64>,
    /// Seconds
    pub max_reconnect_delay: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 0 means retry forever
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct Settings {
    pub controller: String,
    pub agent: AgentConfig,
    pub reconnect: ReconnectPolicy,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(cli, file)
    }

    fn merge(cli: &Cli, file: ConfigFile) -> Result<Self> {
        let controller = cli
            .controller
            .clone()
            .or(file.controller.address)
            .context("No controller address given (use --controller or the config file)")?;

        let mut agent = file.agent;
        if let Some(read_chunk_size) = cli.read_chunk_size {
            agent.read_chunk_size = read_chunk_size;
        }

        let initial_delay = cli
            .reconnect_delay
            .or(file.controller.reconnect_delay)
            .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS);
        let max_delay = cli
            .max_reconnect_delay
            .or(file.controller.max_reconnect_delay)
            .unwrap_or(DEFAULT_MAX_RECONNECT_DELAY_SECS)
            .max(initial_delay);

        let reconnect = ReconnectPolicy {
            max_attempts: cli
                .max_reconnect_attempts
                .or(file.controller.max_reconnect_attempts)
                .unwrap_or(0),
            initial_delay: Duration::from_secs(initial_delay),
            max_delay: Duration::from_secs(max_delay),
        };

        Ok(Self {
            controller,
            agent,
            reconnect,
        })
    }
}
