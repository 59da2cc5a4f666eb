//! # Daemon Configuration
//!
//! Every field has a default, so the file is optional and may be partial.
//!
//! ```toml
//! [server]
//! listen = "localhost:8080"
//! ui_dir = "ui/default"
//!
//! [discovery]
//! interval_ms = 1000
//! port_patterns = ["ttyACM", "ttyUSB"]
//! baud = 250000
//!
//! [job]
//! temp_poll_ms = 1500
//! temp_wait_timeout_secs = 900
//! ```
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
}

/// HTTP / websocket surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_ui_dir")]
    pub ui_dir: PathBuf,
}

impl ServerConfig {
    /// `listen` with an empty host filled in as `localhost`.
    pub fn bind_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("localhost{}", self.listen)
        } else {
            self.listen.clone()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: default_listen(), ui_dir: default_ui_dir() }
    }
}

/// Device discovery and the serial transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_interval_ms")]
    pub interval_ms: u64,
    /// Substrings a port name must contain to be probed.
    #[serde(default = "default_port_patterns")]
    pub port_patterns: Vec<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_greeting_timeout_ms")]
    pub greeting_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Reply window for M109/M190, which firmware acknowledges only once
    /// the heater is at temperature.
    #[serde(default = "default_heatup_timeout_ms")]
    pub heatup_timeout_ms: u64,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn heatup_timeout(&self) -> Duration {
        Duration::from_millis(self.heatup_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_discovery_interval_ms(),
            port_patterns: default_port_patterns(),
            baud: default_baud(),
            greeting_timeout_ms: default_greeting_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            heatup_timeout_ms: default_heatup_timeout_ms(),
        }
    }
}

/// Job streaming timings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Interval between `M105` polls during a heat-up wait.
    #[serde(default = "default_temp_poll_ms")]
    pub temp_poll_ms: u64,
    /// How often a paused job logs that it is still paused.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
    /// A status query is queued after every `status_every` command lines.
    #[serde(default = "default_status_every")]
    pub status_every: usize,
    #[serde(default = "default_temp_wait_timeout_secs")]
    pub temp_wait_timeout_secs: u64,
    /// Capacity of each job queue. Small values keep pause responsive.
    #[serde(default = "default_job_queue_capacity")]
    pub queue_capacity: usize,
}

impl JobConfig {
    pub fn temp_poll(&self) -> Duration {
        Duration::from_millis(self.temp_poll_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms)
    }

    pub fn temp_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.temp_wait_timeout_secs)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            temp_poll_ms: default_temp_poll_ms(),
            pause_poll_ms: default_pause_poll_ms(),
            status_every: default_status_every(),
            temp_wait_timeout_secs: default_temp_wait_timeout_secs(),
            queue_capacity: default_job_queue_capacity(),
        }
    }
}

/// Capacity of the four core queues.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { capacity: default_channel_capacity() }
    }
}

fn default_listen() -> String { "localhost:8080".to_string() }
fn default_ui_dir() -> PathBuf { PathBuf::from("ui/default") }
fn default_discovery_interval_ms() -> u64 { 1000 }
fn default_port_patterns() -> Vec<String> {
    ["ttyUSB", "ttyACM", "usbmodem", "usbserial", "COM"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_baud() -> u32 { 115_200 }
fn default_greeting_timeout_ms() -> u64 { 2000 }
fn default_command_timeout_ms() -> u64 { 2000 }
fn default_heatup_timeout_ms() -> u64 { 1_800_000 }
fn default_temp_poll_ms() -> u64 { 1500 }
fn default_pause_poll_ms() -> u64 { 8000 }
fn default_status_every() -> usize { 5 }
fn default_temp_wait_timeout_secs() -> u64 { 1800 }
fn default_job_queue_capacity() -> usize { 1 }
fn default_channel_capacity() -> usize { 64 }

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("discovery.interval_ms", self.discovery.interval_ms),
            ("discovery.command_timeout_ms", self.discovery.command_timeout_ms),
            ("discovery.heatup_timeout_ms", self.discovery.heatup_timeout_ms),
            ("job.temp_poll_ms", self.job.temp_poll_ms),
            ("job.pause_poll_ms", self.job.pause_poll_ms),
            ("job.temp_wait_timeout_secs", self.job.temp_wait_timeout_secs),
            ("job.status_every", self.job.status_every as u64),
            ("job.queue_capacity", self.job.queue_capacity as u64),
            ("channels.capacity", self.channels.capacity as u64),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }
        let listen = &self.server.listen;
        let (host, _) = listen.rsplit_once(':').ok_or_else(|| {
            ConfigError::Invalid(format!("listen address {listen:?} has no port"))
        })?;
        if !host.is_empty() && host != "localhost" && host != "127.0.0.1" {
            return Err(ConfigError::Invalid(format!(
                "refusing to listen on non-local host {host:?}"
            )));
        }
        Ok(())
    }
}

/// Loads and validates a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
