use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// GPIO pins monitored when the config does not list channels explicitly.
/// These are the classic S0 input pins on the Raspberry Pi header.
pub const DEFAULT_GPIO_PINS: &[u32] = &[17, 18, 21, 22, 23, 24];

/// Top-level configuration for the s0d daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Metering middleware connection configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Aggregation window length. Zero (the default) selects immediate
    /// mode: every pulse is reported on its own, legacy wire format.
    #[serde(default, with = "humantime_serde")]
    pub aggregate_interval: Duration,

    /// PID lock file guaranteeing single-instance execution.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Monitored S0 inputs, in channel-index order.
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

/// Metering middleware connection configuration.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Middleware host name or address.
    #[serde(default)]
    pub host: String,

    /// Middleware TCP port.
    #[serde(default)]
    pub port: u16,

    /// Base path of the middleware API (e.g. "middleware.php").
    #[serde(default)]
    pub path: String,

    /// Use HTTPS instead of HTTP. Default: false.
    #[serde(default)]
    pub tls: bool,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// One monitored S0 input.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// GPIO pin number (sysfs numbering).
    pub gpio: u32,

    /// Middleware UUID this channel reports under. A channel without a
    /// UUID is still counted but never uploaded.
    #[serde(default)]
    pub uuid: Option<String>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/tmp/s0d.pid")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_channels() -> Vec<ChannelConfig> {
    DEFAULT_GPIO_PINS
        .iter()
        .map(|&gpio| ChannelConfig { gpio, uuid: None })
        .collect()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            aggregate_interval: Duration::ZERO,
            pid_file: default_pid_file(),
            channels: default_channels(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            path: String::new(),
            tls: false,
            timeout: default_request_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            bail!("server.host is required");
        }

        if self.server.port == 0 {
            bail!("server.port is required");
        }

        if self.server.path.is_empty() {
            bail!("server.path is required");
        }

        if self.channels.is_empty() {
            bail!("at least one channel is required");
        }

        let mut seen_pins = HashSet::new();
        for ch in &self.channels {
            if !seen_pins.insert(ch.gpio) {
                bail!("gpio pin {} appears in more than one channel", ch.gpio);
            }

            if let Some(uuid) = &ch.uuid {
                if uuid.is_empty() {
                    bail!(
                        "empty uuid for gpio pin {} (omit the field instead)",
                        ch.gpio
                    );
                }
            }
        }

        Ok(())
    }

    /// True when every pulse is reported individually instead of being
    /// aggregated over a window.
    pub fn is_immediate(&self) -> bool {
        self.aggregate_interval.is_zero()
    }
}
