//! Configuration management for the cryocond daemon.
//!
//! Handles loading, parsing, and validation of the YAML configuration file
//! that selects the instrument connection, the exposed channels and loops,
//! and the polling behavior.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::RwLock;

use crate::{
    attributes::{ChannelId, LoopId},
    connection::ConnectionSpec,
    error::{CryoError, CryoResult},
};

/// Main configuration structure for the cryocond daemon.
///
/// # Example
///
/// ```yaml
/// version: 1
/// url: tcp://192.168.1.50
/// used_channels: AB
/// used_loops: [1, 2]
/// poll_interval: 1.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    pub version: u8,

    /// Instrument address: `serial:///dev/ttyUSB0`, a bare device path, or
    /// `tcp://host[:port]`.
    pub url: String,

    #[serde(default = "defaults::baudrate")]
    pub baudrate: u32,

    /// Serial data bits, 5 to 8.
    #[serde(default = "defaults::bytesize")]
    pub bytesize: u8,

    #[serde(default)]
    pub parity: Parity,

    /// Input channel letters to expose, e.g. `"ABCD"`.
    #[serde(default = "defaults::used_channels")]
    pub used_channels: String,

    /// Control loop numbers to expose.
    #[serde(default = "defaults::used_loops")]
    pub used_loops: Vec<u8>,

    /// Seconds a polled value is served from the cache before a read polls again.
    #[serde(default = "defaults::read_validity_period")]
    pub read_validity_period: f64,

    /// Seconds between background polls; 0 disables the poller.
    #[serde(default = "defaults::poll_interval")]
    pub poll_interval: f64,

    /// Lock the instrument's front panel at startup.
    #[serde(default)]
    pub auto_lock_front_panel: bool,

    #[serde(default = "defaults::tcp_timeout")]
    pub tcp_timeout: f64,

    #[serde(default = "defaults::tcp_connection_timeout")]
    pub tcp_connection_timeout: f64,

    #[serde(default = "defaults::serial_timeout")]
    pub serial_timeout: f64,
}

/// Serial parity, written as `N`, `E` or `O`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            url: "serial:///dev/ttyUSB0".to_string(),
            baudrate: defaults::baudrate(),
            bytesize: defaults::bytesize(),
            parity: Parity::default(),
            used_channels: defaults::used_channels(),
            used_loops: defaults::used_loops(),
            read_validity_period: defaults::read_validity_period(),
            poll_interval: defaults::poll_interval(),
            auto_lock_front_panel: false,
            tcp_timeout: defaults::tcp_timeout(),
            tcp_connection_timeout: defaults::tcp_connection_timeout(),
            serial_timeout: defaults::serial_timeout(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// Everything that could make device initialization fail is checked here,
    /// so a bad file is rejected before any connection is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            anyhow::bail!("Unsupported config version {}", self.version);
        }

        let channels = self.channels()?;
        let loops = self.loops()?;
        crate::attributes::declare(&channels, &loops)?;
        ConnectionSpec::from_config(self).context("Invalid connection settings")?;

        if !(5..=8).contains(&self.bytesize) {
            anyhow::bail!("bytesize must be between 5 and 8, got {}", self.bytesize);
        }
        for (name, value) in [
            ("read_validity_period", self.read_validity_period),
            ("poll_interval", self.poll_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                anyhow::bail!("{name} must be zero or a positive number of seconds, got {value}");
            }
        }

        Ok(())
    }

    /// Channels selected by `used_channels`, in configuration order.
    pub fn channels(&self) -> CryoResult<Vec<ChannelId>> {
        self.used_channels
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ',')
            .map(|c| {
                ChannelId::from_letter(c)
                    .ok_or_else(|| CryoError::Config(format!("unknown channel '{c}' in used_channels")))
            })
            .collect()
    }

    /// Loops selected by `used_loops`.
    pub fn loops(&self) -> CryoResult<Vec<LoopId>> {
        self.used_loops.iter().copied().map(LoopId::new).collect()
    }
}

mod defaults {
    pub fn baudrate() -> u32 {
        9600
    }

    pub fn bytesize() -> u8 {
        8
    }

    pub fn used_channels() -> String {
        "ABCD".to_string()
    }

    pub fn used_loops() -> Vec<u8> {
        vec![1, 2, 3, 4]
    }

    pub fn read_validity_period() -> f64 {
        0.1
    }

    pub fn poll_interval() -> f64 {
        1.0
    }

    pub fn tcp_timeout() -> f64 {
        0.5
    }

    pub fn tcp_connection_timeout() -> f64 {
        1.0
    }

    pub fn serial_timeout() -> f64 {
        1.0
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("CRYOCOND_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("cryocond/config.yml");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/cryocond/config.yml");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    anyhow::bail!("Configuration file not found in any standard location")
}

/// Configuration manager that owns the loaded config and its file path.
///
/// # Example
///
/// ```no_run
/// use cryocond::config::ConfigManager;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(None).await?;
/// let url = config_manager.get().await.url.clone();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. CRYOCOND_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/cryocond/config.yml or ~/.config/cryocond/config.yml
    /// 4. /etc/cryocond/config.yml
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn validate(&self) -> Result<()> {
        self.config.read().await.validate()
    }

    /// Clones the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML in: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}
