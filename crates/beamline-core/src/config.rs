/*!
 * Configuration management for beamline control.
 *
 * Settings are layered: built-in defaults, then an optional TOML file, then
 * environment variables (`BEAMLINE__AUTOMOUNTER__TIMEOUT_MS=300000`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel access settings
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Motor wait settings
    #[serde(default)]
    pub motor: MotorConfig,

    /// Shutter wait settings
    #[serde(default)]
    pub shutter: ShutterConfig,

    /// Detector wait settings
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Automounter timing and progress budgets
    #[serde(default)]
    pub automounter: AutomounterConfig,

    /// Goniometer mode-change settings
    #[serde(default)]
    pub goniometer: GoniometerConfig,

    /// Data collection settings
    #[serde(default)]
    pub collection: CollectionConfig,
}

/// General configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Beamline name
    #[serde(default = "default_beamline")]
    pub beamline: String,

    /// Environment (development, simulation, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Root directory for collected data
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error, or a full EnvFilter string)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Channel access settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Round-trip timeout for reads on unmonitored channels
    #[serde(default = "default_get_timeout_ms")]
    pub get_timeout_ms: u64,
}

/// Motor wait settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    /// Poll interval
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Time allowed for motion to be seen after a command
    #[serde(default = "default_motor_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Total time allowed for a move
    #[serde(default = "default_motor_timeout_ms")]
    pub timeout_ms: u64,
}

/// Shutter wait settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutterConfig {
    /// Poll interval
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Time allowed for the shutter to reach the requested state
    #[serde(default = "default_shutter_timeout_ms")]
    pub timeout_ms: u64,
}

/// Detector wait settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Poll interval
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Time allowed for an image to be read out and saved
    #[serde(default = "default_detector_timeout_ms")]
    pub timeout_ms: u64,
}

/// Automounter timing and progress budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomounterConfig {
    /// Time allowed for the endstation to report enabled before a command
    #[serde(default = "default_enable_timeout_ms")]
    pub enable_timeout_ms: u64,

    /// Poll interval for the enable guard
    #[serde(default = "default_poll_ms")]
    pub enable_poll_ms: u64,

    /// Time allowed for the robot to become busy after a command
    #[serde(default = "default_robot_start_timeout_ms")]
    pub start_timeout_ms: u64,

    /// Total time allowed for a mount or dismount
    #[serde(default = "default_robot_timeout_ms")]
    pub timeout_ms: u64,

    /// Poll interval while waiting on the robot
    #[serde(default = "default_robot_poll_ms")]
    pub poll_ms: u64,

    /// Progress budget for a bare mount
    #[serde(default = "default_mount_steps")]
    pub mount_steps: u32,

    /// Progress budget for a combined dismount-then-mount
    #[serde(default = "default_mount_next_steps")]
    pub mount_next_steps: u32,

    /// Progress budget for a dismount
    #[serde(default = "default_dismount_steps")]
    pub dismount_steps: u32,
}

/// Goniometer mode-change settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoniometerConfig {
    /// Time allowed for a mode change
    #[serde(default = "default_mode_timeout_ms")]
    pub mode_timeout_ms: u64,

    /// Poll interval
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,

    /// Extra time allowed for a scan beyond its exposure time
    #[serde(default = "default_scan_margin_ms")]
    pub scan_margin_ms: u64,
}

/// Data collection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Sleep between checks while paused
    #[serde(default = "default_poll_ms")]
    pub pause_poll_ms: u64,

    /// Skip frames already saved when a run is restarted
    #[serde(default = "default_true")]
    pub skip_collected: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            beamline: default_beamline(),
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            get_timeout_ms: default_get_timeout_ms(),
        }
    }
}

impl Default for MotorConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            start_timeout_ms: default_motor_start_timeout_ms(),
            timeout_ms: default_motor_timeout_ms(),
        }
    }
}

impl Default for ShutterConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            timeout_ms: default_shutter_timeout_ms(),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_poll_ms(),
            timeout_ms: default_detector_timeout_ms(),
        }
    }
}

impl Default for AutomounterConfig {
    fn default() -> Self {
        Self {
            enable_timeout_ms: default_enable_timeout_ms(),
            enable_poll_ms: default_poll_ms(),
            start_timeout_ms: default_robot_start_timeout_ms(),
            timeout_ms: default_robot_timeout_ms(),
            poll_ms: default_robot_poll_ms(),
            mount_steps: default_mount_steps(),
            mount_next_steps: default_mount_next_steps(),
            dismount_steps: default_dismount_steps(),
        }
    }
}

impl Default for GoniometerConfig {
    fn default() -> Self {
        Self {
            mode_timeout_ms: default_mode_timeout_ms(),
            poll_ms: default_poll_ms(),
            scan_margin_ms: default_scan_margin_ms(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: default_poll_ms(),
            skip_collected: true,
        }
    }
}

impl MotorConfig {
    /// Poll interval as a duration
    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }
}

impl AutomounterConfig {
    /// Enable guard timeout as a duration
    pub fn enable_timeout(&self) -> Duration {
        Duration::from_millis(self.enable_timeout_ms)
    }
}

fn default_beamline() -> String {
    "SIM-1".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_get_timeout_ms() -> u64 {
    2_000
}

fn default_poll_ms() -> u64 {
    50
}

fn default_motor_start_timeout_ms() -> u64 {
    5_000
}

fn default_motor_timeout_ms() -> u64 {
    120_000
}

fn default_shutter_timeout_ms() -> u64 {
    5_000
}

fn default_detector_timeout_ms() -> u64 {
    30_000
}

fn default_enable_timeout_ms() -> u64 {
    20_000
}

fn default_robot_start_timeout_ms() -> u64 {
    60_000
}

fn default_robot_timeout_ms() -> u64 {
    240_000
}

fn default_robot_poll_ms() -> u64 {
    100
}

fn default_mount_steps() -> u32 {
    26
}

fn default_mount_next_steps() -> u32 {
    40
}

fn default_dismount_steps() -> u32 {
    25
}

fn default_mode_timeout_ms() -> u64 {
    30_000
}

fn default_scan_margin_ms() -> u64 {
    30_000
}

impl Config {
    /// Parse a configuration from TOML text, filling gaps with defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize::<Config>()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded for beamline {}", config.general.beamline);
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone, Default)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
