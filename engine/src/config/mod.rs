//! Configuration management
//!
//! This module handles loading, validation, and management of the daemon
//! configuration. Configuration is stored in TOML format at
//! ~/.evolver/config.toml and is loaded once at process start; the resulting
//! value is immutable and handed to every component that needs it.
//!
//! # Configuration Sections
//!
//! - **core**: log level, data directory, staging directory
//! - **daemon**: operator socket, cycle length, idle timeout, fluid minimum
//! - **device**: socket.io namespace, vial count, request timeouts
//! - **dilution**: pump and bolus limits shared by every control law
//! - **alerts**: fluid custodians
//!
//! # Examples
//!
//! ```no_run
//! use evolver_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Listening on {}:{}", config.daemon.host, config.daemon.port);
//! println!("Cycle: {:?}", config.daemon.cycle());
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Daemon loop and operator socket settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Device connection settings
    #[serde(default)]
    pub device: DeviceConfig,

    /// Dilution limits
    #[serde(default)]
    pub dilution: DilutionConfig,

    /// Fluid alert settings
    #[serde(default)]
    pub alerts: AlertsConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory operators drop experiment fragments into (supports ~ expansion)
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Operator socket bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Operator socket port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Background loop period in seconds
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: f64,

    /// Cycles without devices before the daemon exits; also sizes the
    /// pending-start deadline
    #[serde(default = "default_idle_cycles")]
    pub idle_cycles: u32,

    /// Upper bound on one operator request/response exchange
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Fluid volume below which a refill is requested
    #[serde(default = "default_min_fluid_volume")]
    pub min_fluid_volume: f64,
}

/// Device connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// socket.io namespace the units serve commands on
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Vials per device
    #[serde(default = "default_num_vials")]
    pub num_vials: usize,

    /// Attach timeout
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Calibration query timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Dilution limits
///
/// Volumes are in mL, times in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DilutionConfig {
    /// Extra efflux volume pumped on top of every bolus
    #[serde(default = "default_outflow_extra")]
    pub outflow_extra: f64,

    #[serde(default = "default_bolus_volume_min")]
    pub bolus_volume_min: f64,

    #[serde(default = "default_bolus_volume_max")]
    pub bolus_volume_max: f64,

    /// Largest bolus a recurring schedule may use
    #[serde(default = "default_bolus_repeat_max")]
    pub bolus_repeat_max: f64,

    /// Cap on any single pump activation
    #[serde(default = "default_pump_time_max")]
    pub pump_time_max: f64,

    /// Shortest period between recurring pump activations
    #[serde(default = "default_min_pump_period")]
    pub min_pump_period: f64,

    /// Seconds per rate unit (rates are per hour)
    #[serde(default = "default_secs_per_unit_time")]
    pub secs_per_unit_time: f64,

    /// Exponent of the serial dilution robustness term
    #[serde(default = "default_pow_param")]
    pub pow_param: f64,

    /// Weight of the serial dilution robustness term
    #[serde(default = "default_const_param")]
    pub const_param: f64,

    /// Temperature deviation tolerated before the setpoint is re-sent
    #[serde(default = "default_delta_t")]
    pub delta_t: f64,
}

/// Fluid alert configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Fluid name to the addresses notified when it runs low
    #[serde(default)]
    pub custodians: HashMap<String, Vec<String>>,
}

impl DaemonConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_secs_f64(self.cycle_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    /// How long an announced experiment may wait for its fragments
    pub fn pending_deadline(&self) -> Duration {
        self.cycle() * self.idle_cycles
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cycle_secs: default_cycle_secs(),
            idle_cycles: default_idle_cycles(),
            client_timeout_secs: default_client_timeout_secs(),
            min_fluid_volume: default_min_fluid_volume(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            num_vials: default_num_vials(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for DilutionConfig {
    fn default() -> Self {
        Self {
            outflow_extra: default_outflow_extra(),
            bolus_volume_min: default_bolus_volume_min(),
            bolus_volume_max: default_bolus_volume_max(),
            bolus_repeat_max: default_bolus_repeat_max(),
            pump_time_max: default_pump_time_max(),
            min_pump_period: default_min_pump_period(),
            secs_per_unit_time: default_secs_per_unit_time(),
            pow_param: default_pow_param(),
            const_param: default_const_param(),
            delta_t: default_delta_t(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.evolver")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("~/.evolver/staging")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8800
}

fn default_cycle_secs() -> f64 {
    4.0
}

fn default_idle_cycles() -> u32 {
    10
}

fn default_client_timeout_secs() -> u64 {
    10
}

fn default_min_fluid_volume() -> f64 {
    500.0
}

fn default_namespace() -> String {
    "/dpu-evolver".to_string()
}

fn default_num_vials() -> usize {
    16
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_outflow_extra() -> f64 {
    5.0
}

fn default_bolus_volume_min() -> f64 {
    0.2
}

fn default_bolus_volume_max() -> f64 {
    15.0
}

fn default_bolus_repeat_max() -> f64 {
    5.0
}

fn default_pump_time_max() -> f64 {
    18.0
}

fn default_min_pump_period() -> f64 {
    120.0
}

fn default_secs_per_unit_time() -> f64 {
    3600.0
}

fn default_pow_param() -> f64 {
    1.0
}

fn default_const_param() -> f64 {
    1.0
}

fn default_delta_t() -> f64 {
    0.2
}

impl Config {
    /// Load configuration from the default location or create it
    ///
    /// Attempts to load configuration from ~/.evolver/config.toml. If the file
    /// doesn't exist, creates a default configuration and saves it.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.evolver/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".evolver").join("config.toml"))
    }

    /// Create a default configuration
    fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
                staging_dir: default_staging_dir(),
            },
            daemon: DaemonConfig::default(),
            device: DeviceConfig::default(),
            dilution: DilutionConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, timings and dilution limits
    /// - Expands ~ in paths
    /// - Creates the data and staging directories
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` naming the first offending field.
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !(self.daemon.cycle_secs.is_finite() && self.daemon.cycle_secs > 0.0) {
            return Err(EngineError::Config(
                "cycle_secs must be a positive number".to_string(),
            ));
        }
        if self.daemon.idle_cycles == 0 {
            return Err(EngineError::Config(
                "idle_cycles must be at least 1".to_string(),
            ));
        }
        if self.device.num_vials == 0 {
            return Err(EngineError::Config(
                "num_vials must be at least 1".to_string(),
            ));
        }
        if !self.device.namespace.starts_with('/') {
            return Err(EngineError::Config(format!(
                "Device namespace '{}' must start with '/'",
                self.device.namespace
            )));
        }

        let d = &self.dilution;
        if !(d.bolus_volume_min > 0.0
            && d.bolus_volume_min <= d.bolus_repeat_max
            && d.bolus_repeat_max <= d.bolus_volume_max)
        {
            return Err(EngineError::Config(
                "bolus limits must satisfy 0 < bolus_volume_min <= bolus_repeat_max <= bolus_volume_max"
                    .to_string(),
            ));
        }
        if d.min_pump_period <= 0.0 || d.pump_time_max <= 0.0 || d.secs_per_unit_time <= 0.0 {
            return Err(EngineError::Config(
                "min_pump_period, pump_time_max and secs_per_unit_time must be positive"
                    .to_string(),
            ));
        }
        if d.outflow_extra < 0.0 || d.delta_t < 0.0 {
            return Err(EngineError::Config(
                "outflow_extra and delta_t must not be negative".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.core.staging_dir = expand_path(&self.core.staging_dir)?;

        for dir in [&self.core.data_dir, &self.core.staging_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    EngineError::Config(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
