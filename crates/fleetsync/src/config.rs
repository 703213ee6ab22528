//! Configuration management for fleetsync.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionKind, DEFAULT_BAUD_RATE};
use crate::backoff::Backoff;
use crate::buffer::{BufferOptions, CapacityPolicy};
use crate::codec::{CompressionKind, MAX_LINE_OVERHEAD};
use crate::error::{Error, Result};
use crate::power::PowerThresholds;
use crate::sync::SyncOptions;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "fleetsync";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "buffer.db";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FLEETSYNC_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FLEETSYNC_`, `__` between
///    section and key, e.g. `FLEETSYNC_SYNC__INTERVAL_SECONDS=10`)
/// 2. TOML config file at `~/.config/fleetsync/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unit identity.
    pub device: DeviceConfig,
    /// Local buffer.
    pub buffer: BufferConfig,
    /// Sync engine.
    pub sync: SyncConfig,
    /// Remote store.
    pub remote: RemoteConfig,
    /// Connectivity monitor.
    pub connectivity: ConnectivityConfig,
    /// Power event monitor.
    pub power: PowerConfig,
    /// Acquisition source.
    pub acquisition: AcquisitionConfig,
    /// Task supervision.
    pub orchestrator: OrchestratorConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Unit identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identifier stamped on acquired records and used in the remote URL.
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "fleet-001".to_string(),
        }
    }
}

/// Buffer-related configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/fleetsync/buffer.db`
    pub database_path: Option<PathBuf>,
    /// Maximum age of any entry in days.
    pub retention_days: u32,
    /// Upper bound on stored payload bytes.
    pub max_size_bytes: u64,
    /// Largest single record accepted.
    pub max_record_bytes: u64,
    /// Behaviour when full.
    pub capacity_policy: CapacityPolicy,
    /// How often the retention sweep runs.
    pub sweep_interval_seconds: u64,
    /// How far past the local clock a record timestamp may lie.
    pub max_future_skew_seconds: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            retention_days: 7,
            max_size_bytes: 100 * 1024 * 1024,
            max_record_bytes: 64 * 1024,
            capacity_policy: CapacityPolicy::DropOldest,
            sweep_interval_seconds: 3600,
            max_future_skew_seconds: 600,
        }
    }
}

/// Sync-related configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Time between scheduled cycles.
    pub interval_seconds: u64,
    /// Most entries per batch.
    pub batch_max_count: usize,
    /// Most uncompressed bytes per batch.
    pub batch_max_bytes: usize,
    /// Failures before an entry is marked permanently failed.
    pub max_retry_count: u32,
    /// Bound on one remote write.
    pub attempt_timeout_seconds: u64,
    /// First retry delay.
    pub retry_base_seconds: u64,
    /// Retry delay cap.
    pub retry_max_seconds: u64,
    /// Payload compression.
    pub compression: CompressionKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 30,
            batch_max_count: 250,
            batch_max_bytes: 512 * 1024,
            max_retry_count: 5,
            attempt_timeout_seconds: 15,
            retry_base_seconds: 5,
            retry_max_seconds: 900,
            compression: CompressionKind::Gzip,
        }
    }
}

/// Remote store configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Ingest URL; may contain `{device_id}`.
    pub endpoint: Option<String>,
    /// Bearer token.
    pub auth_token: Option<String>,
    /// File holding the bearer token; re-read on SIGHUP.
    pub auth_token_file: Option<PathBuf>,
}

/// How reachability is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMethod {
    /// TCP connect to the remote host.
    #[default]
    Tcp,
    /// Operational state of a network interface (Linux).
    Interface,
}

/// Connectivity monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Probe method.
    pub method: ConnectivityMethod,
    /// `host:port` for the TCP probe; derived from the endpoint when unset.
    pub probe_address: Option<String>,
    /// Interface for the interface probe, e.g. `wwan0`.
    pub interface: Option<String>,
    /// Time between probes.
    pub interval_seconds: u64,
    /// Bound on one probe.
    pub probe_timeout_seconds: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            method: ConnectivityMethod::Tcp,
            probe_address: None,
            interface: None,
            interval_seconds: 15,
            probe_timeout_seconds: 5,
        }
    }
}

/// Power monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Run the power monitor.
    pub enabled: bool,
    /// Battery directory under `/sys/class/power_supply`; auto-detected when unset.
    pub supply_path: Option<PathBuf>,
    /// Time between samples.
    pub poll_interval_seconds: u64,
    /// Low tier boundary in percent.
    pub low_threshold_percent: f64,
    /// Critical tier boundary in percent.
    pub critical_threshold_percent: f64,
    /// Bound on shutdown, task joins and final flush included.
    pub shutdown_grace_seconds: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            supply_path: None,
            poll_interval_seconds: 10,
            low_threshold_percent: 20.0,
            critical_threshold_percent: 5.0,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Acquisition configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Source type.
    pub kind: AcquisitionKind,
    /// Device or file to read; `-` for stdin.
    pub path: PathBuf,
    /// Serial line speed when `path` is a device.
    pub baud_rate: u32,
    /// Records reporting fewer satellites are dropped at intake.
    pub min_satellites: u8,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            kind: AcquisitionKind::Nmea,
            path: PathBuf::from("/dev/ttyUSB1"),
            baud_rate: DEFAULT_BAUD_RATE,
            min_satellites: 4,
        }
    }
}

/// Supervision configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Time between health checks.
    pub health_interval_seconds: u64,
    /// Restarts allowed per component.
    pub max_restarts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_interval_seconds: 30,
            max_restarts: 3,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily-rolling log files; stderr only when unset.
    pub directory: Option<PathBuf>,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `FLEETSYNC_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.device.id.trim().is_empty() {
            return Err(invalid("device.id must not be empty"));
        }

        let buffer = &self.buffer;
        if buffer.retention_days == 0 {
            return Err(invalid("buffer.retention_days must be greater than 0"));
        }
        if buffer.max_record_bytes == 0 || buffer.max_record_bytes > buffer.max_size_bytes {
            return Err(invalid(format!(
                "buffer.max_record_bytes ({}) must be between 1 and buffer.max_size_bytes ({})",
                buffer.max_record_bytes, buffer.max_size_bytes
            )));
        }
        if buffer.sweep_interval_seconds == 0 {
            return Err(invalid("buffer.sweep_interval_seconds must be greater than 0"));
        }

        let sync = &self.sync;
        for (name, value) in [
            ("sync.interval_seconds", sync.interval_seconds),
            ("sync.attempt_timeout_seconds", sync.attempt_timeout_seconds),
            ("sync.retry_base_seconds", sync.retry_base_seconds),
            ("connectivity.interval_seconds", self.connectivity.interval_seconds),
            ("connectivity.probe_timeout_seconds", self.connectivity.probe_timeout_seconds),
            ("power.poll_interval_seconds", self.power.poll_interval_seconds),
            ("power.shutdown_grace_seconds", self.power.shutdown_grace_seconds),
            ("orchestrator.health_interval_seconds", self.orchestrator.health_interval_seconds),
            ("acquisition.baud_rate", u64::from(self.acquisition.baud_rate)),
        ] {
            if value == 0 {
                return Err(invalid(format!("{name} must be greater than 0")));
            }
        }
        if sync.batch_max_count == 0 {
            return Err(invalid("sync.batch_max_count must be greater than 0"));
        }
        if sync.max_retry_count == 0 {
            return Err(invalid("sync.max_retry_count must be greater than 0"));
        }
        if sync.retry_max_seconds < sync.retry_base_seconds {
            return Err(invalid(format!(
                "sync.retry_max_seconds ({}) cannot be less than sync.retry_base_seconds ({})",
                sync.retry_max_seconds, sync.retry_base_seconds
            )));
        }
        // a batch must always fit at least one record
        let min_batch = buffer.max_record_bytes.saturating_add(MAX_LINE_OVERHEAD as u64);
        if (sync.batch_max_bytes as u64) < min_batch {
            return Err(invalid(format!(
                "sync.batch_max_bytes ({}) must be at least buffer.max_record_bytes + {MAX_LINE_OVERHEAD} ({min_batch})",
                sync.batch_max_bytes
            )));
        }

        if let Some(endpoint) = &self.remote.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid(format!(
                    "remote.endpoint must be an http(s) URL, got '{endpoint}'"
                )));
            }
        }

        if self.connectivity.method == ConnectivityMethod::Interface
            && self.connectivity.interface.as_deref().map_or(true, str::is_empty)
        {
            return Err(invalid(
                "connectivity.interface is required when connectivity.method is 'interface'",
            ));
        }

        let power = &self.power;
        if !(0.0..=100.0).contains(&power.low_threshold_percent)
            || !(0.0..=100.0).contains(&power.critical_threshold_percent)
            || power.critical_threshold_percent >= power.low_threshold_percent
        {
            return Err(invalid(format!(
                "power thresholds must satisfy 0 <= critical ({}) < low ({}) <= 100",
                power.critical_threshold_percent, power.low_threshold_percent
            )));
        }

        Ok(())
    }

    /// Copy with secrets masked, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.remote.auth_token.is_some() {
            config.remote.auth_token = Some("<redacted>".to_string());
        }
        config
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.buffer
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// The configured endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if `remote.endpoint` is unset.
    pub fn remote_endpoint(&self) -> Result<&str> {
        self.remote
            .endpoint
            .as_deref()
            .ok_or_else(|| invalid("remote.endpoint is not set"))
    }

    /// Retry schedule for failed entries.
    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.sync.retry_base_seconds),
            Duration::from_secs(self.sync.retry_max_seconds),
        )
    }

    /// Options for opening the buffer store.
    #[must_use]
    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            max_size_bytes: self.buffer.max_size_bytes,
            max_record_bytes: self.buffer.max_record_bytes,
            capacity_policy: self.buffer.capacity_policy,
            max_retry_count: self.sync.max_retry_count,
            backoff: self.backoff(),
            retention: chrono::Duration::days(i64::from(self.buffer.retention_days)),
            max_future_skew: Duration::from_secs(self.buffer.max_future_skew_seconds),
        }
    }

    /// Options for the sync engine.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            batch_max_count: self.sync.batch_max_count,
            batch_max_bytes: self.sync.batch_max_bytes,
            attempt_timeout: self.attempt_timeout(),
        }
    }

    /// Power tier boundaries.
    #[must_use]
    pub fn power_thresholds(&self) -> PowerThresholds {
        PowerThresholds {
            low_percent: self.power.low_threshold_percent,
            critical_percent: self.power.critical_threshold_percent,
        }
    }

    /// Get the sync interval as a Duration.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_seconds)
    }

    /// Get the remote write timeout as a Duration.
    #[must_use]
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.attempt_timeout_seconds)
    }

    /// Get the retention sweep interval as a Duration.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.buffer.sweep_interval_seconds)
    }

    /// Get the connectivity probe interval as a Duration.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity.interval_seconds)
    }

    /// Get the connectivity probe timeout as a Duration.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity.probe_timeout_seconds)
    }

    /// Get the power poll interval as a Duration.
    #[must_use]
    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_secs(self.power.poll_interval_seconds)
    }

    /// Get the shutdown flush budget as a Duration.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.power.shutdown_grace_seconds)
    }

    /// Get the health check interval as a Duration.
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.health_interval_seconds)
    }
}
