//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `logger.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - SamplingConfig: interval, fault threshold, store retry policy.
//!     - SensorsConfig: where the one-wire devices live, optional fixed list.
//!     - StorageConfig: sample log, pid lock and daemon output paths.
//!     - SupervisorConfig: start/stop timeouts.
//!     - LoggingConfig: log level and console echo of readings.
//!
//! ==============================================================================

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIN_INTERVAL: Duration = Duration::from_millis(1);
const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 3600);
const MAX_TIMEOUT_MS: u64 = 24 * 3600 * 1000;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggerConfig {
    pub sampling: SamplingConfig,
    pub sensors: SensorsConfig,
    pub storage: StorageConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SamplingConfig {
    pub interval_seconds: f64,
    /// consecutive faults on one sensor before a warning is raised
    pub fault_warn_threshold: u32,
    /// attempts per append before the loop gives up
    pub store_retry_limit: u32,
    pub store_retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SensorsConfig {
    pub w1_devices_dir: PathBuf,
    /// hardware ids to sample; empty means auto-discover
    pub devices: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub store_path: PathBuf,
    pub lock_path: PathBuf,
    pub daemon_log_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    pub start_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub kill_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
    pub console_interval_seconds: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 2.0,
            fault_warn_threshold: 3,
            store_retry_limit: 3,
            store_retry_backoff_ms: 200,
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            w1_devices_dir: PathBuf::from("/sys/bus/w1/devices"),
            devices: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("var").join("temperatures.jsonl"),
            lock_path: PathBuf::from("var").join("tlog.pid"),
            daemon_log_path: PathBuf::from("var").join("tlog.out"),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 5000,
            stop_grace_ms: 5000,
            kill_timeout_ms: 2000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
            console_interval_seconds: 10,
        }
    }
}

impl LoggerConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: LoggerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    ///
    /// returns the config together with the file it came from, so the
    /// supervisor can hand the same file to the process it spawns. runs
    /// before logging is set up, hence eprintln. a config file that exists
    /// but does not load is an error, not a reason to fall back.
    pub fn load_or_default() -> anyhow::Result<(Self, Option<PathBuf>)> {
        Self::load_first(&[
            PathBuf::from("config").join("logger.toml"),
            PathBuf::from("..").join("config").join("logger.toml"),
        ])
    }

    fn load_first(paths: &[PathBuf]) -> anyhow::Result<(Self, Option<PathBuf>)> {
        for path in paths {
            if path.exists() {
                let config = Self::load(path)?;
                eprintln!("[CONFIG] Loaded from {}", path.display());
                return Ok((config, Some(path.clone())));
            }
        }

        eprintln!("[CONFIG] Warning: No config file found - using defaults");
        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let interval = self.sampling.interval_seconds;
        match Duration::try_from_secs_f64(interval) {
            Ok(d) if (MIN_INTERVAL..=MAX_INTERVAL).contains(&d) => {}
            _ => bail!(
                "sampling.interval_seconds must be between {} and {}, got {interval}",
                MIN_INTERVAL.as_secs_f64(),
                MAX_INTERVAL.as_secs_f64()
            ),
        }
        let supervisor = &self.supervisor;
        for (name, ms) in [
            ("start_timeout_ms", supervisor.start_timeout_ms),
            ("stop_grace_ms", supervisor.stop_grace_ms),
            ("kill_timeout_ms", supervisor.kill_timeout_ms),
            ("poll_interval_ms", supervisor.poll_interval_ms),
        ] {
            if ms > MAX_TIMEOUT_MS {
                bail!("supervisor.{name} must be at most {MAX_TIMEOUT_MS}, got {ms}");
            }
        }
        if self.sampling.store_retry_limit == 0 {
            bail!("sampling.store_retry_limit must be at least 1");
        }
        if self.supervisor.poll_interval_ms == 0 {
            bail!("supervisor.poll_interval_ms must be at least 1");
        }
        Ok(())
    }

    /// the sampling period, clamped to what `validate` accepts
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.sampling.interval_seconds)
            .unwrap_or(MAX_INTERVAL)
            .clamp(MIN_INTERVAL, MAX_INTERVAL)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          LOGGER CONFIGURATION           │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Interval:   {}s", self.sampling.interval_seconds);
        println!("│ Devices:    {}", self.device_summary());
        println!("│ Sample log: {}", self.storage.store_path.display());
        println!("│ Lock file:  {}", self.storage.lock_path.display());
        println!("│ Log level:  {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }

    fn device_summary(&self) -> String {
        if self.sensors.devices.is_empty() {
            format!("auto ({})", self.sensors.w1_devices_dir.display())
        } else {
            self.sensors.devices.join(", ")
        }
    }
}
