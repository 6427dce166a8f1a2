//! ==============================================================================
//! domain.rs - readings, devices and log entries
//! ==============================================================================
//!
//! purpose:
//!     the plain data that flows from the one-wire reader, through the
//!     sampling loop, into the append-only store.
//!
//! relationships:
//!     - produced by: w1.rs (SensorReading), store.rs (LogEntry)
//!     - consumed by: sampler.rs, store.rs, follow.rs, supervisor.rs
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// outcome of a single read
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReadingStatus {
    Ok,
    Fault,
}

/// one timestamped sample from one sensor
///
/// a temperature is present if and only if the status is OK. both the
/// constructors and deserialization enforce that, so a reading pulled back
/// out of the log is as trustworthy as one fresh off the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawReading")]
pub struct SensorReading {
    sensor_id: String,
    timestamp: DateTime<Utc>,
    status: ReadingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl SensorReading {
    pub fn ok(sensor_id: impl Into<String>, timestamp: DateTime<Utc>, celsius: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            status: ReadingStatus::Ok,
            temperature_celsius: Some(celsius),
            detail: None,
        }
    }

    /// a failed read; `detail` says what went wrong
    pub fn fault(
        sensor_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            status: ReadingStatus::Fault,
            temperature_celsius: None,
            detail: Some(detail.into()),
        }
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    #[cfg(test)]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    #[cfg(test)]
    pub fn status(&self) -> ReadingStatus {
        self.status
    }

    pub fn temperature_celsius(&self) -> Option<f64> {
        self.temperature_celsius
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReadingStatus::Ok
    }
}

impl fmt::Display for SensorReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ");
        match self.temperature_celsius {
            Some(t) => write!(f, "{} {} {:>8.3} °C", ts, self.sensor_id, t),
            None => write!(
                f,
                "{} {} FAULT ({})",
                ts,
                self.sensor_id,
                self.detail.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

// wire shape before the status/temperature invariant is checked
#[derive(Deserialize)]
struct RawReading {
    sensor_id: String,
    timestamp: DateTime<Utc>,
    status: ReadingStatus,
    #[serde(default)]
    temperature_celsius: Option<f64>,
    #[serde(default)]
    detail: Option<String>,
}

impl TryFrom<RawReading> for SensorReading {
    type Error = String;

    fn try_from(raw: RawReading) -> Result<Self, Self::Error> {
        match (raw.status, raw.temperature_celsius) {
            (ReadingStatus::Ok, Some(t)) if t.is_finite() => Ok(Self {
                sensor_id: raw.sensor_id,
                timestamp: raw.timestamp,
                status: ReadingStatus::Ok,
                temperature_celsius: Some(t),
                detail: None,
            }),
            (ReadingStatus::Ok, _) => Err(format!(
                "reading from {} is OK but has no usable temperature",
                raw.sensor_id
            )),
            (ReadingStatus::Fault, Some(_)) => Err(format!(
                "reading from {} is FAULT but carries a temperature",
                raw.sensor_id
            )),
            (ReadingStatus::Fault, None) => Ok(Self {
                sensor_id: raw.sensor_id,
                timestamp: raw.timestamp,
                status: ReadingStatus::Fault,
                temperature_celsius: None,
                detail: raw.detail,
            }),
        }
    }
}

/// a physically wired sensor
#[derive(Clone, Debug)]
pub struct SensorDevice {
    /// hardware address, e.g. "28-0316a2791aff"
    pub id: String,
    /// the w1_slave file the kernel exposes for this sensor
    pub device_path: PathBuf,
    pub last_known_good: Option<SensorReading>,
}

impl SensorDevice {
    pub fn new(id: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            device_path: device_path.into(),
            last_known_good: None,
        }
    }
}

/// the on-disk form of a reading: one json object per line
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// arrival order, assigned by the store
    pub seq: u64,
    #[serde(flatten)]
    pub reading: SensorReading,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<6} {}", self.seq, self.reading)
    }
}
