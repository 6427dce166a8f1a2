//! ==============================================================================
//! w1.rs - one-wire DS18x20 reader
//! ==============================================================================
//!
//! purpose:
//!     reads temperature sensors through the kernel's w1-therm driver.
//!     every sensor shows up as a directory named after its 64-bit rom
//!     address (family code, dash, 12 hex digits), holding a `w1_slave`
//!     file that triggers a conversion when read:
//!
//!         72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//!         72 01 4b 46 7f ff 0e 10 57 t=23125
//!
//!     the first line carries the driver's crc verdict, the second the
//!     temperature in millidegrees celsius.
//!
//! relationships:
//!     - implements: hal.rs (SensorBus)
//!     - used by: main.rs (builds the bus for `tlog run` and `tlog devices`)
//!
//! ==============================================================================

use crate::domain::{SensorDevice, SensorReading};
use crate::error::{DeviceFault, SamplerError};
use crate::hal::SensorBus;

use chrono::Utc;
use std::path::{Path, PathBuf};

/// DS18S20, DS1822, DS18B20, DS1825, DS28EA00
const THERMOMETER_FAMILIES: [&str; 5] = ["10", "22", "28", "3b", "42"];

/// what the scratchpad holds after power-up, before any conversion ran
const POWER_ON_RESET_MILLIDEGREES: i64 = 85_000;

const MIN_MILLIDEGREES: i64 = -55_000;
const MAX_MILLIDEGREES: i64 = 125_000;

/// sysfs-backed one-wire bus
pub struct W1Bus {
    devices_dir: PathBuf,
}

impl W1Bus {
    pub fn new(devices_dir: impl Into<PathBuf>) -> Self {
        Self {
            devices_dir: devices_dir.into(),
        }
    }

    /// device handle for an explicitly configured sensor id
    pub fn device(&self, id: &str) -> SensorDevice {
        SensorDevice::new(id, self.devices_dir.join(id).join("w1_slave"))
    }
}

impl SensorBus for W1Bus {
    fn discover(&self) -> Result<Vec<SensorDevice>, SamplerError> {
        let entries =
            std::fs::read_dir(&self.devices_dir).map_err(|source| SamplerError::Discovery {
                dir: self.devices_dir.clone(),
                source,
            })?;

        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| is_thermometer_id(name))
            .collect();
        ids.sort();

        tracing::debug!(dir = %self.devices_dir.display(), found = ids.len(), "one-wire discovery");
        Ok(ids.iter().map(|id| self.device(id)).collect())
    }

    fn read(&self, device: &SensorDevice) -> SensorReading {
        match read_celsius(&device.device_path) {
            Ok(celsius) => SensorReading::ok(&device.id, Utc::now(), celsius),
            Err(fault) => SensorReading::fault(&device.id, Utc::now(), fault.to_string()),
        }
    }
}

/// `28-0316a2791aff` style names whose family code is a thermometer
fn is_thermometer_id(name: &str) -> bool {
    let Some((family, serial)) = name.split_once('-') else {
        return false;
    };
    THERMOMETER_FAMILIES.contains(&family.to_ascii_lowercase().as_str())
        && serial.len() == 12
        && serial.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn read_celsius(path: &Path) -> Result<f64, DeviceFault> {
    let payload = std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DeviceFault::Missing {
                path: path.to_path_buf(),
            }
        } else {
            DeviceFault::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    parse_w1_slave(&payload).map(|milli| milli as f64 / 1000.0)
}

/// returns the temperature in millidegrees celsius
pub fn parse_w1_slave(payload: &str) -> Result<i64, DeviceFault> {
    let mut lines = payload.lines().map(str::trim).filter(|l| !l.is_empty());

    let status = lines.next().ok_or_else(|| DeviceFault::Malformed {
        detail: "empty payload".to_string(),
    })?;
    let (scratchpad, verdict) = status.split_once(':').ok_or_else(|| DeviceFault::Malformed {
        detail: format!("no crc field in '{status}'"),
    })?;
    match verdict.split_whitespace().last() {
        Some("YES") => {}
        Some("NO") => return Err(DeviceFault::CrcMismatch),
        _ => {
            return Err(DeviceFault::Malformed {
                detail: format!("unexpected crc verdict in '{status}'"),
            })
        }
    }

    // a floating data line reads back as zeros and still passes the crc
    if scratchpad.split_whitespace().all(|b| b == "00") {
        return Err(DeviceFault::Disconnected);
    }

    let data = lines.next().ok_or_else(|| DeviceFault::Malformed {
        detail: "missing temperature line".to_string(),
    })?;
    let (_, raw) = data.rsplit_once("t=").ok_or_else(|| DeviceFault::Malformed {
        detail: format!("no t= field in '{data}'"),
    })?;
    let milli: i64 = raw.trim().parse().map_err(|_| DeviceFault::Malformed {
        detail: format!("expected integer millidegrees, got '{}'", raw.trim()),
    })?;

    if milli == POWER_ON_RESET_MILLIDEGREES {
        return Err(DeviceFault::PowerOnReset);
    }
    if !(MIN_MILLIDEGREES..=MAX_MILLIDEGREES).contains(&milli) {
        return Err(DeviceFault::OutOfRange { millidegrees: milli });
    }
    Ok(milli)
}
