//! ==============================================================================
//! error.rs - error taxonomy
//! ==============================================================================
//!
//! purpose:
//!     typed failures for every layer. device faults are recorded as data
//!     (see SensorReading::fault), everything else propagates to the
//!     operator with the path or pid needed to diagnose it.
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;

/// why a single sensor read produced no temperature
#[derive(Debug, thiserror::Error)]
pub enum DeviceFault {
    #[error("device file {path} not found (sensor unplugged or w1 overlay disabled?)")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("crc check failed")]
    CrcMismatch,

    #[error("malformed payload: {detail}")]
    Malformed { detail: String },

    #[error("power-on reset value 85000 (sensor lost power during conversion)")]
    PowerOnReset,

    #[error("scratchpad is all zeros (data line disconnected)")]
    Disconnected,

    #[error("{millidegrees} m°C is outside the sensor range")]
    OutOfRange { millidegrees: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open sample log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to append to sample log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to read sample log {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt entry in {path} at byte {offset}: {detail}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        detail: String,
    },

    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        source: notify::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("logger already running (pid {pid}, since {since})")]
    AlreadyRunning { pid: u32, since: DateTime<Utc> },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("lock file {path} is unreadable: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("could not take lock {path}: other processes kept racing for it")]
    Contended { path: PathBuf },

    #[error("stale lock {path} could not be reclaimed: {source}")]
    Reclaim {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("no one-wire temperature sensors found under {dir}")]
    NoDevices { dir: PathBuf },

    #[error("failed to list one-wire devices in {dir}: {source}")]
    Discovery {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("sample log unwritable after {attempts} attempts: {source}")]
    StoreUnwritable { attempts: u32, source: StoreError },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("logger already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("logger is not running")]
    NotRunning,

    #[error("logger pid {pid} did not take the lock within {waited:?}")]
    StartTimeout { pid: u32, waited: Duration },

    #[error("logger pid {pid} exited during startup ({status}); see {log}")]
    ExitedEarly {
        pid: u32,
        status: std::process::ExitStatus,
        log: PathBuf,
    },

    #[error("logger pid {pid} still alive {waited:?} after SIGKILL")]
    StopTimeout { pid: u32, waited: Duration },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("could not signal pid {pid}")]
    Signal { pid: u32 },

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LockError> for SupervisorError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyRunning { pid, .. } => Self::AlreadyRunning { pid },
            other => Self::Lock(other),
        }
    }
}

/// machine-checkable outcome of a control command, used as the exit code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStatus {
    Success = 0,
    Error = 1,
    AlreadyRunning = 2,
    NotRunning = 3,
    Timeout = 4,
}

impl ControlStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl SupervisorError {
    pub fn exit_status(&self) -> ControlStatus {
        match self {
            Self::AlreadyRunning { .. } => ControlStatus::AlreadyRunning,
            Self::NotRunning => ControlStatus::NotRunning,
            Self::StartTimeout { .. } | Self::StopTimeout { .. } => ControlStatus::Timeout,
            _ => ControlStatus::Error,
        }
    }
}

impl SamplerError {
    pub fn exit_status(&self) -> ControlStatus {
        match self {
            Self::Lock(LockError::AlreadyRunning { .. }) => ControlStatus::AlreadyRunning,
            _ => ControlStatus::Error,
        }
    }
}
