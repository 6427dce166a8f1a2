//! ==============================================================================
//! process.rs - process table queries and signals
//! ==============================================================================
//!
//! purpose:
//!     the only place that talks to the os about other processes. used to
//!     decide whether a pid lock is live and to deliver SIGTERM / SIGKILL.
//!
//! relationships:
//!     - used by: lock.rs (liveness), supervisor.rs (signals)
//!     - uses: sysinfo
//!
//! ==============================================================================

use sysinfo::{Pid, ProcessStatus, Signal, System};

/// start times from the process table have one-second resolution
const START_TIME_SLACK_SECS: u64 = 2;

/// a pid plus the start time that identifies this particular incarnation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// seconds since the epoch, 0 when unknown
    pub start_time: u64,
}

/// identity of the calling process
pub fn current() -> ProcessIdentity {
    let pid = std::process::id();
    ProcessIdentity {
        pid,
        start_time: start_time(pid).unwrap_or(0),
    }
}

pub fn start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid).map(|p| p.start_time())
}

/// true if `pid` exists, is not a zombie, and (when known) started when
/// `start_time` says it did; a recycled pid does not count
pub fn is_alive(identity: ProcessIdentity) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(identity.pid);
    if !sys.refresh_process(pid) {
        return false;
    }
    let Some(process) = sys.process(pid) else {
        return false;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return false;
    }
    identity.start_time == 0
        || process.start_time().abs_diff(identity.start_time) <= START_TIME_SLACK_SECS
}

/// a pid is alive in the plainest sense: it exists and is not a zombie
#[cfg(test)]
pub fn pid_alive(pid: u32) -> bool {
    is_alive(ProcessIdentity { pid, start_time: 0 })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Forced,
}

/// deliver SIGTERM or SIGKILL; false if the process is gone or refused it
pub fn signal(pid: u32, how: Termination) -> bool {
    let mut sys = System::new();
    let spid = Pid::from_u32(pid);
    if !sys.refresh_process(spid) {
        return false;
    }
    let sig = match how {
        Termination::Graceful => Signal::Term,
        Termination::Forced => Signal::Kill,
    };
    let delivered = sys
        .process(spid)
        .and_then(|p| p.kill_with(sig))
        .unwrap_or(false);
    tracing::debug!(pid, signal = ?sig, delivered, "signal sent");
    delivered
}
