//! ==============================================================================
//! supervisor.rs - control plane
//! ==============================================================================
//!
//! purpose:
//!     the short-lived half of the system: one invocation per operator
//!     command. it never shares memory with the sampling loop; everything
//!     goes through the pid lock, posix signals and the sample log.
//!
//!     ┌─────────────┐  spawn `tlog run` (detached)   ┌───────────────┐
//!     │ tlog start  │ ─────────────────────────────> │ sampling loop │
//!     │ tlog stop   │ ── SIGTERM ... SIGKILL ──────> │  (sampler.rs) │
//!     │ tlog check  │ <── pid lock (lock.rs) ──────  │               │
//!     │ tlog tail   │ <── sample log (follow.rs) ──  │               │
//!     └─────────────┘                                └───────────────┘
//!
//! relationships:
//!     - uses: lock.rs, process.rs, store.rs, follow.rs
//!     - used by: main.rs
//!
//! ==============================================================================

use crate::config::LoggerConfig;
use crate::domain::LogEntry;
use crate::error::{StoreError, SupervisorError};
use crate::follow::LogFollow;
use crate::lock::{self, LockRecord, LockState};
use crate::process::{self, Termination};
use crate::store;

use chrono::{DateTime, Utc};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Running { pid: u32, since: DateTime<Utc> },
    /// `stale` is set when a lock from a dead loop is still on disk
    NotRunning { stale: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// the loop honoured SIGTERM and released its lock
    Graceful,
    /// the grace period ran out and SIGKILL was needed
    Forced,
}

/// how to launch the sampling loop; `run` is appended to `args`
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

pub struct Supervisor {
    config: LoggerConfig,
    launch: LaunchSpec,
}

impl Supervisor {
    pub fn new(config: LoggerConfig, launch: LaunchSpec) -> Self {
        Self { config, launch }
    }

    fn lock_path(&self) -> &Path {
        &self.config.storage.lock_path
    }

    fn poll(&self) -> Duration {
        Duration::from_millis(self.config.supervisor.poll_interval_ms.max(1))
    }

    /// report whether a sampling loop is alive; touches nothing
    pub fn check(&self) -> Result<Status, SupervisorError> {
        Ok(match lock::inspect(self.lock_path())? {
            LockState::Held(r) => Status::Running {
                pid: r.pid,
                since: r.started_at,
            },
            LockState::Absent => Status::NotRunning { stale: false },
            LockState::Stale(_) => Status::NotRunning { stale: true },
        })
    }

    /// (re)start the sampling loop in the background and return its pid
    pub async fn start(&self) -> Result<u32, SupervisorError> {
        if let Status::Running { pid, .. } = self.check()? {
            tracing::info!(pid, "logger already running, restarting it");
            self.stop().await?;
        }

        let log_path = &self.config.storage.daemon_log_path;
        let log_err = |source| {
            SupervisorError::Store(StoreError::Open {
                path: log_path.clone(),
                source,
            })
        };
        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(log_err)?;
        }
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let spawn_err = |source| SupervisorError::Spawn {
            program: self.launch.program.clone(),
            source,
        };
        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args)
            .arg("run")
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            // own process group: the operator's ctrl-c or ssh hangup must not reach it
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let mut child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();
        tracing::debug!(pid, program = %self.launch.program.display(), "spawned sampling loop");

        let timeout = Duration::from_millis(self.config.supervisor.start_timeout_ms);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().map_err(spawn_err)? {
                return Err(SupervisorError::ExitedEarly {
                    pid,
                    status,
                    log: log_path.clone(),
                });
            }
            if let LockState::Held(r) = lock::inspect(self.lock_path())? {
                if r.pid == pid {
                    tracing::info!(pid, "sampling loop running");
                    return Ok(pid);
                }
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SupervisorError::StartTimeout {
                    pid,
                    waited: timeout,
                });
            }
            tokio::time::sleep(self.poll()).await;
        }
    }

    /// stop the running loop: SIGTERM, wait out the grace period, then SIGKILL
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let lock_path = self.lock_path();
        let record = match lock::inspect(lock_path)? {
            LockState::Absent => return Err(SupervisorError::NotRunning),
            stale @ LockState::Stale(_) => {
                if lock::clear_stale(lock_path, &stale)? {
                    tracing::info!(path = %lock_path.display(), "removed stale lock");
                }
                return Err(SupervisorError::NotRunning);
            }
            LockState::Held(record) => record,
        };
        let pid = record.pid;

        if !process::signal(pid, Termination::Graceful) && record.is_live() {
            return Err(SupervisorError::Signal { pid });
        }

        let grace = Duration::from_millis(self.config.supervisor.stop_grace_ms);
        if self.wait_until(grace, || self.released(&record)).await {
            self.heal(lock_path)?;
            tracing::info!(pid, "logger stopped");
            return Ok(StopOutcome::Graceful);
        }

        tracing::warn!(pid, ?grace, "logger ignored SIGTERM, sending SIGKILL");
        process::signal(pid, Termination::Forced);
        let kill_wait = Duration::from_millis(self.config.supervisor.kill_timeout_ms);
        if self.wait_until(kill_wait, || !record.is_live()).await {
            // a killed loop never got to remove its lock
            self.heal(lock_path)?;
            return Ok(StopOutcome::Forced);
        }
        Err(SupervisorError::StopTimeout {
            pid,
            waited: kill_wait,
        })
    }

    /// print the last `n` entries, then (if `follow`) stream new ones until
    /// `cancel` resolves
    pub async fn tail<C, F>(
        &self,
        n: usize,
        follow: bool,
        cancel: C,
        mut out: F,
    ) -> Result<(), SupervisorError>
    where
        C: Future<Output = ()>,
        F: FnMut(&LogEntry),
    {
        let path = &self.config.storage.store_path;
        let mut recent = store::tail(path, n)?;
        for entry in recent.by_ref() {
            match entry {
                Ok(entry) => out(&entry),
                Err(e) => tracing::warn!("{e}"),
            }
        }
        if !follow {
            return Ok(());
        }

        // inotify does the real work; the poll only backs it up
        let poll = self.poll().max(Duration::from_millis(250));
        let mut follower = LogFollow::start(path, recent.offset(), poll);
        tokio::pin!(cancel);
        loop {
            tokio::select! {
                _ = &mut cancel => break,
                item = follower.next() => match item {
                    Some(Ok(entry)) => out(&entry),
                    Some(Err(e)) => tracing::warn!("{e}"),
                    None => break,
                },
            }
        }
        follower.stop().await;
        Ok(())
    }

    /// the loop behind `record` has let go of the lock (or died)
    fn released(&self, record: &LockRecord) -> bool {
        match lock::inspect(self.lock_path()) {
            Ok(LockState::Held(r)) => r != *record,
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("lock unreadable while waiting: {e}");
                false
            }
        }
    }

    fn heal(&self, lock_path: &Path) -> Result<(), SupervisorError> {
        let state = lock::inspect(lock_path)?;
        if matches!(state, LockState::Stale(_)) {
            lock::clear_stale(lock_path, &state)?;
        }
        Ok(())
    }

    async fn wait_until(&self, limit: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll()).await;
        }
    }
}
