//! ==============================================================================
//! lock.rs - pid lock with liveness check
//! ==============================================================================
//!
//! purpose:
//!     guarantees at most one sampling loop per fleet. the lock is a small
//!     json record (pid, wall-clock start, process start time) at a
//!     well-known path. it is NOT a plain lock file: a record whose process
//!     is gone (crash, SIGKILL, reboot, pid recycled) is stale and gets
//!     reclaimed by the next starter instead of blocking it forever.
//!
//! protocol:
//!     acquire:  write record to a private temp file, fsync, hard_link it to
//!               the lock path. link fails if the path exists, so the lock
//!               is never visible half-written.
//!     reclaim:  rename the stale lock aside, re-read it, and delete it
//!               only if it is still the record judged stale. a fresh lock
//!               grabbed by a racing starter is linked back.
//!     release:  remove the lock only if it still names this process.
//!
//! relationships:
//!     - used by: sampler.rs (hold while running), supervisor.rs (inspect)
//!     - uses: process.rs (liveness)
//!
//! ==============================================================================

use crate::error::LockError;
use crate::process::{self, ProcessIdentity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const MAX_ATTEMPTS: u32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// process start time from the process table, guards against pid reuse
    #[serde(default)]
    pub process_start: u64,
}

impl LockRecord {
    fn identity(&self) -> ProcessIdentity {
        ProcessIdentity {
            pid: self.pid,
            start_time: self.process_start,
        }
    }

    pub fn is_live(&self) -> bool {
        process::is_alive(self.identity())
    }
}

/// what is at the lock path right now
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    Absent,
    Held(LockRecord),
    /// owner is dead; `None` when the record could not be parsed
    Stale(Option<LockRecord>),
}

/// look at the lock without touching it
pub fn inspect(path: &Path) -> Result<LockState, LockError> {
    match read_record(path) {
        Ok(None) => Ok(LockState::Absent),
        Ok(Some(r)) if r.is_live() => Ok(LockState::Held(r)),
        Ok(Some(r)) => Ok(LockState::Stale(Some(r))),
        Err(LockError::Corrupt { .. }) => Ok(LockState::Stale(None)),
        Err(e) => Err(e),
    }
}

/// exclusive right to run the sampling loop; released on drop
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl ProcessLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, LockError> {
        let path = path.into();
        let me = process::current();
        let record = LockRecord {
            pid: me.pid,
            started_at: Utc::now(),
            process_start: me.start_time,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }

        for _ in 0..MAX_ATTEMPTS {
            match try_create(&path, &record) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), pid = record.pid, "lock acquired");
                    return Ok(Self {
                        path,
                        record,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(LockError::Io { path, source }),
            }

            match read_record(&path) {
                // released between our link and our read
                Ok(None) => continue,
                Ok(Some(holder)) if holder.is_live() => {
                    return Err(LockError::AlreadyRunning {
                        pid: holder.pid,
                        since: holder.started_at,
                    });
                }
                Ok(Some(stale)) => reclaim(&path, Some(&stale))?,
                Err(LockError::Corrupt { detail, .. }) => {
                    tracing::warn!(path = %path.display(), "unreadable lock record ({detail})");
                    reclaim(&path, None)?
                }
                Err(e) => return Err(e),
            }
        }
        Err(LockError::Contended { path })
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match read_record(&self.path) {
            Ok(Some(r)) if r == self.record => {
                std::fs::remove_file(&self.path).map_err(|source| LockError::Io {
                    path: self.path.clone(),
                    source,
                })?;
                tracing::debug!(path = %self.path.display(), "lock released");
                Ok(())
            }
            Ok(_) | Err(LockError::Corrupt { .. }) => {
                tracing::warn!(path = %self.path.display(), "lock no longer ours, leaving it alone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!("failed to release lock: {e}");
        }
    }
}

/// remove a stale lock on behalf of an operator command
///
/// returns false if the lock changed since it was inspected.
pub fn clear_stale(path: &Path, observed: &LockState) -> Result<bool, LockError> {
    match observed {
        LockState::Stale(record) => {
            reclaim(path, record.as_ref())?;
            Ok(!path.exists())
        }
        _ => Ok(false),
    }
}

fn try_create(path: &Path, record: &LockRecord) -> io::Result<()> {
    let tmp = sibling(path, &format!("{}.tmp", record.pid));
    let body = serde_json::to_vec(record)?;
    let written = (|| {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(&body)?;
        f.sync_all()?;
        std::fs::hard_link(&tmp, path)
    })();
    let _ = std::fs::remove_file(&tmp);
    written
}

fn reclaim(path: &Path, observed: Option<&LockRecord>) -> Result<(), LockError> {
    let reclaim_err = |source| LockError::Reclaim {
        path: path.to_path_buf(),
        source,
    };
    let aside = sibling(path, &format!("stale.{}", std::process::id()));
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        // someone else already dealt with it
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(reclaim_err(e)),
    }

    let taken = read_record(&aside);
    let is_the_stale_one = match (observed, &taken) {
        (Some(seen), Ok(Some(now))) => seen == now,
        (None, Err(LockError::Corrupt { .. })) => true,
        _ => false,
    };

    if is_the_stale_one {
        std::fs::remove_file(&aside).map_err(reclaim_err)?;
        match observed {
            Some(r) => tracing::warn!(
                path = %path.display(),
                pid = r.pid,
                since = %r.started_at,
                "reclaimed stale lock (owner no longer running)"
            ),
            None => tracing::warn!(path = %path.display(), "reclaimed unreadable lock"),
        }
        return Ok(());
    }

    // we moved a lock that appeared after our check; put it back
    let restored = std::fs::hard_link(&aside, path);
    let _ = std::fs::remove_file(&aside);
    match restored {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(reclaim_err(e)),
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>, LockError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| LockError::Corrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// `<dir>/<name>.<suffix>` next to the lock
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    path.with_file_name(format!("{name}.{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::scratch_dir;
    use std::process::Command;

    fn write_record(path: &Path, pid: u32) -> LockRecord {
        let record = LockRecord {
            pid,
            started_at: Utc::now(),
            process_start: process::start_time(pid).unwrap_or(0),
        };
        std::fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
        record
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = scratch_dir("lock_basic");
        let path = dir.join("tlog.pid");

        let lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(lock.record().pid, std::process::id());
        assert!(matches!(inspect(&path).unwrap(), LockState::Held(r) if r.pid == std::process::id()));

        lock.release().unwrap();
        assert!(!path.exists());
        assert_eq!(inspect(&path).unwrap(), LockState::Absent);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_drop_releases() {
        let dir = scratch_dir("lock_drop");
        let path = dir.join("tlog.pid");
        {
            let _lock = ProcessLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = scratch_dir("lock_twice");
        let path = dir.join("tlog.pid");
        let _lock = ProcessLock::acquire(&path).unwrap();
        let err = ProcessLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid, .. } if pid == std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_live_foreign_owner_blocks() {
        let dir = scratch_dir("lock_foreign");
        let path = dir.join("tlog.pid");
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        write_record(&path, child.id());

        let err = ProcessLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { pid, .. } if pid == child.id()));

        child.kill().unwrap();
        child.wait().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = scratch_dir("lock_stale");
        let path = dir.join("tlog.pid");
        let stale = write_record(&path, dead_pid());
        assert_eq!(inspect(&path).unwrap(), LockState::Stale(Some(stale)));

        let lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(lock.record().pid, std::process::id());
        // no leftovers from the reclaim dance
        let names: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(names.len(), 1);
        drop(lock);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_record_is_reclaimed() {
        let dir = scratch_dir("lock_corrupt");
        let path = dir.join("tlog.pid");
        std::fs::write(&path, "12").unwrap();
        assert_eq!(inspect(&path).unwrap(), LockState::Stale(None));
        let lock = ProcessLock::acquire(&path).unwrap();
        assert_eq!(lock.record().pid, std::process::id());
        drop(lock);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = scratch_dir("lock_foreign_release");
        let path = dir.join("tlog.pid");
        let lock = ProcessLock::acquire(&path).unwrap();
        let other = write_record(&path, dead_pid());
        lock.release().unwrap();
        assert_eq!(inspect(&path).unwrap(), LockState::Stale(Some(other)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_reclaim_restores_a_fresh_lock() {
        let dir = scratch_dir("lock_race");
        let path = dir.join("tlog.pid");
        let stale = LockRecord {
            pid: dead_pid(),
            started_at: Utc::now(),
            process_start: 0,
        };
        // between our check and our rename, another starter took the lock
        let fresh = write_record(&path, std::process::id());
        reclaim(&path, Some(&stale)).unwrap();
        assert!(matches!(inspect(&path).unwrap(), LockState::Held(r) if r == fresh));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_clear_stale() {
        let dir = scratch_dir("lock_clear");
        let path = dir.join("tlog.pid");
        write_record(&path, dead_pid());
        let state = inspect(&path).unwrap();
        assert!(clear_stale(&path, &state).unwrap());
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
