//! ==============================================================================
//! follow.rs - live view of the sample log
//! ==============================================================================
//!
//! purpose:
//!     `tail -f` for the store. a background task picks up complete lines
//!     as the sampling loop appends them and hands them over a channel.
//!
//!     ┌──────────────┐  wake   ┌────────────┐  LogEntry  ┌────────────┐
//!     │ notify watch │ ──────> │ pump task  │ ─────────> │ LogFollow  │
//!     │ (log's dir)  │         │ (+ poll)   │   mpsc     │  .next()   │
//!     └──────────────┘         └────────────┘            └────────────┘
//!
//!     the poll interval covers filesystems where inotify says nothing
//!     (nfs, some fuse mounts). a log that shrinks below the read offset
//!     was truncated by maintenance and is re-read from the start.
//!
//! relationships:
//!     - reads: store.rs format (parse_line)
//!     - used by: supervisor.rs (tail)
//!
//! ==============================================================================

use crate::domain::LogEntry;
use crate::error::StoreError;
use crate::store::{is_blank, parse_line};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Item = Result<LogEntry, StoreError>;

pub struct LogFollow {
    rx: mpsc::Receiver<Item>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl LogFollow {
    /// follow `path` starting at byte `offset`
    ///
    /// pass `store::tail(..).offset()` to continue exactly where a one-shot
    /// tail stopped, or the file length to see only new entries.
    pub fn start(path: &Path, offset: u64, poll: Duration) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel::<()>(1);
        let watcher = watch_dir(path, wake_tx);

        let (tx, rx) = mpsc::channel(256);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            path.to_path_buf(),
            offset,
            poll,
            watcher.is_some().then_some(wake_rx),
            stop_rx,
            tx,
        ));

        Self {
            rx,
            stop_tx: Some(stop_tx),
            task: Some(task),
            _watcher: watcher,
        }
    }

    /// next appended entry; `None` once the follower is stopped
    pub async fn next(&mut self) -> Option<Item> {
        self.rx.recv().await
    }

    /// stop the pump and wait for it to let go of the file
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LogFollow {
    fn drop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
    }
}

fn watch_dir(path: &Path, wake_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            // a full channel already has a wake-up queued
            let _ = wake_tx.try_send(());
        }
    });
    let result = watcher.and_then(|mut w| w.watch(&dir, RecursiveMode::NonRecursive).map(|_| w));
    match result {
        Ok(w) => Some(w),
        Err(source) => {
            let err = StoreError::Watch { path: dir, source };
            tracing::debug!("{err}; falling back to polling");
            None
        }
    }
}

async fn pump(
    path: PathBuf,
    mut offset: u64,
    poll: Duration,
    mut wake_rx: Option<mpsc::Receiver<()>>,
    mut stop_rx: oneshot::Receiver<()>,
    tx: mpsc::Sender<Item>,
) {
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            woke = async {
                match wake_rx.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => None,
                }
            }, if wake_rx.is_some() => {
                if woke.is_none() {
                    wake_rx = None;
                }
            }
            _ = ticker.tick() => {}
        }

        let from = offset;
        let read_path = path.clone();
        let read = tokio::task::spawn_blocking(move || read_new(&read_path, from)).await;
        let (items, next) = match read {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("follow reader task failed: {e}");
                break;
            }
        };
        offset = next;
        for item in items {
            if tx.send(item).await.is_err() {
                return;
            }
        }
    }
}

/// complete lines after `offset`, and the offset to continue from
///
/// a line that does not parse is handed on as one `Corrupt` item and
/// skipped. an i/o error ends the batch; whatever was read before it is
/// kept and the next call retries from there.
fn read_new(path: &Path, offset: u64) -> (Vec<Item>, u64) {
    let mut items = Vec::new();
    let mut offset = offset;
    if let Err(source) = read_lines(path, &mut offset, &mut items) {
        items.push(Err(StoreError::Read {
            path: path.to_path_buf(),
            source,
        }));
    }
    (items, offset)
}

fn read_lines(path: &Path, offset: &mut u64, items: &mut Vec<Item>) -> io::Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let len = file.metadata()?.len();
    if len < *offset {
        tracing::warn!(path = %path.display(), "sample log shrank, following from the start");
        *offset = 0;
    }
    if len == *offset {
        return Ok(());
    }

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::Start(*offset))?;
    let mut line = Vec::new();
    loop {
        line.clear();
        let k = reader.read_until(b'\n', &mut line)?;
        // stop at eof or at a line the writer has not finished
        if k == 0 || line.last() != Some(&b'\n') {
            return Ok(());
        }
        if !is_blank(&line) {
            items.push(parse_line(&line, path, *offset));
        }
        *offset += k as u64;
    }
}
