//! ==============================================================================
//! store.rs - append-only sample log
//! ==============================================================================
//!
//! purpose:
//!     durable history of every reading, one json object per line.
//!
//! write discipline:
//!     - only the lock holder writes (see lock.rs), so there is one writer
//!     - the file is opened O_APPEND and each entry goes out as one buffer,
//!       followed by fdatasync before append() returns
//!     - if a write fails half way, the file is cut back to its previous
//!       length so earlier entries stay intact
//!     - on open, a torn final line left by a crash is truncated away
//!
//! reading:
//!     tail(n) walks backwards from the end in fixed blocks to find where
//!     the last n lines start, then streams them forward lazily. a line
//!     without its newline is never yielded.
//!
//! relationships:
//!     - written by: sampler.rs
//!     - read by: supervisor.rs (tail), follow.rs (live view)
//!
//! ==============================================================================

use crate::domain::{LogEntry, SensorReading};
use crate::error::StoreError;

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const BLOCK: u64 = 8 * 1024;

/// how many trailing entries to look at first when recovering the next seq
const RECOVERY_WINDOW: usize = 16;

/// what the store needs from the file it appends to
pub trait LogFile: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate(&self, len: u64) -> io::Result<()>;
    fn sync(&self) -> io::Result<()>;
}

impl LogFile for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

pub struct SampleStore<F = File> {
    path: PathBuf,
    file: F,
    next_seq: u64,
}

impl SampleStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let open_err = |source| StoreError::Open {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(open_err)?;

        repair_torn_tail(&mut file, &path)?;

        let next_seq = recover_next_seq(&path)?;

        tracing::debug!(path = %path.display(), next_seq, "sample log open");
        Ok(Self {
            path,
            file,
            next_seq,
        })
    }
}

impl<F: LogFile> SampleStore<F> {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, reading: &SensorReading) -> Result<LogEntry, StoreError> {
        let entry = LogEntry {
            seq: self.next_seq,
            reading: reading.clone(),
        };
        let mut line = serde_json::to_vec(&entry).map_err(|e| self.write_err(e.into()))?;
        line.push(b'\n');

        let before = self.file.len().map_err(|e| self.write_err(e))?;
        let written = self.file.write_all(&line).and_then(|_| self.file.sync());
        if let Err(source) = written {
            if let Err(e) = self.file.truncate(before) {
                tracing::error!(path = %self.path.display(), "could not roll back partial entry: {e}");
            }
            return Err(self.write_err(source));
        }

        self.next_seq += 1;
        Ok(entry)
    }

    fn write_err(&self, source: io::Error) -> StoreError {
        StoreError::Write {
            path: self.path.clone(),
            source,
        }
    }

    #[cfg(test)]
    pub fn swap_file<G>(self, swap: impl FnOnce(F) -> G) -> SampleStore<G> {
        SampleStore {
            path: self.path,
            file: swap(self.file),
            next_seq: self.next_seq,
        }
    }
}

/// one past the highest seq near the end of the log
///
/// unreadable lines are skipped and the search widens until an entry
/// parses; a non-empty log with no readable entry at all is corrupt.
fn recover_next_seq(path: &Path) -> Result<u64, StoreError> {
    let mut window = RECOVERY_WINDOW;
    loop {
        let mut entries = tail(path, window)?;
        let start = entries.offset();
        let mut best: Option<u64> = None;
        let mut lines = 0;
        let mut unreadable = 0;
        for entry in entries.by_ref() {
            lines += 1;
            match entry {
                Ok(entry) => best = Some(best.map_or(entry.seq, |b| b.max(entry.seq))),
                Err(StoreError::Corrupt { .. }) => unreadable += 1,
                Err(e) => return Err(e),
            }
        }
        if unreadable > 0 {
            tracing::warn!(path = %path.display(), unreadable, "skipping unreadable entries during recovery");
        }
        if let Some(seq) = best {
            return Ok(seq + 1);
        }
        if start == 0 {
            if lines == 0 {
                return Ok(0);
            }
            return Err(StoreError::Corrupt {
                path: path.to_path_buf(),
                offset: 0,
                detail: format!("none of the {lines} entries is readable, cannot continue seq"),
            });
        }
        window = window.saturating_mul(4);
    }
}

/// the last `n` complete entries of the log at `path`, oldest first
///
/// a log that does not exist yet has no entries.
pub fn tail(path: &Path, n: usize) -> Result<Tail, StoreError> {
    let read_err = |source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Tail::empty(path)),
        Err(e) => return Err(read_err(e)),
    };
    let len = file.metadata().map_err(read_err)?.len();
    let end = complete_end(&mut file, len).map_err(read_err)?;
    let start = start_of_last_lines(&mut file, end, n).map_err(read_err)?;
    file.seek(SeekFrom::Start(start)).map_err(read_err)?;

    Ok(Tail {
        path: path.to_path_buf(),
        reader: Some(BufReader::new(file).take(end - start)),
        offset: start,
        remaining: n,
        line: Vec::new(),
    })
}

/// lazy iterator returned by [`tail`]
pub struct Tail {
    path: PathBuf,
    reader: Option<io::Take<BufReader<File>>>,
    offset: u64,
    remaining: usize,
    line: Vec<u8>,
}

impl Tail {
    fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
            offset: 0,
            remaining: 0,
            line: Vec::new(),
        }
    }

    /// byte offset just past the last line handed out
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Iterator for Tail {
    type Item = Result<LogEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let reader = self.reader.as_mut()?;
        while self.remaining > 0 {
            self.line.clear();
            match reader.read_until(b'\n', &mut self.line) {
                Ok(0) => return None,
                Ok(k) => {
                    let at = self.offset;
                    self.offset += k as u64;
                    if is_blank(&self.line) {
                        continue;
                    }
                    self.remaining -= 1;
                    return Some(parse_line(&self.line, &self.path, at));
                }
                Err(source) => {
                    self.remaining = 0;
                    return Some(Err(StoreError::Read {
                        path: self.path.clone(),
                        source,
                    }));
                }
            }
        }
        None
    }
}

/// one raw line; bytes that are not utf-8 json come back as `Corrupt`
pub fn parse_line(line: &[u8], path: &Path, offset: u64) -> Result<LogEntry, StoreError> {
    serde_json::from_slice(line).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        offset,
        detail: e.to_string(),
    })
}

pub fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

fn repair_torn_tail(file: &mut File, path: &Path) -> Result<(), StoreError> {
    let open_err = |source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    };
    let len = file.metadata().map_err(open_err)?.len();
    let end = complete_end(file, len).map_err(open_err)?;
    if end < len {
        tracing::warn!(
            path = %path.display(),
            dropped_bytes = len - end,
            "truncating torn entry left by an interrupted write"
        );
        file.set_len(end).map_err(open_err)?;
    }
    Ok(())
}

/// offset just past the last newline in the first `len` bytes
fn complete_end(file: &mut File, len: u64) -> io::Result<u64> {
    let mut buf = vec![0u8; BLOCK as usize];
    let mut pos = len;
    while pos > 0 {
        let start = pos.saturating_sub(BLOCK);
        let chunk = &mut buf[..(pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(i) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + i as u64 + 1);
        }
        pos = start;
    }
    Ok(0)
}

/// where the last `n` lines before `end` begin; `end` sits just past a newline
fn start_of_last_lines(file: &mut File, end: u64, n: usize) -> io::Result<u64> {
    if n == 0 || end == 0 {
        return Ok(end);
    }
    let mut buf = vec![0u8; BLOCK as usize];
    // skip the newline that terminates the final line
    let mut pos = end - 1;
    let mut seen = 0;
    while pos > 0 {
        let start = pos.saturating_sub(BLOCK);
        let chunk = &mut buf[..(pos - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        for (i, &b) in chunk.iter().enumerate().rev() {
            if b == b'\n' {
                seen += 1;
                if seen == n {
                    return Ok(start + i as u64 + 1);
                }
            }
        }
        pos = start;
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReadingStatus;
    use crate::testutil::scratch_dir;
    use chrono::Utc;

    fn reading(i: usize) -> SensorReading {
        SensorReading::ok("28-0000000000aa", Utc::now(), i as f64)
    }

    fn temps(entries: impl Iterator<Item = Result<LogEntry, StoreError>>) -> Vec<f64> {
        entries
            .map(|e| e.unwrap().reading.temperature_celsius().unwrap())
            .collect()
    }

    #[test]
    fn test_tail_fewer_than_requested() {
        let dir = scratch_dir("store_few");
        let mut store = SampleStore::open(dir.join("log.jsonl")).unwrap();
        for i in 0..3 {
            store.append(&reading(i)).unwrap();
        }
        assert_eq!(temps(tail(store.path(), 10).unwrap()), vec![0.0, 1.0, 2.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_tail_last_n_across_blocks() {
        let dir = scratch_dir("store_many");
        let mut store = SampleStore::open(dir.join("log.jsonl")).unwrap();
        for i in 0..600 {
            store.append(&reading(i)).unwrap();
        }
        assert!(std::fs::metadata(store.path()).unwrap().len() > 4 * BLOCK);

        let last: Vec<f64> = temps(tail(store.path(), 250).unwrap());
        let expected: Vec<f64> = (350..600).map(|i| i as f64).collect();
        assert_eq!(last, expected);

        assert_eq!(temps(tail(store.path(), 1).unwrap()), vec![599.0]);
        assert_eq!(tail(store.path(), 0).unwrap().count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_seq_is_monotonic_across_reopen() {
        let dir = scratch_dir("store_seq");
        let path = dir.join("log.jsonl");
        {
            let mut store = SampleStore::open(&path).unwrap();
            assert_eq!(store.append(&reading(0)).unwrap().seq, 0);
            assert_eq!(store.append(&reading(1)).unwrap().seq, 1);
        }
        let mut store = SampleStore::open(&path).unwrap();
        assert_eq!(store.append(&reading(2)).unwrap().seq, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_torn_tail_is_repaired_on_open() {
        let dir = scratch_dir("store_torn");
        let path = dir.join("log.jsonl");
        {
            let mut store = SampleStore::open(&path).unwrap();
            store.append(&reading(0)).unwrap();
            store.append(&reading(1)).unwrap();
        }
        // simulate a crash mid-write
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"seq":2,"sensor_id":"28-00"#).unwrap();
        drop(f);

        // readers never see the torn line
        assert_eq!(temps(tail(&path, 10).unwrap()), vec![0.0, 1.0]);

        let mut store = SampleStore::open(&path).unwrap();
        let entry = store.append(&reading(9)).unwrap();
        assert_eq!(entry.seq, 2);
        assert_eq!(temps(tail(&path, 10).unwrap()), vec![0.0, 1.0, 9.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_tail_of_missing_log_is_empty() {
        let dir = scratch_dir("store_missing");
        assert_eq!(tail(&dir.join("nope.jsonl"), 5).unwrap().count(), 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_line_is_reported_not_skipped() {
        let dir = scratch_dir("store_corrupt");
        let path = dir.join("log.jsonl");
        std::fs::write(&path, "not json\n").unwrap();
        let mut entries = tail(&path, 5).unwrap();
        assert!(matches!(entries.next(), Some(Err(StoreError::Corrupt { offset: 0, .. }))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fault_readings_are_stored() {
        let dir = scratch_dir("store_fault");
        let mut store = SampleStore::open(dir.join("log.jsonl")).unwrap();
        store
            .append(&SensorReading::fault("28-0000000000aa", Utc::now(), "crc check failed"))
            .unwrap();
        let entry = tail(store.path(), 1).unwrap().next().unwrap().unwrap();
        assert_eq!(entry.reading.status(), ReadingStatus::Fault);
        assert_eq!(entry.reading.detail(), Some("crc check failed"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_non_utf8_line_does_not_hide_later_entries() {
        let dir = scratch_dir("store_bytes");
        let path = dir.join("log.jsonl");
        {
            let mut store = SampleStore::open(&path).unwrap();
            store.append(&reading(1)).unwrap();
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"\xff\xfe garbage\n").unwrap();
        drop(f);
        let mut store = SampleStore::open(&path).unwrap();
        store.append(&reading(2)).unwrap();

        let entries: Vec<_> = tail(&path, 10).unwrap().collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].as_ref().unwrap().reading.temperature_celsius(), Some(1.0));
        assert!(matches!(entries[1], Err(StoreError::Corrupt { .. })));
        let last = entries[2].as_ref().unwrap();
        assert_eq!(last.reading.temperature_celsius(), Some(2.0));
        assert_eq!(last.seq, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// passes `budget` bytes through, then fails every write
    struct ShortWrites {
        inner: File,
        budget: usize,
    }

    impl Write for ShortWrites {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl LogFile for ShortWrites {
        fn len(&self) -> io::Result<u64> {
            self.inner.len()
        }

        fn truncate(&self, len: u64) -> io::Result<()> {
            self.inner.truncate(len)
        }

        fn sync(&self) -> io::Result<()> {
            self.inner.sync()
        }
    }

    #[test]
    fn test_failed_write_rolls_back_to_previous_length() {
        let dir = scratch_dir("store_rollback");
        let path = dir.join("log.jsonl");
        let mut store = SampleStore::open(&path).unwrap();
        store.append(&reading(0)).unwrap();
        store.append(&reading(1)).unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let mut store = store.swap_file(|inner| ShortWrites { inner, budget: 10 });
        let err = store.append(&reading(2)).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);
        assert_eq!(temps(tail(&path, 10).unwrap()), vec![0.0, 1.0]);

        // the failed entry's seq is handed out again, not skipped
        let mut store = store.swap_file(|short| short.inner);
        assert_eq!(store.append(&reading(3)).unwrap().seq, 2);
        assert_eq!(temps(tail(&path, 10).unwrap()), vec![0.0, 1.0, 3.0]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_seq_recovery_skips_a_long_run_of_bad_lines() {
        let dir = scratch_dir("store_recover");
        let path = dir.join("log.jsonl");
        {
            let mut store = SampleStore::open(&path).unwrap();
            for i in 0..3 {
                store.append(&reading(i)).unwrap();
            }
        }
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        for _ in 0..(RECOVERY_WINDOW * 3) {
            f.write_all(b"not json\n").unwrap();
        }
        drop(f);

        let mut store = SampleStore::open(&path).unwrap();
        assert_eq!(store.append(&reading(9)).unwrap().seq, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_log_without_any_readable_entry_refuses_to_open() {
        let dir = scratch_dir("store_unreadable");
        let path = dir.join("log.jsonl");
        std::fs::write(&path, "not json\nstill not json\n").unwrap();
        assert!(matches!(
            SampleStore::open(&path),
            Err(StoreError::Corrupt { .. })
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_disk_full_is_reported() {
        // /dev/full fails every write with ENOSPC
        let mut store = SampleStore::open("/dev/full").unwrap();
        let err = store.append(&reading(0)).unwrap_err();
        assert!(matches!(err, StoreError::Write { .. }));
        assert!(err.to_string().contains("/dev/full"));
    }
}
