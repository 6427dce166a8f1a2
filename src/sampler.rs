//! ==============================================================================
//! sampler.rs - the sampling loop
//! ==============================================================================
//!
//! purpose:
//!     the long-running half of the system. reads every sensor once per
//!     tick and appends each reading (faults included, so gaps show up in
//!     the history) to the sample log.
//!
//! lifecycle:
//!
//!     STARTING ──lock──> RUNNING ──shutdown / max ticks──> STOPPING ──> STOPPED
//!                           │
//!                           └──store unwritable after retries──> FAULTED
//!
//!     the lock is taken before RUNNING and the store is only opened while
//!     holding it. shutdown is observed between ticks, so a tick that has
//!     started always finishes writing.
//!
//! timing:
//!     ticks come from tokio's interval, which schedules against the loop's
//!     start instant rather than the end of the previous tick. slow reads
//!     shift a single sample, never the whole series. ticks missed entirely
//!     (e.g. the pi was suspended) are skipped, not replayed in a burst.
//!
//! relationships:
//!     - uses: hal.rs (SensorBus), store.rs, lock.rs
//!     - driven by: main.rs (`tlog run`), which supervisor.rs spawns
//!
//! ==============================================================================

use crate::config::LoggerConfig;
use crate::domain::{LogEntry, SensorDevice, SensorReading};
use crate::error::SamplerError;
use crate::hal::SensorBus;
use crate::lock::ProcessLock;
use crate::store::SampleStore;

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted,
}

#[derive(Clone, Debug)]
pub struct SamplerSettings {
    pub interval: Duration,
    pub store_path: PathBuf,
    pub lock_path: PathBuf,
    pub fault_warn_threshold: u32,
    pub store_retry_limit: u32,
    pub store_retry_backoff: Duration,
    /// stop cleanly after this many ticks
    pub max_ticks: Option<u64>,
    pub show_sensor_data: bool,
    pub console_interval: Duration,
}

impl SamplerSettings {
    pub fn from_config(config: &LoggerConfig) -> Self {
        Self {
            interval: config.interval(),
            store_path: config.storage.store_path.clone(),
            lock_path: config.storage.lock_path.clone(),
            fault_warn_threshold: config.sampling.fault_warn_threshold,
            store_retry_limit: config.sampling.store_retry_limit.max(1),
            store_retry_backoff: Duration::from_millis(config.sampling.store_retry_backoff_ms),
            max_ticks: None,
            show_sensor_data: config.logging.show_sensor_data,
            console_interval: Duration::from_secs(config.logging.console_interval_seconds),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub entries_written: u64,
    pub final_state: LoopState,
}

pub struct Sampler<B: SensorBus> {
    bus: Arc<B>,
    devices: Vec<SensorDevice>,
    settings: SamplerSettings,
    faults: FaultTracker,
    state_tx: watch::Sender<LoopState>,
}

impl<B: SensorBus> Sampler<B> {
    pub fn new(bus: Arc<B>, devices: Vec<SensorDevice>, settings: SamplerSettings) -> Self {
        let (state_tx, _) = watch::channel(LoopState::Starting);
        Self {
            bus,
            devices,
            faults: FaultTracker::new(settings.fault_warn_threshold),
            settings,
            state_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// sample until `shutdown` resolves, `max_ticks` is reached, or the
    /// store becomes unwritable
    pub async fn run<F>(mut self, shutdown: F) -> Result<RunSummary, SamplerError>
    where
        F: Future<Output = ()>,
    {
        self.set_state(LoopState::Starting);

        let lock = match ProcessLock::acquire(&self.settings.lock_path) {
            Ok(lock) => lock,
            Err(e) => {
                self.set_state(LoopState::Stopped);
                return Err(e.into());
            }
        };
        let mut store = match SampleStore::open(&self.settings.store_path) {
            Ok(store) => store,
            Err(e) => {
                self.set_state(LoopState::Faulted);
                return Err(e.into());
            }
        };

        self.set_state(LoopState::Running);
        tracing::info!(
            pid = lock.record().pid,
            devices = self.devices.len(),
            interval = ?self.settings.interval,
            log = %store.path().display(),
            lock = %lock.path().display(),
            "sampling started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut ticks = 0u64;
        let mut written = 0u64;
        let mut last_echo: Option<Instant> = None;

        let outcome: Result<(), SamplerError> = 'ticks: loop {
            if self.settings.max_ticks.is_some_and(|max| ticks >= max) {
                tracing::info!(ticks, "tick limit reached");
                break Ok(());
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            let readings = self.read_all().await;
            for reading in &readings {
                match append_with_retry(
                    &mut store,
                    reading,
                    self.settings.store_retry_limit,
                    self.settings.store_retry_backoff,
                )
                .await
                {
                    Ok(_) => written += 1,
                    Err(e) => break 'ticks Err(e),
                }
            }
            ticks += 1;
            self.echo(&readings, &mut last_echo);
        };

        drop(store);
        let final_state = match outcome {
            Ok(()) => {
                self.set_state(LoopState::Stopping);
                if let Err(e) = lock.release() {
                    tracing::error!("{e}");
                }
                LoopState::Stopped
            }
            Err(e) => {
                tracing::error!(ticks, "sampling loop faulted: {e}");
                self.set_state(LoopState::Faulted);
                if let Err(e) = lock.release() {
                    tracing::error!("{e}");
                }
                return Err(e);
            }
        };
        self.set_state(final_state);
        tracing::info!(ticks, entries = written, "sampling stopped");

        Ok(RunSummary {
            ticks,
            entries_written: written,
            final_state,
        })
    }

    async fn read_all(&mut self) -> Vec<SensorReading> {
        let bus = Arc::clone(&self.bus);
        let devices = self.devices.clone();
        let readings = match tokio::task::spawn_blocking(move || {
            devices.iter().map(|d| bus.read(d)).collect::<Vec<_>>()
        })
        .await
        {
            Ok(readings) => readings,
            // still one entry per device, so the gap is on record
            Err(e) => self
                .devices
                .iter()
                .map(|d| SensorReading::fault(&d.id, Utc::now(), format!("reader task failed: {e}")))
                .collect(),
        };

        for (device, reading) in self.devices.iter_mut().zip(&readings) {
            self.faults.observe(device, reading);
            if reading.is_ok() {
                device.last_known_good = Some(reading.clone());
            }
        }
        readings
    }

    fn echo(&self, readings: &[SensorReading], last_echo: &mut Option<Instant>) {
        if !self.settings.show_sensor_data {
            return;
        }
        let now = Instant::now();
        if last_echo.is_some_and(|at| now.duration_since(at) < self.settings.console_interval) {
            return;
        }
        *last_echo = Some(now);
        let line = readings
            .iter()
            .map(|r| match r.temperature_celsius() {
                Some(t) => format!("{} {:.2}°C", r.sensor_id(), t),
                None => format!("{} FAULT", r.sensor_id()),
            })
            .collect::<Vec<_>>()
            .join(" | ");
        tracing::info!("[SENSOR] {line}");
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "loop state");
        }
    }
}

async fn append_with_retry(
    store: &mut SampleStore,
    reading: &SensorReading,
    attempts: u32,
    backoff: Duration,
) -> Result<LogEntry, SamplerError> {
    let mut attempt = 1;
    loop {
        match store.append(reading) {
            Ok(entry) => return Ok(entry),
            Err(source) if attempt >= attempts => {
                return Err(SamplerError::StoreUnwritable { attempts, source })
            }
            Err(e) => {
                tracing::warn!(attempt, of = attempts, "append failed, retrying: {e}");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FaultEvent {
    Healthy,
    Fault { consecutive: u32 },
    Escalated { consecutive: u32 },
    Recovered { after: u32 },
}

/// consecutive fault counts per sensor
struct FaultTracker {
    threshold: u32,
    consecutive: HashMap<String, u32>,
}

impl FaultTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: HashMap::new(),
        }
    }

    fn observe(&mut self, device: &SensorDevice, reading: &SensorReading) -> FaultEvent {
        let count = self.consecutive.entry(device.id.clone()).or_insert(0);

        if reading.is_ok() {
            let after = std::mem::take(count);
            if after > 0 {
                tracing::info!(sensor = %device.id, after, "sensor recovered");
                return FaultEvent::Recovered { after };
            }
            return FaultEvent::Healthy;
        }

        *count += 1;
        let consecutive = *count;
        let why = reading.detail().unwrap_or("unknown");
        if consecutive == self.threshold {
            let last_good = device
                .last_known_good
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "never".to_string());
            tracing::warn!(
                sensor = %device.id,
                consecutive,
                "sensor keeps failing ({why}); last good reading: {last_good}"
            );
            FaultEvent::Escalated { consecutive }
        } else {
            if consecutive < self.threshold {
                tracing::info!(sensor = %device.id, consecutive, "read fault: {why}");
            } else {
                tracing::debug!(sensor = %device.id, consecutive, "read fault: {why}");
            }
            FaultEvent::Fault { consecutive }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReadingStatus;
    use crate::error::LockError;
    use crate::hal::testing::{ScriptedBus, Step};
    use crate::store;
    use crate::testutil::scratch_dir;
    use std::path::Path;

    fn settings(dir: &Path, interval_ms: u64, max_ticks: u64) -> SamplerSettings {
        SamplerSettings {
            interval: Duration::from_millis(interval_ms),
            store_path: dir.join("log.jsonl"),
            lock_path: dir.join("tlog.pid"),
            fault_warn_threshold: 3,
            store_retry_limit: 2,
            store_retry_backoff: Duration::from_millis(5),
            max_ticks: Some(max_ticks),
            show_sensor_data: true,
            console_interval: Duration::from_secs(10),
        }
    }

    fn stored(dir: &Path) -> Vec<LogEntry> {
        store::tail(&dir.join("log.jsonl"), 1000)
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_five_ticks_are_evenly_spaced() {
        let dir = scratch_dir("sampler_spacing");
        let bus = Arc::new(ScriptedBus::new(&["28-0000000000aa"]).latency(Duration::from_millis(80)));
        let sampler = Sampler::new(bus.clone(), bus.devices(), settings(&dir, 200, 5));

        let summary = sampler.run(std::future::pending()).await.unwrap();
        assert_eq!(summary.ticks, 5);
        assert_eq!(summary.entries_written, 5);
        assert_eq!(summary.final_state, LoopState::Stopped);

        let entries = stored(&dir);
        assert_eq!(entries.len(), 5);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

        let stamps: Vec<_> = entries.iter().map(|e| e.reading.timestamp()).collect();
        for pair in stamps.windows(2) {
            let gap = (pair[1] - pair[0]).num_milliseconds();
            assert!((100..300).contains(&gap), "gap {gap}ms");
        }
        // read latency must not accumulate: 4 intervals, not 4 * (interval + latency)
        let span = (stamps[4] - stamps[0]).num_milliseconds();
        assert!((700..1000).contains(&span), "span {span}ms");
        assert!(!dir.join("tlog.pid").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_fault_on_third_tick_is_recorded_and_loop_continues() {
        let dir = scratch_dir("sampler_fault");
        let bus = Arc::new(ScriptedBus::new(&["28-0000000000aa"]).script(
            "28-0000000000aa",
            vec![
                Step::Ok(20.0),
                Step::Ok(20.5),
                Step::Fault("malformed payload: no t= field"),
                Step::Ok(21.0),
                Step::Ok(21.5),
            ],
        ));
        let sampler = Sampler::new(bus.clone(), bus.devices(), settings(&dir, 10, 5));
        sampler.run(std::future::pending()).await.unwrap();

        let statuses: Vec<ReadingStatus> = stored(&dir).iter().map(|e| e.reading.status()).collect();
        assert_eq!(
            statuses,
            vec![
                ReadingStatus::Ok,
                ReadingStatus::Ok,
                ReadingStatus::Fault,
                ReadingStatus::Ok,
                ReadingStatus::Ok
            ]
        );
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_every_tick_writes_one_entry_per_device() {
        let dir = scratch_dir("sampler_count");
        let ids = ["28-0000000000aa", "28-0000000000bb", "28-0000000000cc"];
        let bus = Arc::new(
            ScriptedBus::new(&ids)
                .script(ids[1], vec![Step::Fault("crc check failed"); 4]),
        );
        let sampler = Sampler::new(bus.clone(), bus.devices(), settings(&dir, 10, 4));
        let summary = sampler.run(std::future::pending()).await.unwrap();
        assert_eq!(summary.entries_written, 12);

        let entries = stored(&dir);
        assert_eq!(entries.len(), 12);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.reading.sensor_id(), ids[i % 3]);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_refuses_to_run_while_lock_is_held() {
        let dir = scratch_dir("sampler_locked");
        let _held = ProcessLock::acquire(dir.join("tlog.pid")).unwrap();
        let bus = Arc::new(ScriptedBus::new(&["28-0000000000aa"]));
        let sampler = Sampler::new(bus.clone(), bus.devices(), settings(&dir, 10, 3));
        let state = sampler.subscribe();

        let err = sampler.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SamplerError::Lock(LockError::AlreadyRunning { .. })));
        assert_eq!(*state.borrow(), LoopState::Stopped);
        assert!(bus.reads().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_shutdown_finishes_tick_and_releases_lock() {
        let dir = scratch_dir("sampler_shutdown");
        let ids = ["28-0000000000aa", "28-0000000000bb"];
        let bus = Arc::new(ScriptedBus::new(&ids));
        let mut s = settings(&dir, 20, 0);
        s.max_ticks = None;
        let sampler = Sampler::new(bus.clone(), bus.devices(), s);
        let mut state = sampler.subscribe();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(sampler.run(async {
            let _ = stop_rx.await;
        }));

        state.wait_for(|s| *s == LoopState::Running).await.unwrap();
        assert!(dir.join("tlog.pid").exists());
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop_tx.send(()).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert!(summary.ticks >= 2);
        assert_eq!(summary.entries_written, summary.ticks * 2);
        assert_eq!(stored(&dir).len() as u64, summary.entries_written);
        assert_eq!(*state.borrow(), LoopState::Stopped);
        assert!(!dir.join("tlog.pid").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_stale_lock_does_not_block_start() {
        let dir = scratch_dir("sampler_stale");
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead = child.id();
        child.wait().unwrap();
        std::fs::write(
            dir.join("tlog.pid"),
            format!(r#"{{"pid":{dead},"started_at":"2025-01-01T00:00:00Z"}}"#),
        )
        .unwrap();

        let bus = Arc::new(ScriptedBus::new(&["28-0000000000aa"]));
        let sampler = Sampler::new(bus.clone(), bus.devices(), settings(&dir, 10, 2));
        let summary = sampler.run(std::future::pending()).await.unwrap();
        assert_eq!(summary.entries_written, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unwritable_store_faults_the_loop() {
        let dir = scratch_dir("sampler_full");
        let mut s = settings(&dir, 10, 3);
        s.store_path = PathBuf::from("/dev/full");
        let bus = Arc::new(ScriptedBus::new(&["28-0000000000aa"]));
        let sampler = Sampler::new(bus.clone(), bus.devices(), s);
        let state = sampler.subscribe();

        let err = sampler.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SamplerError::StoreUnwritable { attempts: 2, .. }));
        assert_eq!(*state.borrow(), LoopState::Faulted);
        assert!(!dir.join("tlog.pid").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fault_tracker_escalates_once_and_recovers() {
        let mut tracker = FaultTracker::new(2);
        let device = SensorDevice::new("28-0000000000aa", "/fake");
        let bad = SensorReading::fault("28-0000000000aa", Utc::now(), "crc check failed");
        let good = SensorReading::ok("28-0000000000aa", Utc::now(), 19.0);

        assert_eq!(tracker.observe(&device, &good), FaultEvent::Healthy);
        assert_eq!(tracker.observe(&device, &bad), FaultEvent::Fault { consecutive: 1 });
        assert_eq!(tracker.observe(&device, &bad), FaultEvent::Escalated { consecutive: 2 });
        assert_eq!(tracker.observe(&device, &bad), FaultEvent::Fault { consecutive: 3 });
        assert_eq!(tracker.observe(&device, &good), FaultEvent::Recovered { after: 3 });
        assert_eq!(tracker.observe(&device, &bad), FaultEvent::Fault { consecutive: 1 });
    }
}
