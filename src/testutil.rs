//! shared fixtures for unit tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

pub const GOOD_PAYLOAD: &str =
    "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n72 01 4b 46 7f ff 0e 10 57 t=23125\n";

/// fresh, empty directory under the system temp dir
pub fn scratch_dir(tag: &str) -> PathBuf {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let dir = std::env::temp_dir().join(format!(
        "tlog_test_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// lays out `<dir>/<id>/w1_slave` like the kernel does
pub fn fake_sensor(dir: &Path, id: &str, payload: &str) {
    let sensor = dir.join(id);
    std::fs::create_dir_all(&sensor).unwrap();
    std::fs::write(sensor.join("w1_slave"), payload).unwrap();
}
