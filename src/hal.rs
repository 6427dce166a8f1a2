//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     the seam between the sampling loop and whatever produces readings.
//!     on the pi that is the kernel's one-wire sysfs tree (w1.rs); in tests
//!     it is a scripted bus that replays canned results.
//!
//! relationships:
//!     - implemented by: w1.rs (W1Bus)
//!     - used by: sampler.rs, main.rs (`tlog devices`)
//!
//! ==============================================================================

use crate::domain::{SensorDevice, SensorReading};
use crate::error::SamplerError;

pub trait SensorBus: Send + Sync + 'static {
    /// enumerate the temperature sensors currently wired to the bus
    fn discover(&self) -> Result<Vec<SensorDevice>, SamplerError>;

    /// take one reading; faults come back as FAULT readings, never as errors
    fn read(&self, device: &SensorDevice) -> SensorReading;
}
