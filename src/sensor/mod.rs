//! Weight Sensor
//!
//! Acquisition and calibration for the load cell.
//! Everything that touches the bus goes through [`SensorDriver`].

pub mod bus;
pub mod calibration;
pub mod driver;
pub mod filter;
#[cfg(target_os = "linux")]
pub mod gpio;
pub mod retry;

pub use bus::{BusError, Gain, Hx711, SimulatedBus, WeightBus};
pub use calibration::{CalibrationProfile, CalibrationStore, StoreError};
pub use driver::{CalibrationStep, SensorConfig, SensorDriver, SensorError, WeightReading};
pub use retry::RetryPolicy;
