//! Server Configuration
//!
//! Defaults suit a Raspberry Pi with the load cell on GPIO 5 (data) and
//! GPIO 6 (clock) of the header's gpiochip. Every field can be overridden
//! from the environment:
//!
//! | Variable                      | Default          |
//! |-------------------------------|------------------|
//! | `DICE_SCALE_BIND`             | `0.0.0.0:5000`   |
//! | `DICE_SCALE_MAX_CONNECTIONS`  | `64`             |
//! | `DICE_SCALE_CALIBRATION_FILE` | `calibration.json` |
//! | `DICE_SCALE_SAMPLE_TARGET`    | `5`              |
//! | `DICE_SCALE_SIMULATE`         | `false`          |
//! | `DICE_SCALE_GPIO_CHIP`        | `/dev/gpiochip0` |
//! | `DICE_SCALE_DATA_PIN`         | `5`              |
//! | `DICE_SCALE_CLOCK_PIN`        | `6`              |

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::sensor::{CalibrationStore, SensorConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Where the calibration profile lives.
    pub calibration_file: PathBuf,
    /// Use the software load cell instead of GPIO.
    pub simulate: bool,
    /// GPIO character device holding both lines.
    pub gpio_chip: PathBuf,
    /// Line offset wired to the converter's data output.
    pub data_pin: u32,
    /// Line offset wired to the converter's clock input.
    pub clock_pin: u32,
    /// How often expired sessions are pruned.
    pub prune_interval: Duration,
    /// Sensor driver tuning.
    pub sensor: SensorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_connections: 64,
            calibration_file: PathBuf::from(CalibrationStore::DEFAULT_FILE),
            simulate: false,
            gpio_chip: PathBuf::from("/dev/gpiochip0"),
            data_pin: 5,
            clock_pin: 6,
            prune_interval: Duration::from_secs(60),
            sensor: SensorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DICE_SCALE_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = parsed(&lookup, "DICE_SCALE_BIND") {
            config.bind_addr = addr;
        }
        if let Some(max) = parsed(&lookup, "DICE_SCALE_MAX_CONNECTIONS") {
            config.max_connections = max;
        }
        if let Some(path) = lookup("DICE_SCALE_CALIBRATION_FILE") {
            config.calibration_file = PathBuf::from(path);
        }
        if let Some(target) = parsed::<usize, _>(&lookup, "DICE_SCALE_SAMPLE_TARGET") {
            config.sensor.sample_target = target.max(1);
        }
        if let Some(chip) = lookup("DICE_SCALE_GPIO_CHIP") {
            config.gpio_chip = PathBuf::from(chip);
        }
        if let Some(pin) = parsed(&lookup, "DICE_SCALE_DATA_PIN") {
            config.data_pin = pin;
        }
        if let Some(pin) = parsed(&lookup, "DICE_SCALE_CLOCK_PIN") {
            config.clock_pin = pin;
        }
        config.simulate = lookup("DICE_SCALE_SIMULATE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(config.simulate);

        config
    }

    /// Store for the configured calibration file.
    pub fn calibration_store(&self) -> CalibrationStore {
        CalibrationStore::new(&self.calibration_file)
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}
