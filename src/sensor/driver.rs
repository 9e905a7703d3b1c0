//! Weight Sensor Driver
//!
//! Owns the one physical bus. Every transaction (read, tare, calibrate,
//! reinitialize, release) runs while holding the driver mutex, so at most one
//! transaction is ever in flight, including its sampling and settle delays.
//!
//! Failure policy: a bus fault is recovered one level (the converter is
//! reset) and then surfaced. A caller asking for a reading never gets a
//! made-up default.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::sensor::bus::{BusError, WeightBus};
use crate::sensor::calibration::{CalibrationProfile, CalibrationStore, StoreError};
use crate::sensor::filter::{filtered_median, median};
use crate::sensor::retry::{collect_samples, reinit_on_error, Attempt, RetryPolicy};

/// Driver tuning.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Valid samples wanted per weight reading.
    pub sample_target: usize,
    /// Failure budget and pacing for weight readings.
    pub retry: RetryPolicy,
    /// Raw words combined (median) into one sample.
    pub words_per_sample: usize,
    /// Raw words whose median becomes the zero point.
    pub tare_readings: usize,
    /// Samples taken of the known weight.
    pub calibration_samples: usize,
    /// Pause between calibration samples.
    pub calibration_interval: Duration,
    /// Pause between the tare and the known-weight samples.
    pub settle: Duration,
    /// Scaled samples must lie strictly inside `(-limit, limit)`.
    pub sanity_limit: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            sample_target: 5,
            retry: RetryPolicy::default(),
            words_per_sample: 3,
            tare_readings: 15,
            calibration_samples: 10,
            calibration_interval: Duration::from_millis(100),
            settle: Duration::from_secs(1),
            sanity_limit: 10_000.0,
        }
    }
}

impl SensorConfig {
    /// Default constants with every delay removed.
    pub fn without_delays() -> Self {
        Self {
            retry: RetryPolicy::immediate(3),
            calibration_interval: Duration::ZERO,
            settle: Duration::ZERO,
            ..Default::default()
        }
    }
}

/// A filtered weight reading, rounded to one decimal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightReading {
    /// Weight in calibrated units.
    pub value: f64,
    /// Valid samples the reading was derived from.
    pub samples: usize,
}

/// Outcome of one step of the external calibration workflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CalibrationStep {
    /// Step 1: empty platform tared.
    ZeroPointSet,
    /// Step 2: known weight measured, new profile applied and saved.
    Calibrated(CalibrationProfile),
    /// Step 3: weight removed and platform tared again.
    Complete,
}

impl CalibrationStep {
    /// Operator-facing instruction for the next step.
    pub fn message(&self) -> &'static str {
        match self {
            CalibrationStep::ZeroPointSet => "Zero point set. Please place the calibration weight.",
            CalibrationStep::Calibrated(_) => "Scale calibrated. Please remove the weight.",
            CalibrationStep::Complete => "Calibration complete!",
        }
    }
}

/// Driver errors.
#[derive(Debug, Error)]
pub enum SensorError {
    /// Bus communication failed; the converter has been reset.
    #[error("sensor fault: {0}")]
    Fault(#[from] BusError),

    /// Retry budget spent without a single usable sample.
    #[error("unable to get stable reading after {failures} failed attempts")]
    NoReading {
        /// Failed attempts made.
        failures: u32,
        /// Last bus error seen, if any.
        last_error: Option<BusError>,
    },

    /// Calibration could not produce a profile.
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// New profile is live but could not be persisted.
    #[error("calibration applied but not saved: {source}")]
    Storage {
        /// The profile now in effect.
        profile: CalibrationProfile,
        /// Why saving failed.
        #[source]
        source: StoreError,
    },

    /// Unknown step in the calibration workflow.
    #[error("invalid calibration step {0}")]
    InvalidStep(u8),
}

impl SensorError {
    /// Whether this is a hardware fault (as opposed to a rejected request).
    pub fn is_fault(&self) -> bool {
        matches!(self, SensorError::Fault(_) | SensorError::NoReading { .. })
    }
}

/// State guarded by the bus mutex.
struct DriverState {
    bus: Box<dyn WeightBus>,
    profile: CalibrationProfile,
    released: bool,
}

impl DriverState {
    fn ensure_live(&self) -> Result<(), BusError> {
        if self.released {
            Err(BusError::Released)
        } else {
            Ok(())
        }
    }

    /// Reset the converter. The in-memory profile is kept.
    fn reinitialize(&mut self) -> Result<(), BusError> {
        self.ensure_live()?;
        info!("Reinitializing weight sensor");
        self.bus.reset()
    }

    /// Median of `times` raw words.
    fn read_raw_median(&mut self, times: usize) -> Result<f64, BusError> {
        let mut words = Vec::with_capacity(times);
        for _ in 0..times.max(1) {
            words.push(f64::from(self.bus.read_raw()?));
        }
        median(&words).ok_or_else(|| BusError::Glitch("empty word batch".to_string()))
    }

    /// One scaled sample, accepted only inside the sanity range.
    fn sample(&mut self, times: usize, limit: f64) -> Result<Attempt<f64>, BusError> {
        let raw = self.read_raw_median(times)?;
        let value = self.profile.to_weight(raw);
        if value.is_finite() && value > -limit && value < limit {
            Ok(Attempt::Accepted(value))
        } else {
            debug!("Discarding out-of-range sample {:.1}", value);
            Ok(Attempt::Rejected)
        }
    }

    /// Set the zero offset from `times` raw words.
    fn tare(&mut self, times: usize) -> Result<i64, BusError> {
        let raw = self.read_raw_median(times)?;
        self.profile.offset = raw.round() as i64;
        Ok(self.profile.offset)
    }
}

/// Scale `reference_unit` so the median of `readings` becomes
/// `known_weight`. Returns the median and the new unit.
fn derive_reference_unit(reference_unit: f64, known_weight: f64, readings: &[f64]) -> Result<(f64, f64), SensorError> {
    let median_reading = match median(readings) {
        Some(m) if m != 0.0 => m,
        Some(_) => return Err(SensorError::Calibration("median reading is zero".to_string())),
        None => {
            return Err(SensorError::Calibration(
                "unable to get stable calibration readings".to_string(),
            ))
        }
    };

    let derived = reference_unit * known_weight / median_reading;
    if !derived.is_finite() || derived == 0.0 {
        return Err(SensorError::Calibration(format!(
            "derived reference unit {derived} is unusable"
        )));
    }
    Ok((median_reading, derived))
}

/// The weight sensor.
pub struct SensorDriver {
    state: Mutex<DriverState>,
    store: CalibrationStore,
    config: SensorConfig,
}

impl SensorDriver {
    /// Take ownership of `bus`, apply the persisted profile and reset the
    /// converter.
    pub fn new(
        bus: impl WeightBus + 'static,
        store: CalibrationStore,
        config: SensorConfig,
    ) -> Result<Self, SensorError> {
        let profile = store.load();
        let mut state = DriverState {
            bus: Box::new(bus),
            profile,
            released: false,
        };
        state.bus.reset()?;

        info!(
            "Weight sensor ready (reference unit {}, offset {})",
            profile.reference_unit, profile.offset
        );

        Ok(Self {
            state: Mutex::new(state),
            store,
            config,
        })
    }

    /// Driver tuning in effect.
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Profile currently applied to the bus.
    pub async fn calibration(&self) -> CalibrationProfile {
        self.state.lock().await.profile
    }

    /// Read the weight using the configured sample target.
    pub async fn read_weight(&self) -> Result<WeightReading, SensorError> {
        self.read_weight_with(self.config.sample_target).await
    }

    /// Read the weight from up to `sample_target` valid samples.
    ///
    /// Three or more samples are outlier-filtered before taking the median;
    /// fewer are used as-is. Fails only when no sample could be collected.
    pub async fn read_weight_with(&self, sample_target: usize) -> Result<WeightReading, SensorError> {
        let mut state = self.state.lock().await;
        state.ensure_live()?;

        let words = self.config.words_per_sample;
        let limit = self.config.sanity_limit;
        let collected = collect_samples(
            &mut *state,
            sample_target.max(1),
            &self.config.retry,
            |s: &mut DriverState| s.sample(words, limit),
            DriverState::reinitialize,
        ).await;

        match filtered_median(&collected.samples) {
            Some(value) => {
                debug!("Weight {:.1} from {} samples", value, collected.samples.len());
                Ok(WeightReading {
                    value,
                    samples: collected.samples.len(),
                })
            }
            None => Err(SensorError::NoReading {
                failures: collected.failures,
                last_error: collected.last_error,
            }),
        }
    }

    /// Reset the zero point from the current (empty) platform.
    pub async fn tare(&self) -> Result<(), SensorError> {
        let mut state = self.state.lock().await;
        state.ensure_live()?;
        self.tare_locked(&mut state)
    }

    fn tare_locked(&self, state: &mut DriverState) -> Result<(), SensorError> {
        let result = state.tare(self.config.tare_readings);
        let offset = reinit_on_error(state, result, DriverState::reinitialize)?;
        info!("Tare complete, offset {}", offset);
        Ok(())
    }

    /// Derive a new reference unit from a known weight.
    ///
    /// Tares, waits for the platform to settle, samples the load and scales
    /// the reference unit by `known_weight / median`. The new profile is
    /// applied before it is saved, so a [`SensorError::Storage`] still
    /// leaves the scale calibrated for this run.
    pub async fn calibrate(&self, known_weight: f64) -> Result<CalibrationProfile, SensorError> {
        if !known_weight.is_finite() || known_weight == 0.0 {
            return Err(SensorError::Calibration(format!(
                "known weight must be finite and nonzero, got {known_weight}"
            )));
        }

        let mut state = self.state.lock().await;
        state.ensure_live()?;

        self.tare_locked(&mut state)?;
        if !self.config.settle.is_zero() {
            tokio::time::sleep(self.config.settle).await;
        }

        let batch = self.sample_known_weight(&mut state).await;
        let readings = reinit_on_error(&mut *state, batch, DriverState::reinitialize)?;

        let derived = derive_reference_unit(state.profile.reference_unit, known_weight, &readings);
        let (median_reading, reference_unit) = reinit_on_error(&mut *state, derived, |s: &mut DriverState| {
            s.reinitialize().map_err(SensorError::from)
        })?;

        let previous = state.profile.reference_unit;
        state.profile.reference_unit = reference_unit;
        let profile = state.profile;
        info!(
            "Calibrated: reference unit {} -> {} (median {:.2}, known {})",
            previous, reference_unit, median_reading, known_weight
        );

        self.persist(profile)?;
        Ok(profile)
    }

    async fn sample_known_weight(&self, state: &mut DriverState) -> Result<Vec<f64>, BusError> {
        let mut readings = Vec::with_capacity(self.config.calibration_samples);
        for _ in 0..self.config.calibration_samples {
            if let Attempt::Accepted(v) = state.sample(self.config.words_per_sample, self.config.sanity_limit)? {
                readings.push(v);
            }
            if !self.config.calibration_interval.is_zero() {
                tokio::time::sleep(self.config.calibration_interval).await;
            }
        }
        Ok(readings)
    }

    fn persist(&self, profile: CalibrationProfile) -> Result<(), SensorError> {
        self.store.save(&profile).map_err(|source| {
            warn!("Failed to save calibration: {}", source);
            SensorError::Storage { profile, source }
        })
    }

    /// Run one step of the three-step operator workflow.
    pub async fn calibration_step(&self, step: u8, known_weight: f64) -> Result<CalibrationStep, SensorError> {
        match step {
            1 => self.tare().await.map(|_| CalibrationStep::ZeroPointSet),
            2 => self.calibrate(known_weight).await.map(CalibrationStep::Calibrated),
            3 => self.tare().await.map(|_| CalibrationStep::Complete),
            other => Err(SensorError::InvalidStep(other)),
        }
    }

    /// Restore and persist the hardware default profile.
    pub async fn reset_calibration(&self) -> Result<CalibrationProfile, SensorError> {
        let mut state = self.state.lock().await;
        state.ensure_live()?;

        state.profile = CalibrationProfile::HARDWARE_DEFAULT;
        state.reinitialize()?;
        info!("Calibration reset to hardware default");

        let profile = state.profile;
        self.persist(profile)?;
        Ok(profile)
    }

    /// Release bus resources. Idempotent and never panics; a release
    /// failure is handed to `sink`.
    pub async fn cleanup<F>(&self, sink: F)
    where
        F: FnOnce(&BusError),
    {
        let mut state = self.state.lock().await;
        if state.released {
            return;
        }
        state.released = true;
        if let Err(e) = state.bus.release() {
            sink(&e);
        }
    }

    /// [`cleanup`](Self::cleanup) with failures sent to the log.
    pub async fn cleanup_logged(&self) {
        self.cleanup(|e| warn!("Weight sensor cleanup failed: {}", e)).await;
    }
}
