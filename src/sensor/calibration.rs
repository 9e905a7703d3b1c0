//! Calibration Profile Persistence
//!
//! A profile is two numbers: the reference unit (raw counts per weight unit)
//! and the raw offset at zero load. It is stored as a single JSON record:
//!
//! ```json
//! { "reference_unit": 420.5, "offset": 8388 }
//! ```
//!
//! A missing or unreadable record is not an error; the hardware default is
//! substituted so the scale always comes up.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Scale factor and zero offset for converting raw counts to weight.
///
/// `weight = (raw - offset) / reference_unit`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationProfile {
    /// Raw counts per weight unit. Never zero.
    pub reference_unit: f64,
    /// Raw counts at zero load.
    pub offset: i64,
}

impl CalibrationProfile {
    /// Uncalibrated converter: one count per unit, no offset.
    pub const HARDWARE_DEFAULT: Self = Self {
        reference_unit: 1.0,
        offset: 0,
    };

    /// Create a profile.
    pub const fn new(reference_unit: f64, offset: i64) -> Self {
        Self { reference_unit, offset }
    }

    /// A usable profile has a finite, nonzero reference unit.
    pub fn is_valid(&self) -> bool {
        self.reference_unit.is_finite() && self.reference_unit != 0.0
    }

    /// Convert a raw count to weight units.
    #[inline]
    pub fn to_weight(&self, raw: f64) -> f64 {
        (raw - self.offset as f64) / self.reference_unit
    }
}

impl Default for CalibrationProfile {
    fn default() -> Self {
        Self::HARDWARE_DEFAULT
    }
}

/// Calibration persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("calibration file {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// The profile could not be encoded.
    #[error("calibration encode: {0}")]
    Encode(#[from] serde_json::Error),

    /// Refused to persist a profile that would divide by zero.
    #[error("refusing to store invalid reference unit {0}")]
    InvalidProfile(f64),
}

/// File-backed calibration store.
#[derive(Debug, Clone)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    /// Conventional file name, relative to the working directory.
    pub const DEFAULT_FILE: &'static str = "calibration.json";

    /// Store backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted profile, or the hardware default.
    pub fn load(&self) -> CalibrationProfile {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No calibration at {}, using hardware default", self.path.display());
                return CalibrationProfile::HARDWARE_DEFAULT;
            }
            Err(e) => {
                warn!("Failed to read calibration {}: {}", self.path.display(), e);
                return CalibrationProfile::HARDWARE_DEFAULT;
            }
        };

        match serde_json::from_str::<CalibrationProfile>(&text) {
            Ok(profile) if profile.is_valid() => profile,
            Ok(profile) => {
                warn!("Ignoring calibration with reference unit {}", profile.reference_unit);
                CalibrationProfile::HARDWARE_DEFAULT
            }
            Err(e) => {
                warn!("Malformed calibration {}: {}", self.path.display(), e);
                CalibrationProfile::HARDWARE_DEFAULT
            }
        }
    }

    /// Persist a profile. Writes a sibling temp file and renames it over the
    /// old record so a crash never leaves a truncated file behind.
    pub fn save(&self, profile: &CalibrationProfile) -> Result<(), StoreError> {
        if !profile.is_valid() {
            return Err(StoreError::InvalidProfile(profile.reference_unit));
        }

        let json = serde_json::to_string_pretty(profile)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;

        debug!("Saved calibration to {}", self.path.display());
        Ok(())
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FILE)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Fresh, empty directory under the system temp dir.
    pub(crate) fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dice-scale-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_save_then_load() {
        let store = CalibrationStore::new(scratch_dir().join("calibration.json"));
        let profile = CalibrationProfile::new(2000.0, -8_192);

        store.save(&profile).unwrap();
        assert_eq!(store.load(), profile);
    }

    #[test]
    fn test_missing_file_uses_default() {
        let store = CalibrationStore::new(scratch_dir().join("absent.json"));
        assert_eq!(store.load(), CalibrationProfile::HARDWARE_DEFAULT);
    }

    #[test]
    fn test_malformed_file_uses_default() {
        let path = scratch_dir().join("calibration.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(CalibrationStore::new(&path).load(), CalibrationProfile::HARDWARE_DEFAULT);

        fs::write(&path, r#"{"reference_unit": 0.0, "offset": 5}"#).unwrap();
        assert_eq!(CalibrationStore::new(&path).load(), CalibrationProfile::HARDWARE_DEFAULT);
    }

    #[test]
    fn test_reads_hand_written_record() {
        let path = scratch_dir().join("calibration.json");
        fs::write(&path, r#"{"reference_unit": 419.7, "offset": 8400}"#).unwrap();

        let profile = CalibrationStore::new(&path).load();
        assert_eq!(profile, CalibrationProfile::new(419.7, 8400));
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let store = CalibrationStore::new(scratch_dir().join("nope").join("calibration.json"));
        let err = store.save(&CalibrationProfile::new(3.0, 0)).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_invalid_profile_not_saved() {
        let store = CalibrationStore::new(scratch_dir().join("calibration.json"));
        let err = store.save(&CalibrationProfile::new(0.0, 0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidProfile(_)));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_to_weight() {
        let profile = CalibrationProfile::new(10.0, 100);
        assert_eq!(profile.to_weight(350.0), 25.0);
        assert_eq!(profile.to_weight(100.0), 0.0);
    }
}
