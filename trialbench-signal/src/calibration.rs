use crate::error::FactoryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Converts between requested levels in dB and peak scale factors.
pub trait Calibration: fmt::Debug + Send + Sync {
    /// Level in dB produced by a 1 V peak tone at `frequency`.
    fn get_sens(&self, frequency: f64) -> f64;

    fn get_sf(&self, frequency: f64, level: f64) -> f64 {
        10f64.powf((level - self.get_sens(frequency)) / 20.0)
    }

    fn get_spl(&self, frequency: f64, sf: f64) -> f64 {
        self.get_sens(frequency) + 20.0 * sf.log10()
    }
}

/// Same sensitivity at every frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatCalibration {
    pub sensitivity: f64,
}

impl FlatCalibration {
    /// Levels are attenuations: 0 dB is 1 V peak, -20 dB is 0.1 V.
    pub fn as_attenuation() -> Self {
        Self { sensitivity: 0.0 }
    }

    pub fn from_sensitivity(sensitivity: f64) -> Self {
        Self { sensitivity }
    }
}

impl Calibration for FlatCalibration {
    fn get_sens(&self, _frequency: f64) -> f64 {
        self.sensitivity
    }
}

/// Sensitivity measured at a set of frequencies, linearly interpolated and
/// held constant past either end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpCalibration {
    points: Vec<(f64, f64)>,
}

impl InterpCalibration {
    pub fn new(mut points: Vec<(f64, f64)>) -> Result<Self, FactoryError> {
        if points.is_empty() {
            return Err(FactoryError::MissingParameter("calibration points".into()));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(Self { points })
    }
}

impl Calibration for InterpCalibration {
    fn get_sens(&self, frequency: f64) -> f64 {
        let idx = self.points.partition_point(|(f, _)| *f < frequency);
        match (idx.checked_sub(1), self.points.get(idx)) {
            (None, Some(&(_, s))) => s,
            (Some(i), None) => self.points[i].1,
            (Some(i), Some(&(f1, s1))) => {
                let (f0, s0) = self.points[i];
                s0 + (s1 - s0) * (frequency - f0) / (f1 - f0)
            }
            (None, None) => 0.0,
        }
    }
}

/// Serializable description of a calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalibrationSpec {
    Attenuation,
    Flat { sensitivity: f64 },
    Interp { points: Vec<(f64, f64)> },
}

impl Default for CalibrationSpec {
    fn default() -> Self {
        CalibrationSpec::Attenuation
    }
}

impl CalibrationSpec {
    pub fn build(&self) -> Result<Arc<dyn Calibration>, FactoryError> {
        Ok(match self {
            CalibrationSpec::Attenuation => Arc::new(FlatCalibration::as_attenuation()),
            CalibrationSpec::Flat { sensitivity } => {
                Arc::new(FlatCalibration::from_sensitivity(*sensitivity))
            }
            CalibrationSpec::Interp { points } => Arc::new(InterpCalibration::new(points.clone())?),
        })
    }
}
