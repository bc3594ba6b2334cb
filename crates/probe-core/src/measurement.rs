//! Accepted measurement points.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// LCR read-back attached to a CV measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvReading {
    /// Farads.
    pub capacitance: f64,
    /// Ohms.
    pub resistance: f64,
    /// Test frequency in hertz.
    pub frequency: f64,
}

/// One accepted measurement. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    timestamp: DateTime<Local>,
    voltage: f64,
    current: f64,
    cv: Option<CvReading>,
}

impl Measurement {
    /// Current-only reading.
    pub fn iv(timestamp: DateTime<Local>, voltage: f64, current: f64) -> Self {
        Self {
            timestamp,
            voltage,
            current,
            cv: None,
        }
    }

    /// Reading with an LCR result.
    pub fn cv(timestamp: DateTime<Local>, voltage: f64, current: f64, reading: CvReading) -> Self {
        Self {
            timestamp,
            voltage,
            current,
            cv: Some(reading),
        }
    }

    /// Local time of the reading.
    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// Read-back voltage in volts.
    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    /// Measured current in amps.
    pub fn current(&self) -> f64 {
        self.current
    }

    /// LCR result of a CV reading.
    pub fn cv_reading(&self) -> Option<&CvReading> {
        self.cv.as_ref()
    }
}
