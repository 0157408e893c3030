pub mod producer;
pub mod sim;

pub use producer::{AcquireOutcome, ProducerStats, RejectReason, SensorProducer};
pub use sim::{SimulatedSensors, SimulationConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Full-scale reading of the 12-bit ambient light ADC.
pub const LIGHT_ADC_MAX: u16 = 4095;

/// One acquisition cycle worth of readings. Quantities that could not be
/// read are NaN; the sample is only usable when temperature and humidity
/// are both numeric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SensorSample {
    pub temperature: f32,
    pub humidity: f32,
    pub brightness: f32,
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub energy: f32,
}

impl SensorSample {
    pub fn unavailable() -> Self {
        Self {
            temperature: f32::NAN,
            humidity: f32::NAN,
            brightness: f32::NAN,
            voltage: f32::NAN,
            current: f32::NAN,
            power: f32::NAN,
            energy: f32::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.temperature.is_nan() && !self.humidity.is_nan()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature: f32,
    pub humidity: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct PowerMetrics {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub energy: f32,
}

impl PowerMetrics {
    pub fn unavailable() -> Self {
        Self {
            voltage: f32::NAN,
            current: f32::NAN,
            power: f32::NAN,
            energy: f32::NAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("climate sensor did not respond")]
    Timeout,
    #[error("climate sensor frame failed checksum")]
    Checksum,
    #[error("sensor bus error (code {0})")]
    Bus(i32),
    #[error("ambient light channel unavailable")]
    LightUnavailable,
}

impl SensorError {
    /// Numeric code reported alongside diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            SensorError::Timeout => 16,
            SensorError::Checksum => 17,
            SensorError::Bus(code) => *code,
            SensorError::LightUnavailable => -1,
        }
    }
}

/// Hardware-facing sensor collaborator. Implementations own the bus access;
/// the producer only sees readings or error codes.
pub trait SensorSource {
    fn read(&mut self) -> Result<ClimateReading, SensorError>;
    fn read_ambient_light(&mut self) -> Result<u16, SensorError>;
    /// Each field is independently NaN when the meter did not answer for it.
    fn read_power_metrics(&mut self) -> PowerMetrics;
}

impl<S: SensorSource + ?Sized> SensorSource for Box<S> {
    fn read(&mut self) -> Result<ClimateReading, SensorError> {
        (**self).read()
    }

    fn read_ambient_light(&mut self) -> Result<u16, SensorError> {
        (**self).read_ambient_light()
    }

    fn read_power_metrics(&mut self) -> PowerMetrics {
        (**self).read_power_metrics()
    }
}

/// Converts a raw light ADC value to a 0-100 % brightness figure.
pub fn brightness_percent(raw: u16) -> f32 {
    f32::from(raw.min(LIGHT_ADC_MAX)) / f32::from(LIGHT_ADC_MAX) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_validity_requires_climate_fields() {
        let mut sample = SensorSample::unavailable();
        assert!(!sample.is_valid());

        sample.temperature = 24.5;
        assert!(!sample.is_valid());

        sample.humidity = 61.0;
        assert!(sample.is_valid());

        // Optional fields stay NaN without affecting validity
        assert!(sample.voltage.is_nan());
    }

    #[test]
    fn test_brightness_scaling() {
        assert!((brightness_percent(0) - 0.0).abs() < f32::EPSILON);
        assert!((brightness_percent(LIGHT_ADC_MAX) - 100.0).abs() < 1e-4);
        assert!((brightness_percent(u16::MAX) - 100.0).abs() < 1e-4);
    }
}
