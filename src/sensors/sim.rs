use super::{ClimateReading, PowerMetrics, SensorError, SensorSource, LIGHT_ADC_MAX};
use serde::{Deserialize, Serialize};

// Default failure rates observed on bench hardware
const CLIMATE_FAILURE_PERCENT: f32 = 2.0;
const LIGHT_FAILURE_PERCENT: f32 = 0.5;
const METER_FAILURE_PERCENT: f32 = 5.0;

const RNG_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Failure behavior of the simulated board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub climate_failure_percent: f32,
    pub light_failure_percent: f32,
    pub meter_failure_percent: f32,
    /// Simulated time advanced on every climate read, in seconds
    pub step_seconds: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            climate_failure_percent: CLIMATE_FAILURE_PERCENT,
            light_failure_percent: LIGHT_FAILURE_PERCENT,
            meter_failure_percent: METER_FAILURE_PERCENT,
            step_seconds: 5.0,
        }
    }
}

impl SimulationConfig {
    /// A board that never fails a read.
    pub fn reliable() -> Self {
        Self {
            climate_failure_percent: 0.0,
            light_failure_percent: 0.0,
            meter_failure_percent: 0.0,
            ..Self::default()
        }
    }
}

/// Synthetic climate, light, and power meter readings for hosts without
/// the real sensor board.
#[derive(Debug)]
pub struct SimulatedSensors {
    config: SimulationConfig,
    elapsed_s: f32,
    energy_wh: f32,
    rng_state: u64,
}

impl SimulatedSensors {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            elapsed_s: 0.0,
            energy_wh: 0.0,
            rng_state: RNG_SEED,
        }
    }

    fn should_fail(&mut self, rate_percent: f32) -> bool {
        rate_percent > 0.0 && self.random_float() < rate_percent / 100.0
    }

    // Linear Congruential Generator, Numerical Recipes parameters
    fn next_random(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_mul(1664525).wrapping_add(1013904223);
        self.rng_state
    }

    fn random_float(&mut self) -> f32 {
        ((self.next_random() >> 40) as f32) / ((1u64 << 24) as f32)
    }
}

impl Default for SimulatedSensors {
    fn default() -> Self {
        Self::new(SimulationConfig::default())
    }
}

impl SensorSource for SimulatedSensors {
    fn read(&mut self) -> Result<ClimateReading, SensorError> {
        self.elapsed_s += self.config.step_seconds;

        if self.should_fail(self.config.climate_failure_percent) {
            return Err(if self.random_float() < 0.5 {
                SensorError::Timeout
            } else {
                SensorError::Checksum
            });
        }

        let day_phase = (self.elapsed_s / 600.0).sin();
        Ok(ClimateReading {
            temperature: 27.0 + day_phase * 4.0 + (self.random_float() - 0.5) * 0.4,
            humidity: (65.0 - day_phase * 10.0 + (self.random_float() - 0.5)).clamp(0.0, 100.0),
        })
    }

    fn read_ambient_light(&mut self) -> Result<u16, SensorError> {
        if self.should_fail(self.config.light_failure_percent) {
            return Err(SensorError::LightUnavailable);
        }

        let level = ((self.elapsed_s / 900.0).sin() * 0.5 + 0.5) * f32::from(LIGHT_ADC_MAX);
        Ok((level as u16).min(LIGHT_ADC_MAX))
    }

    fn read_power_metrics(&mut self) -> PowerMetrics {
        let mut metrics = PowerMetrics::unavailable();
        let rate = self.config.meter_failure_percent;

        let voltage = 228.0 + (self.elapsed_s / 120.0).sin() * 3.0;
        let current = 0.35 + (self.elapsed_s / 300.0).cos().abs() * 0.2;
        let power = voltage * current;
        self.energy_wh += power * self.config.step_seconds / 3600.0;

        if !self.should_fail(rate) {
            metrics.voltage = voltage;
        }
        if !self.should_fail(rate) {
            metrics.current = current;
        }
        if !self.should_fail(rate) {
            metrics.power = power;
        }
        if !self.should_fail(rate) {
            metrics.energy = self.energy_wh;
        }

        metrics
    }
}
