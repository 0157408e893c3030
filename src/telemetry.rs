use crate::actuator::{ActuatorSnapshot, ActuatorState, Output};
use crate::sensors::SensorSample;
use crate::session::{CloudSession, TelemetryEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_TELEMETRY_INTERVAL_MS: u64 = 5000;
pub const TELEMETRY_FIELD_COUNT: usize = 9;

pub const TEMPERATURE_KEY: &str = "temperature";
pub const HUMIDITY_KEY: &str = "humidity";
pub const BRIGHTNESS_KEY: &str = "brightness";
pub const VOLTAGE_KEY: &str = "voltage";
pub const CURRENT_KEY: &str = "current";
pub const POWER_KEY: &str = "power";
pub const ENERGY_KEY: &str = "energy";

/// One publish worth of data: a sample plus the actuator state at the
/// moment of publishing.
#[derive(Debug, Clone, Copy)]
pub struct TelemetryRecord {
    pub sample: SensorSample,
    pub actuators: ActuatorSnapshot,
}

impl TelemetryRecord {
    /// Every field, always in the same order and under the same keys.
    pub fn entries(&self) -> [TelemetryEntry; TELEMETRY_FIELD_COUNT] {
        let s = &self.sample;
        [
            TelemetryEntry::number(TEMPERATURE_KEY, s.temperature),
            TelemetryEntry::number(HUMIDITY_KEY, s.humidity),
            TelemetryEntry::number(BRIGHTNESS_KEY, s.brightness),
            TelemetryEntry::number(VOLTAGE_KEY, s.voltage),
            TelemetryEntry::number(CURRENT_KEY, s.current),
            TelemetryEntry::number(POWER_KEY, s.power),
            TelemetryEntry::number(ENERGY_KEY, s.energy),
            TelemetryEntry::flag(Output::Fan.telemetry_key(), self.actuators.fan),
            TelemetryEntry::flag(Output::Light.telemetry_key(), self.actuators.light),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Published,
    NoData,
    SkippedNotReady,
    SkippedInvalid,
    SkippedRateLimited,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryMetrics {
    pub samples_received: u32,
    pub packets_published: u32,
    pub dropped_not_ready: u32,
    pub dropped_invalid: u32,
    pub dropped_rate_limited: u32,
    pub send_failures: u32,
    pub last_publish_at: Option<u64>,
}

/// Rate-limited publisher for drained samples.
#[derive(Debug)]
pub struct TelemetryDispatcher {
    interval_ms: u64,
    actuators: Arc<ActuatorState>,
    metrics: TelemetryMetrics,
}

impl TelemetryDispatcher {
    pub fn new(interval_ms: u64, actuators: Arc<ActuatorState>) -> Self {
        Self {
            interval_ms,
            actuators,
            metrics: TelemetryMetrics::default(),
        }
    }

    /// Handles at most one drained sample. The sample is consumed whatever
    /// the outcome; only a successful publish restarts the interval.
    pub fn dispatch(
        &mut self,
        current_time: u64,
        sample: Option<SensorSample>,
        session_ready: bool,
        session: &mut dyn CloudSession,
    ) -> DispatchOutcome {
        let sample = match sample {
            Some(sample) => sample,
            None => return DispatchOutcome::NoData,
        };
        self.metrics.samples_received = self.metrics.samples_received.wrapping_add(1);

        if !session_ready {
            self.metrics.dropped_not_ready = self.metrics.dropped_not_ready.wrapping_add(1);
            debug!("Session not ready, sample dropped");
            return DispatchOutcome::SkippedNotReady;
        }

        if !sample.is_valid() {
            self.metrics.dropped_invalid = self.metrics.dropped_invalid.wrapping_add(1);
            return DispatchOutcome::SkippedInvalid;
        }

        if !self.interval_elapsed(current_time) {
            self.metrics.dropped_rate_limited = self.metrics.dropped_rate_limited.wrapping_add(1);
            return DispatchOutcome::SkippedRateLimited;
        }

        let record = TelemetryRecord {
            sample,
            actuators: self.actuators.snapshot(),
        };

        match session.send_telemetry(&record.entries()) {
            Ok(()) => {
                self.metrics.packets_published = self.metrics.packets_published.wrapping_add(1);
                self.metrics.last_publish_at = Some(current_time);
                info!(
                    fan = record.actuators.fan,
                    light = record.actuators.light,
                    "Sent telemetry"
                );
                DispatchOutcome::Published
            }
            Err(error) => {
                self.metrics.send_failures = self.metrics.send_failures.wrapping_add(1);
                warn!("Failed to send telemetry: {}", error);
                DispatchOutcome::Failed
            }
        }
    }

    fn interval_elapsed(&self, current_time: u64) -> bool {
        match self.metrics.last_publish_at {
            None => true,
            Some(last) => current_time.saturating_sub(last) >= self.interval_ms,
        }
    }

    pub fn metrics(&self) -> &TelemetryMetrics {
        &self.metrics
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}
