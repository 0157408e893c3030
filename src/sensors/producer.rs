use super::{brightness_percent, SensorError, SensorSample, SensorSource};
use crate::queue::SampleQueue;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_SENSOR_INTERVAL_MS: u64 = 5000;

// Escalate to a summary warning after this many failed cycles in a row
const FAILURE_ESCALATION_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Climate(SensorError),
    NonNumeric,
}

#[derive(Debug, Clone, Copy)]
pub enum AcquireOutcome {
    Pushed(SensorSample),
    PushedEvicting {
        sample: SensorSample,
        evicted: SensorSample,
    },
    Rejected(RejectReason),
}

impl AcquireOutcome {
    pub fn was_pushed(&self) -> bool {
        !matches!(self, AcquireOutcome::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProducerStats {
    pub cycles: u32,
    pub pushed: u32,
    pub rejected: u32,
    pub evictions: u32,
    pub consecutive_failures: u32,
}

/// Periodic sensor acquisition. Each cycle reads every quantity and hands a
/// valid sample to the queue; failures are logged and the next cycle retries.
pub struct SensorProducer<S> {
    source: S,
    queue: Arc<SampleQueue>,
    stats: ProducerStats,
}

impl<S: SensorSource> SensorProducer<S> {
    pub fn new(source: S, queue: Arc<SampleQueue>) -> Self {
        Self {
            source,
            queue,
            stats: ProducerStats::default(),
        }
    }

    /// Runs one acquisition cycle.
    pub fn acquire(&mut self) -> AcquireOutcome {
        self.stats.cycles = self.stats.cycles.wrapping_add(1);

        let climate = self.source.read();
        let light = self.source.read_ambient_light();
        let metrics = self.source.read_power_metrics();

        let brightness = match light {
            Ok(raw) => brightness_percent(raw),
            Err(_) => f32::NAN,
        };

        let reading = match climate {
            Ok(reading) => reading,
            Err(error) => {
                self.log_failure(Some(error), light.is_err(), &metrics);
                return self.reject(RejectReason::Climate(error));
            }
        };

        let sample = SensorSample {
            temperature: reading.temperature,
            humidity: reading.humidity,
            brightness,
            voltage: metrics.voltage,
            current: metrics.current,
            power: metrics.power,
            energy: metrics.energy,
        };

        if !sample.is_valid() {
            self.log_failure(None, light.is_err(), &metrics);
            return self.reject(RejectReason::NonNumeric);
        }

        info!(
            "Read sensors -> temp: {:.2}°C, humi: {:.2}%, light: {:.2}%, voltage: {:.2}V, current: {:.2}A, power: {:.2}W, energy: {:.2}Wh",
            sample.temperature,
            sample.humidity,
            sample.brightness,
            sample.voltage,
            sample.current,
            sample.power,
            sample.energy
        );

        self.stats.consecutive_failures = 0;
        self.stats.pushed = self.stats.pushed.wrapping_add(1);

        match self.queue.push(sample) {
            None => AcquireOutcome::Pushed(sample),
            Some(evicted) => {
                self.stats.evictions = self.stats.evictions.wrapping_add(1);
                warn!("Sample queue full, overwrote oldest sample");
                AcquireOutcome::PushedEvicting { sample, evicted }
            }
        }
    }

    fn reject(&mut self, reason: RejectReason) -> AcquireOutcome {
        self.stats.rejected = self.stats.rejected.wrapping_add(1);
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);

        if self.stats.consecutive_failures % FAILURE_ESCALATION_THRESHOLD == 0 {
            warn!(
                failures = self.stats.consecutive_failures,
                "Sensor acquisition failing repeatedly, retrying every cycle"
            );
        }

        AcquireOutcome::Rejected(reason)
    }

    fn log_failure(
        &self,
        climate: Option<SensorError>,
        light_failed: bool,
        metrics: &super::PowerMetrics,
    ) {
        warn!("Failed to read sensors");
        if let Some(error) = climate {
            warn!(code = error.code(), "Climate sensor read failed: {}", error);
        } else {
            warn!("Climate sensor returned non-numeric values");
        }
        if light_failed {
            debug!("Light sensor read failed");
        }
        if metrics.voltage.is_nan() {
            debug!("Voltage read failed");
        }
        if metrics.current.is_nan() {
            debug!("Current read failed");
        }
        if metrics.power.is_nan() {
            debug!("Power read failed");
        }
        if metrics.energy.is_nan() {
            debug!("Energy read failed");
        }
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{ClimateReading, PowerMetrics};

    struct ScriptedSource {
        climate: Vec<Result<ClimateReading, SensorError>>,
        light: Result<u16, SensorError>,
        metrics: PowerMetrics,
    }

    impl SensorSource for ScriptedSource {
        fn read(&mut self) -> Result<ClimateReading, SensorError> {
            if self.climate.is_empty() {
                return Err(SensorError::Timeout);
            }
            self.climate.remove(0)
        }

        fn read_ambient_light(&mut self) -> Result<u16, SensorError> {
            self.light
        }

        fn read_power_metrics(&mut self) -> PowerMetrics {
            self.metrics
        }
    }

    fn climate(temperature: f32, humidity: f32) -> Result<ClimateReading, SensorError> {
        Ok(ClimateReading {
            temperature,
            humidity,
        })
    }

    fn producer(source: ScriptedSource) -> (SensorProducer<ScriptedSource>, Arc<SampleQueue>) {
        let queue = Arc::new(SampleQueue::with_capacity(8).unwrap());
        (SensorProducer::new(source, Arc::clone(&queue)), queue)
    }

    #[test]
    fn test_valid_sample_is_pushed() {
        let (mut producer, queue) = producer(ScriptedSource {
            climate: vec![climate(26.0, 70.0)],
            light: Ok(4095),
            metrics: PowerMetrics {
                voltage: 229.8,
                current: 0.42,
                power: 96.5,
                energy: 1200.0,
            },
        });

        let outcome = producer.acquire();
        assert!(outcome.was_pushed());

        let sample = queue.try_pop().unwrap();
        assert!((sample.brightness - 100.0).abs() < 1e-3);
        assert!((sample.voltage - 229.8).abs() < 1e-3);
    }

    #[test]
    fn test_nan_climate_never_pushed() {
        let (mut producer, queue) = producer(ScriptedSource {
            climate: vec![climate(f32::NAN, 70.0), climate(25.0, f32::NAN)],
            light: Ok(100),
            metrics: PowerMetrics::unavailable(),
        });

        assert!(matches!(
            producer.acquire(),
            AcquireOutcome::Rejected(RejectReason::NonNumeric)
        ));
        assert!(matches!(
            producer.acquire(),
            AcquireOutcome::Rejected(RejectReason::NonNumeric)
        ));
        assert!(queue.is_empty());
        assert_eq!(producer.stats().consecutive_failures, 2);
    }

    #[test]
    fn test_climate_error_rejected_with_code() {
        let (mut producer, queue) = producer(ScriptedSource {
            climate: vec![Err(SensorError::Checksum)],
            light: Ok(100),
            metrics: PowerMetrics::unavailable(),
        });

        match producer.acquire() {
            AcquireOutcome::Rejected(RejectReason::Climate(error)) => {
                assert_eq!(error, SensorError::Checksum);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_sample_keeps_nan_fields() {
        let (mut producer, queue) = producer(ScriptedSource {
            climate: vec![climate(22.0, 55.0)],
            light: Err(SensorError::LightUnavailable),
            metrics: PowerMetrics::unavailable(),
        });

        assert!(producer.acquire().was_pushed());
        let sample = queue.try_pop().unwrap();
        assert!(sample.is_valid());
        assert!(sample.brightness.is_nan());
        assert!(sample.energy.is_nan());
    }

    #[test]
    fn test_failure_counter_resets_after_success() {
        let (mut producer, _queue) = producer(ScriptedSource {
            climate: vec![Err(SensorError::Timeout), climate(21.0, 40.0)],
            light: Ok(0),
            metrics: PowerMetrics::unavailable(),
        });

        producer.acquire();
        assert_eq!(producer.stats().consecutive_failures, 1);
        producer.acquire();
        assert_eq!(producer.stats().consecutive_failures, 0);
        assert_eq!(producer.stats().cycles, 2);
    }
}
