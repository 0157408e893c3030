use cloudnode::actuator::{ActuatorState, Output};
use cloudnode::backend::{LoopbackCloud, LoopbackSession};
use cloudnode::connection::NetworkLink;
use cloudnode::queue::SampleQueue;
use cloudnode::sensors::SensorSample;
use cloudnode::session::{CloudSession, TelemetryValue};
use cloudnode::telemetry::*;
use std::sync::Arc;

fn sample(temperature: f32) -> SensorSample {
    SensorSample {
        temperature,
        humidity: 55.0,
        brightness: 42.0,
        voltage: 229.5,
        current: 0.4,
        power: 91.8,
        energy: 12.5,
    }
}

fn setup() -> (LoopbackCloud, LoopbackSession, TelemetryDispatcher, Arc<ActuatorState>) {
    let cloud = LoopbackCloud::new();
    cloud.link().poll_link().unwrap();
    let mut session = cloud.session();
    session.connect("127.0.0.1", "token", 1883).unwrap();

    let actuators = Arc::new(ActuatorState::new());
    let dispatcher = TelemetryDispatcher::new(DEFAULT_TELEMETRY_INTERVAL_MS, Arc::clone(&actuators));
    (cloud, session, dispatcher, actuators)
}

#[test]
fn test_first_sample_publishes_immediately() {
    let (cloud, mut session, mut dispatcher, actuators) = setup();
    actuators.set(Output::Light, true);

    let outcome = dispatcher.dispatch(0, Some(sample(27.5)), true, &mut session);
    assert_eq!(outcome, DispatchOutcome::Published);

    let sent = cloud.telemetry();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].len(), TELEMETRY_FIELD_COUNT);
    assert_eq!(sent[0][0].key, TEMPERATURE_KEY);
    assert_eq!(sent[0][0].value, TelemetryValue::Number(27.5));
    assert_eq!(sent[0][7].value, TelemetryValue::Flag(false));
    assert_eq!(sent[0][8].value, TelemetryValue::Flag(true));
}

#[test]
fn test_rate_limit_between_publishes() {
    let (cloud, mut session, mut dispatcher, _) = setup();

    assert_eq!(
        dispatcher.dispatch(1000, Some(sample(25.0)), true, &mut session),
        DispatchOutcome::Published
    );
    assert_eq!(
        dispatcher.dispatch(3000, Some(sample(25.1)), true, &mut session),
        DispatchOutcome::SkippedRateLimited
    );
    assert_eq!(
        dispatcher.dispatch(5999, Some(sample(25.2)), true, &mut session),
        DispatchOutcome::SkippedRateLimited
    );
    assert_eq!(
        dispatcher.dispatch(6000, Some(sample(25.3)), true, &mut session),
        DispatchOutcome::Published
    );

    let sent = cloud.telemetry();
    assert_eq!(sent.len(), 2);
    // The sample drained at the publish moment is the one sent
    assert_eq!(sent[1][0].value, TelemetryValue::Number(25.3));
    assert_eq!(dispatcher.metrics().dropped_rate_limited, 2);
}

#[test]
fn test_empty_period_is_no_data() {
    let (cloud, mut session, mut dispatcher, _) = setup();
    assert_eq!(dispatcher.dispatch(0, None, true, &mut session), DispatchOutcome::NoData);
    assert!(cloud.telemetry().is_empty());
    assert_eq!(dispatcher.metrics().samples_received, 0);
}

#[test]
fn test_sample_dropped_when_not_ready() {
    let (cloud, mut session, mut dispatcher, _) = setup();

    assert_eq!(
        dispatcher.dispatch(0, Some(sample(25.0)), false, &mut session),
        DispatchOutcome::SkippedNotReady
    );
    assert!(cloud.telemetry().is_empty());

    // Nothing was published, so the next ready sample goes out at once
    assert_eq!(
        dispatcher.dispatch(100, Some(sample(25.0)), true, &mut session),
        DispatchOutcome::Published
    );
}

#[test]
fn test_invalid_sample_not_published() {
    let (cloud, mut session, mut dispatcher, _) = setup();

    let mut bad = sample(25.0);
    bad.humidity = f32::NAN;
    assert_eq!(
        dispatcher.dispatch(0, Some(bad), true, &mut session),
        DispatchOutcome::SkippedInvalid
    );
    assert!(cloud.telemetry().is_empty());
    assert_eq!(dispatcher.metrics().dropped_invalid, 1);
}

#[test]
fn test_optional_fields_published_as_nan() {
    let (cloud, mut session, mut dispatcher, _) = setup();

    let mut partial = sample(25.0);
    partial.voltage = f32::NAN;
    partial.brightness = f32::NAN;
    dispatcher.dispatch(0, Some(partial), true, &mut session);

    let sent = cloud.telemetry();
    assert_eq!(sent[0].len(), TELEMETRY_FIELD_COUNT);
    let voltage = sent[0].iter().find(|entry| entry.key == VOLTAGE_KEY).unwrap();
    assert!(voltage.value.as_f32().unwrap().is_nan());
}

#[test]
fn test_send_failure_does_not_consume_interval() {
    let (cloud, mut session, mut dispatcher, _) = setup();
    cloud.fail_telemetry(1);

    assert_eq!(
        dispatcher.dispatch(0, Some(sample(25.0)), true, &mut session),
        DispatchOutcome::Failed
    );
    assert_eq!(dispatcher.metrics().last_publish_at, None);

    assert_eq!(
        dispatcher.dispatch(100, Some(sample(25.0)), true, &mut session),
        DispatchOutcome::Published
    );
    assert_eq!(dispatcher.metrics().send_failures, 1);
}

#[test]
fn test_actuator_state_read_at_publish_time() {
    let (cloud, mut session, mut dispatcher, actuators) = setup();

    dispatcher.dispatch(0, Some(sample(25.0)), true, &mut session);
    actuators.set(Output::Fan, true);
    dispatcher.dispatch(5000, Some(sample(25.0)), true, &mut session);

    let sent = cloud.telemetry();
    assert_eq!(sent[0][7].value, TelemetryValue::Flag(false));
    assert_eq!(sent[1][7].value, TelemetryValue::Flag(true));
}

#[tokio::test(start_paused = true)]
async fn test_queue_keeps_newest_samples() {
    let queue = SampleQueue::with_capacity(10).unwrap();
    for i in 0..15 {
        queue.push(sample(i as f32));
    }

    assert_eq!(queue.len(), 10);
    assert_eq!(queue.stats().evicted, 5);

    let first = queue.pop(std::time::Duration::from_millis(10)).await.unwrap();
    assert_eq!(first.temperature, 5.0);

    let mut last = first;
    while let Some(next) = queue.try_pop() {
        last = next;
    }
    assert_eq!(last.temperature, 14.0);
    assert!(queue.pop(std::time::Duration::from_millis(100)).await.is_none());
}
