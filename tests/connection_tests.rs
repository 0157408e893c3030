use cloudnode::actuator::*;
use cloudnode::backend::{LoopbackCloud, LoopbackLink, LoopbackSession};
use cloudnode::connection::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;

struct Node {
    cloud: LoopbackCloud,
    link: LoopbackLink,
    session: LoopbackSession,
    manager: ConnectionManager,
    sync: ActuatorSynchronizer<SimulatedRelays>,
}

impl Node {
    fn new() -> Self {
        let cloud = LoopbackCloud::new();
        Self {
            link: cloud.link(),
            session: cloud.session(),
            manager: ConnectionManager::new(ConnectionSettings::default(), Arc::new(SessionStatus::new())),
            sync: ActuatorSynchronizer::new(SimulatedRelays, Arc::new(ActuatorState::new())),
            cloud,
        }
    }

    fn service(&mut self, now: u64) -> ConnectionState {
        self.manager
            .service(now, &mut self.link, &mut self.session, &mut self.sync)
    }
}

fn attributes(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn test_link_then_session_then_handshake() {
    let mut node = Node::new();

    // First cycle only starts association
    assert_eq!(node.service(0), ConnectionState::Disconnected);
    assert_eq!(node.cloud.link_begins(), 1);
    assert_eq!(node.cloud.connects(), 0);

    // Next poll is gated by the attempt interval
    assert_eq!(node.service(100), ConnectionState::Disconnected);

    assert_eq!(node.service(500), ConnectionState::SessionReady);
    assert!(node.manager.status().is_ready());
    assert_eq!(node.cloud.connects(), 1);

    let commands = node.cloud.command_subscriptions();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].contains(&"setValueFan".to_string()));
    assert!(commands[0].contains(&"setValueLight".to_string()));
    assert_eq!(
        node.cloud.attribute_subscriptions(),
        vec![vec!["sharedvalueFan".to_string(), "sharedvalueLight".to_string()]]
    );
    assert_eq!(node.cloud.attribute_requests().len(), 1);
    assert!(node.manager.pending_request().is_some());
}

#[test]
fn test_handshake_runs_once_per_session() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);

    for now in (1000..20_000).step_by(100) {
        assert_eq!(node.service(now), ConnectionState::SessionReady);
    }

    assert_eq!(node.cloud.command_subscriptions().len(), 1);
    assert_eq!(node.cloud.attribute_subscriptions().len(), 1);
    assert_eq!(node.cloud.attribute_requests().len(), 1);
    assert_eq!(node.manager.stats().handshakes, 1);
}

#[test]
fn test_link_attempts_exhausted_restarts_association() {
    let mut node = Node::new();
    node.cloud.set_link_available(false);

    node.service(0);
    for attempt in 1..=20u64 {
        assert_eq!(node.service(attempt * 500), ConnectionState::Disconnected);
    }
    assert_eq!(node.manager.stats().link_failures, 1);
    assert_eq!(node.cloud.link_begins(), 1);

    node.service(10_500);
    assert_eq!(node.cloud.link_begins(), 2);

    node.cloud.set_link_available(true);
    assert_eq!(node.service(11_000), ConnectionState::SessionReady);
}

#[test]
fn test_connect_failure_backs_off() {
    let mut node = Node::new();
    node.cloud.set_accept_connect(false);

    node.service(0);
    assert_eq!(node.service(500), ConnectionState::LinkUp);
    assert_eq!(node.cloud.connects(), 1);
    assert_eq!(node.manager.stats().connect_failures, 1);

    // No retry before the reconnect delay
    node.cloud.set_accept_connect(true);
    assert_eq!(node.service(1000), ConnectionState::LinkUp);
    assert_eq!(node.service(5000), ConnectionState::LinkUp);
    assert_eq!(node.cloud.connects(), 1);

    assert_eq!(node.service(5500), ConnectionState::SessionReady);
    assert_eq!(node.cloud.connects(), 2);
}

#[test]
fn test_command_subscription_failure_retries_after_delay() {
    let mut node = Node::new();
    node.cloud.fail_command_subscriptions(1);

    node.service(0);
    assert_eq!(node.service(500), ConnectionState::SessionReady);
    assert!(!node.manager.status().handshake_complete());
    assert!(!node.manager.status().is_ready());
    assert!(node.cloud.command_subscriptions().is_empty());
    assert!(node.cloud.attribute_subscriptions().is_empty());

    node.service(1000);
    assert!(!node.manager.status().handshake_complete());

    node.service(5500);
    assert!(node.manager.status().is_ready());
    assert_eq!(node.cloud.command_subscriptions().len(), 1);
    assert_eq!(node.cloud.attribute_subscriptions().len(), 1);
    assert_eq!(node.manager.stats().handshake_failures, 1);
}

#[test]
fn test_attribute_subscription_failure_keeps_command_subscription() {
    let mut node = Node::new();
    node.cloud.fail_attribute_subscriptions(1);

    node.service(0);
    node.service(500);
    assert_eq!(node.cloud.command_subscriptions().len(), 1);
    assert!(node.cloud.attribute_subscriptions().is_empty());

    node.service(5500);
    assert!(node.manager.status().is_ready());
    assert_eq!(node.cloud.command_subscriptions().len(), 1);
    assert_eq!(node.cloud.attribute_subscriptions().len(), 1);
}

#[test]
fn test_failed_attribute_request_still_completes_handshake() {
    let mut node = Node::new();
    node.cloud.fail_attribute_requests(1);

    node.service(0);
    node.service(500);
    assert!(node.manager.status().is_ready());
    assert!(node.manager.pending_request().is_none());
    assert!(node.cloud.attribute_requests().is_empty());
}

#[test]
fn test_session_drop_disconnects_and_reruns_chain() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);
    assert!(node.manager.status().is_ready());

    node.cloud.drop_session();
    assert_eq!(node.service(1000), ConnectionState::Disconnected);
    assert_eq!(node.cloud.disconnects(), 1);
    assert!(!node.manager.status().handshake_complete());

    // Link is still up, so the next cycle goes straight to the session
    assert_eq!(node.service(1100), ConnectionState::SessionReady);
    assert_eq!(node.cloud.connects(), 2);
    assert_eq!(node.cloud.command_subscriptions().len(), 2);
    assert_eq!(node.cloud.attribute_subscriptions().len(), 2);
    assert_eq!(node.cloud.attribute_requests().len(), 2);
}

#[test]
fn test_link_loss_resets_to_disconnected() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);

    node.cloud.drop_link();
    assert_eq!(node.service(1000), ConnectionState::Disconnected);
    assert_eq!(node.manager.stats().session_drops, 1);

    // Association starts over
    assert_eq!(node.service(1100), ConnectionState::Disconnected);
    assert_eq!(node.cloud.link_begins(), 2);
    assert_eq!(node.service(1600), ConnectionState::SessionReady);
}

#[test]
fn test_attribute_response_applies_state() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);

    let request_id = node.manager.pending_request().map(|p| p.request_id).unwrap();
    node.cloud.respond_attributes(
        request_id,
        Some(attributes(&[("sharedvalueFan", json!(true)), ("sharedvalueLight", json!(false))])),
    );
    node.service(600);

    assert!(node.manager.pending_request().is_none());
    assert!(node.sync.state().get(Output::Fan));
    assert!(!node.sync.state().get(Output::Light));
    // Applied values are not echoed back
    assert!(node.cloud.attributes().is_empty());
}

#[test]
fn test_attribute_request_timeout_fires_once() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);
    assert!(node.manager.pending_request().is_some());

    node.service(5499);
    assert!(node.manager.pending_request().is_some());
    assert_eq!(node.manager.stats().attribute_timeouts, 0);

    node.service(5500);
    assert!(node.manager.pending_request().is_none());
    assert_eq!(node.manager.stats().attribute_timeouts, 1);

    node.service(20_000);
    assert_eq!(node.manager.stats().attribute_timeouts, 1);
}

#[test]
fn test_late_attribute_response_is_still_applied() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);
    let request_id = node.manager.pending_request().map(|p| p.request_id).unwrap();

    node.service(6000);
    assert_eq!(node.manager.stats().attribute_timeouts, 1);

    node.cloud
        .respond_attributes(request_id, Some(attributes(&[("sharedvalueLight", json!(true))])));
    node.service(6100);

    assert!(node.sync.state().get(Output::Light));
    assert_eq!(node.manager.stats().late_attribute_responses, 1);
    assert_eq!(node.manager.stats().attribute_timeouts, 1);
}

#[test]
fn test_commands_are_answered() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);

    let fan = node.cloud.send_rpc("setValueFan", json!(true));
    let bogus = node.cloud.send_rpc("reboot", json!(null));
    node.service(600);

    let responses = node.cloud.responses();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0], (fan, json!({ "newFanState": true })));
    assert_eq!(responses[1].0, bogus);
    assert!(responses[1].1.get("error").is_some());
    assert_eq!(node.manager.stats().commands_dispatched, 2);
}

#[test]
fn test_events_routed_during_handshake_retry() {
    let mut node = Node::new();
    node.cloud.fail_command_subscriptions(1);
    node.service(0);
    node.service(500);

    // Session is connected but the handshake is not complete; events are
    // still routed so an early push is not lost
    node.cloud.push_attributes(Some(attributes(&[("sharedvalueFan", json!(true))])));
    node.service(600);
    assert!(node.sync.state().get(Output::Fan));
}

#[test]
fn test_shutdown_disconnects() {
    let mut node = Node::new();
    node.service(0);
    node.service(500);

    node.manager.shutdown(&mut node.session);
    assert_eq!(node.manager.state(), ConnectionState::Disconnected);
    assert!(!node.cloud.is_connected());
    assert!(!node.manager.status().is_ready());
}

#[test]
fn test_unanswered_connect_times_out() {
    let mut node = Node::new();
    node.cloud.hold_answers(true);

    node.service(0);
    assert_eq!(node.service(500), ConnectionState::SessionConnecting);
    assert_eq!(node.service(5499), ConnectionState::SessionConnecting);
    assert_eq!(node.manager.stats().connect_failures, 0);

    // Gives up after the request timeout and backs off like a refusal
    assert_eq!(node.service(5500), ConnectionState::LinkUp);
    assert_eq!(node.manager.stats().connect_failures, 1);
    assert_eq!(node.cloud.disconnects(), 1);

    node.cloud.hold_answers(false);
    assert_eq!(node.service(10_000), ConnectionState::LinkUp);
    assert_eq!(node.service(10_500), ConnectionState::SessionReady);
    assert!(node.manager.status().is_ready());
}

#[test]
fn test_unanswered_subscription_reconnects() {
    let mut node = Node::new();
    node.cloud.fail_command_subscriptions(1);
    node.service(0);
    node.service(500);
    assert!(!node.manager.status().handshake_complete());

    node.cloud.hold_answers(true);
    assert_eq!(node.service(5500), ConnectionState::SessionReady);

    // Traffic is still served while the subscription waits
    node.cloud.push_attributes(Some(attributes(&[("sharedvalueLight", json!(true))])));
    assert_eq!(node.service(10_499), ConnectionState::SessionReady);
    assert!(node.sync.state().get(Output::Light));

    assert_eq!(node.service(10_500), ConnectionState::Disconnected);
    assert_eq!(node.manager.stats().unanswered_steps, 1);
    assert!(!node.cloud.is_connected());

    node.cloud.hold_answers(false);
    assert_eq!(node.service(10_600), ConnectionState::SessionReady);
    assert!(node.manager.status().is_ready());
    assert_eq!(node.cloud.command_subscriptions().len(), 1);
}
