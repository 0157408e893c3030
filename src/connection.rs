use crate::actuator::{ActuatorSink, ActuatorSynchronizer, SHARED_ATTRIBUTES};
use crate::session::{CloudSession, RequestId, SessionEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_LINK_ATTEMPTS: u8 = 20;
pub const DEFAULT_LINK_ATTEMPT_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

/// Connection lifecycle. Ordering follows the establishment chain, so
/// `state >= ConnectionState::LinkUp` means the link is believed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    LinkUp = 1,
    SessionConnecting = 2,
    SessionReady = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::LinkUp,
            2 => ConnectionState::SessionConnecting,
            3 => ConnectionState::SessionReady,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("network not found")]
    NoNetwork,
    #[error("link authentication failed")]
    AuthFailed,
}

/// Network layer below the cloud session (Wi-Fi association on the board).
pub trait NetworkLink: Send {
    fn is_up(&self) -> bool;
    /// Starts association. Completion is observed through `poll_link`.
    fn begin(&mut self);
    fn poll_link(&mut self) -> nb::Result<(), LinkError>;
}

/// Connection status shared with the OTA task and status reporting.
#[derive(Debug)]
pub struct SessionStatus {
    state: AtomicU8,
    handshake_complete: AtomicBool,
}

impl SessionStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            handshake_complete: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    /// Session connected and subscriptions in place.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::SessionReady && self.handshake_complete()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_handshake(&self, complete: bool) {
        self.handshake_complete.store(complete, Ordering::Release);
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub server: String,
    pub token: String,
    pub port: u16,
    pub link_attempts: u8,
    pub link_attempt_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            token: String::new(),
            port: 1883,
            link_attempts: DEFAULT_LINK_ATTEMPTS,
            link_attempt_interval_ms: DEFAULT_LINK_ATTEMPT_INTERVAL_MS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

/// Outstanding shared attribute request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeRequestTracker {
    pub request_id: RequestId,
    pub issued_at: u64,
    pub timeout_ms: u64,
}

impl AttributeRequestTracker {
    pub fn new(request_id: RequestId, issued_at: u64, timeout_ms: u64) -> Self {
        Self {
            request_id,
            issued_at,
            timeout_ms,
        }
    }

    pub fn is_expired(&self, current_time: u64) -> bool {
        current_time.saturating_sub(self.issued_at) >= self.timeout_ms
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub link_attempts: u32,
    pub link_failures: u32,
    pub session_connects: u32,
    pub connect_failures: u32,
    pub session_drops: u32,
    pub unanswered_steps: u32,
    pub handshakes: u32,
    pub handshake_failures: u32,
    pub attribute_requests: u32,
    pub attribute_timeouts: u32,
    pub late_attribute_responses: u32,
    pub commands_dispatched: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct HandshakeProgress {
    commands: bool,
    attributes: bool,
}

/// Owns the link and session lifecycle and the one-time subscription
/// handshake, and routes inbound session events to the synchronizer.
///
/// Driven by [`ConnectionManager::service`] once per session-task loop;
/// nothing in here blocks. Answers the session is still waiting for are timed
/// against `now` like the attribute request.
#[derive(Debug)]
pub struct ConnectionManager {
    settings: ConnectionSettings,
    state: ConnectionState,
    status: std::sync::Arc<SessionStatus>,

    link_started: bool,
    link_attempts: u8,
    next_link_poll: u64,

    connect_retry_at: Option<u64>,
    /// Start of the connect or subscription still waiting for its answer
    awaiting_since: Option<u64>,
    handshake: HandshakeProgress,
    handshake_retry_at: Option<u64>,
    pending_request: Option<AttributeRequestTracker>,

    stats: ConnectionStats,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, status: std::sync::Arc<SessionStatus>) -> Self {
        status.set_state(ConnectionState::Disconnected);
        status.set_handshake(false);

        Self {
            settings,
            state: ConnectionState::Disconnected,
            status,
            link_started: false,
            link_attempts: 0,
            next_link_poll: 0,
            connect_retry_at: None,
            awaiting_since: None,
            handshake: HandshakeProgress::default(),
            handshake_retry_at: None,
            pending_request: None,
            stats: ConnectionStats::default(),
        }
    }

    /// Advances the connection chain, completes the handshake and dispatches
    /// inbound events. Returns the state after this step.
    pub fn service<K: ActuatorSink>(
        &mut self,
        now: u64,
        link: &mut dyn NetworkLink,
        session: &mut dyn CloudSession,
        sync: &mut ActuatorSynchronizer<K>,
    ) -> ConnectionState {
        if self.check_liveness(link, session) {
            // Chain re-runs from the top on the next cycle
            return self.state;
        }

        if self.state == ConnectionState::Disconnected && !self.establish_link(now, link) {
            return self.state;
        }

        if matches!(
            self.state,
            ConnectionState::LinkUp | ConnectionState::SessionConnecting
        ) && !self.connect_session(now, session)
        {
            return self.state;
        }

        if self.state == ConnectionState::SessionReady && !self.status.handshake_complete() {
            self.run_handshake(now, session, sync);
        }

        // The handshake drops the session when the gateway stops answering
        if self.state == ConnectionState::SessionReady {
            self.pump_events(session, sync);
            self.expire_pending(now);
        }

        self.state
    }

    /// Returns true when a loss was detected and the chain was reset.
    fn check_liveness(&mut self, link: &dyn NetworkLink, session: &mut dyn CloudSession) -> bool {
        if self.state >= ConnectionState::LinkUp && !link.is_up() {
            warn!("Network link lost");
            if self.state >= ConnectionState::SessionConnecting {
                session.disconnect();
            }
            self.reset();
            return true;
        }

        if self.state == ConnectionState::SessionReady && !session.connected() {
            warn!("Cloud session dropped, disconnecting");
            session.disconnect();
            self.reset();
            return true;
        }

        false
    }

    fn establish_link(&mut self, now: u64, link: &mut dyn NetworkLink) -> bool {
        if link.is_up() {
            self.link_ready();
            return true;
        }

        if !self.link_started {
            info!("Connecting to network...");
            link.begin();
            self.link_started = true;
            self.link_attempts = 0;
            self.next_link_poll = now + self.settings.link_attempt_interval_ms;
            return false;
        }

        if now < self.next_link_poll {
            return false;
        }

        self.stats.link_attempts = self.stats.link_attempts.wrapping_add(1);
        match link.poll_link() {
            Ok(()) => {
                self.link_ready();
                true
            }
            Err(nb::Error::WouldBlock) => {
                self.link_attempts = self.link_attempts.saturating_add(1);
                self.next_link_poll = now + self.settings.link_attempt_interval_ms;
                if self.link_attempts >= self.settings.link_attempts {
                    warn!(
                        attempts = self.link_attempts,
                        "Network link not established, retrying"
                    );
                    self.stats.link_failures = self.stats.link_failures.wrapping_add(1);
                    self.link_started = false;
                }
                false
            }
            Err(nb::Error::Other(error)) => {
                warn!("Network link failed: {}", error);
                self.stats.link_failures = self.stats.link_failures.wrapping_add(1);
                self.link_started = false;
                false
            }
        }
    }

    fn link_ready(&mut self) {
        info!("Network link established");
        self.link_started = false;
        self.link_attempts = 0;
        self.set_state(ConnectionState::LinkUp);
    }

    fn connect_session(&mut self, now: u64, session: &mut dyn CloudSession) -> bool {
        if let Some(retry_at) = self.connect_retry_at {
            if now < retry_at {
                return false;
            }
            self.connect_retry_at = None;
        }

        if self.state != ConnectionState::SessionConnecting {
            self.set_state(ConnectionState::SessionConnecting);
            info!("Connecting to: {}:{}", self.settings.server, self.settings.port);
        }

        match session.connect(&self.settings.server, &self.settings.token, self.settings.port) {
            Ok(()) => {
                info!("Connected to cloud");
                self.awaiting_since = None;
                self.stats.session_connects = self.stats.session_connects.wrapping_add(1);
                self.set_state(ConnectionState::SessionReady);
                true
            }
            Err(nb::Error::WouldBlock) => {
                if self.answer_overdue(now) {
                    self.connect_failed(now, session, &"no answer from the cloud");
                }
                false
            }
            Err(nb::Error::Other(error)) => {
                self.connect_failed(now, session, &error);
                false
            }
        }
    }

    fn connect_failed(&mut self, now: u64, session: &mut dyn CloudSession, reason: &dyn std::fmt::Display) {
        warn!(
            "Failed to connect: {}, retrying in {} ms",
            reason, self.settings.reconnect_delay_ms
        );
        self.stats.connect_failures = self.stats.connect_failures.wrapping_add(1);
        session.disconnect();
        self.awaiting_since = None;
        self.connect_retry_at = Some(now + self.settings.reconnect_delay_ms);
        self.set_state(ConnectionState::LinkUp);
    }

    /// Starts the answer clock on the first `WouldBlock` and reports whether
    /// the request timeout has run out.
    fn answer_overdue(&mut self, now: u64) -> bool {
        let since = *self.awaiting_since.get_or_insert(now);
        now.saturating_sub(since) >= self.settings.request_timeout_ms
    }

    /// A subscription still unanswered: drop the session once the answer is
    /// overdue so the chain re-runs.
    fn await_subscription(&mut self, now: u64, session: &mut dyn CloudSession, what: &str) {
        if !self.answer_overdue(now) {
            return;
        }
        warn!(
            "No answer to {} subscription after {} ms, reconnecting",
            what, self.settings.request_timeout_ms
        );
        self.stats.unanswered_steps = self.stats.unanswered_steps.wrapping_add(1);
        session.disconnect();
        self.reset();
    }

    fn run_handshake<K: ActuatorSink>(
        &mut self,
        now: u64,
        session: &mut dyn CloudSession,
        sync: &ActuatorSynchronizer<K>,
    ) {
        if let Some(retry_at) = self.handshake_retry_at {
            if now < retry_at {
                return;
            }
            self.handshake_retry_at = None;
        }

        if !self.handshake.commands {
            let methods = sync.command_methods();
            match session.subscribe_commands(&methods) {
                Ok(()) => {
                    info!("Subscribed to {} RPC methods", methods.len());
                    self.awaiting_since = None;
                    self.handshake.commands = true;
                }
                Err(nb::Error::WouldBlock) => {
                    self.await_subscription(now, session, "RPC");
                    return;
                }
                Err(nb::Error::Other(error)) => {
                    self.handshake_failed(now, "RPC", error);
                    return;
                }
            }
        }

        if !self.handshake.attributes {
            match session.subscribe_shared_attributes(&SHARED_ATTRIBUTES) {
                Ok(()) => {
                    info!("Subscribed to shared attributes");
                    self.awaiting_since = None;
                    self.handshake.attributes = true;
                }
                Err(nb::Error::WouldBlock) => {
                    self.await_subscription(now, session, "shared attributes");
                    return;
                }
                Err(nb::Error::Other(error)) => {
                    self.handshake_failed(now, "shared attributes", error);
                    return;
                }
            }
        }

        match session.request_shared_attributes(&SHARED_ATTRIBUTES) {
            Ok(request_id) => {
                debug!(request_id, "Requested current shared attributes");
                self.stats.attribute_requests = self.stats.attribute_requests.wrapping_add(1);
                self.pending_request = Some(AttributeRequestTracker::new(
                    request_id,
                    now,
                    self.settings.request_timeout_ms,
                ));
            }
            Err(error) => {
                // Values resync on the next push
                warn!("Failed to request shared attributes: {}", error);
            }
        }

        self.status.set_handshake(true);
        self.stats.handshakes = self.stats.handshakes.wrapping_add(1);
        info!("Subscribe done");
    }

    fn handshake_failed(&mut self, now: u64, what: &str, error: crate::session::SessionError) {
        warn!("Failed to subscribe for {}: {}", what, error);
        self.awaiting_since = None;
        self.stats.handshake_failures = self.stats.handshake_failures.wrapping_add(1);
        self.handshake_retry_at = Some(now + self.settings.reconnect_delay_ms);
    }

    fn pump_events<K: ActuatorSink>(&mut self, session: &mut dyn CloudSession, sync: &mut ActuatorSynchronizer<K>) {
        for event in session.poll() {
            match event {
                SessionEvent::Command {
                    request_id,
                    method,
                    params,
                } => {
                    let response = match sync.handle_command(&method, &params, session) {
                        Ok(ack) => ack,
                        Err(error) => {
                            warn!("Command {} rejected: {}", method, error);
                            json!({ "error": error.to_string() })
                        }
                    };
                    if let Err(error) = session.respond_command(request_id, response) {
                        warn!("Failed to answer command {}: {}", method, error);
                    }
                    self.stats.commands_dispatched = self.stats.commands_dispatched.wrapping_add(1);
                }
                SessionEvent::SharedAttributes(attributes) => {
                    sync.apply_shared_attributes(attributes.as_ref());
                }
                SessionEvent::AttributeResponse {
                    request_id,
                    attributes,
                } => {
                    match self.pending_request {
                        Some(pending) if pending.request_id == request_id => {
                            info!("Shared attributes received");
                            self.pending_request = None;
                        }
                        _ => {
                            debug!(request_id, "Applying late shared attribute response");
                            self.stats.late_attribute_responses =
                                self.stats.late_attribute_responses.wrapping_add(1);
                        }
                    }
                    sync.apply_shared_attributes(attributes.as_ref());
                }
            }
        }
    }

    fn expire_pending(&mut self, now: u64) {
        if let Some(pending) = self.pending_request {
            if pending.is_expired(now) {
                warn!(
                    request_id = pending.request_id,
                    "Shared attribute request timed out after {} ms", pending.timeout_ms
                );
                self.stats.attribute_timeouts = self.stats.attribute_timeouts.wrapping_add(1);
                self.pending_request = None;
            }
        }
    }

    fn reset(&mut self) {
        self.stats.session_drops = self.stats.session_drops.wrapping_add(1);
        self.set_state(ConnectionState::Disconnected);
        self.status.set_handshake(false);
        self.handshake = HandshakeProgress::default();
        self.handshake_retry_at = None;
        self.connect_retry_at = None;
        self.awaiting_since = None;
        self.pending_request = None;
        self.link_started = false;
        self.link_attempts = 0;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status.set_state(state);
    }

    /// Tears the session down, used on shutdown and before a restart.
    pub fn shutdown(&mut self, session: &mut dyn CloudSession) {
        if self.state >= ConnectionState::SessionConnecting {
            session.disconnect();
        }
        self.set_state(ConnectionState::Disconnected);
        self.status.set_handshake(false);
        self.handshake = HandshakeProgress::default();
        self.awaiting_since = None;
        self.pending_request = None;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn status(&self) -> &std::sync::Arc<SessionStatus> {
        &self.status
    }

    pub fn pending_request(&self) -> Option<&AttributeRequestTracker> {
        self.pending_request.as_ref()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(ConnectionState::Disconnected < ConnectionState::LinkUp);
        assert!(ConnectionState::LinkUp < ConnectionState::SessionConnecting);
        assert!(ConnectionState::SessionConnecting < ConnectionState::SessionReady);
        assert_eq!(ConnectionState::from_u8(3), ConnectionState::SessionReady);
        assert_eq!(ConnectionState::from_u8(42), ConnectionState::Disconnected);
    }

    #[test]
    fn test_request_tracker_expiry() {
        let tracker = AttributeRequestTracker::new(7, 1000, 5000);
        assert!(!tracker.is_expired(1000));
        assert!(!tracker.is_expired(5999));
        assert!(tracker.is_expired(6000));
    }

    #[test]
    fn test_status_ready_requires_handshake() {
        let status = SessionStatus::new();
        status.set_state(ConnectionState::SessionReady);
        assert!(!status.is_ready());
        status.set_handshake(true);
        assert!(status.is_ready());
    }
}
