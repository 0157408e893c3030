use crate::connection::{LinkError, NetworkLink};
use crate::ota::FirmwareSlot;
use crate::session::{
    AttributeMap, CloudSession, FirmwareIdentity, FirmwareTransfer, RequestId, SessionError, SessionEvent,
    TelemetryEntry, TransferEvent, UpdateRequest,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

const SIMULATED_CHUNK_COUNT: u32 = 4;

#[derive(Debug)]
struct OfferedFirmware {
    identity: FirmwareIdentity,
    size: u32,
}

#[derive(Debug)]
struct CloudInner {
    link_available: bool,
    link_up: bool,
    accept_connect: bool,
    answers_held: bool,
    connected: bool,
    command_subscribe_failures: u32,
    attribute_subscribe_failures: u32,
    attribute_request_failures: u32,
    announce_failures: u32,
    update_request_failures: u32,
    telemetry_failures: u32,
    auto_attribute_response: Option<AttributeMap>,
    manual_transfer: bool,
    offered: Option<OfferedFirmware>,
    pending_install: Option<FirmwareIdentity>,
    slot: Option<Arc<FirmwareSlot>>,
    next_request_id: RequestId,

    inbound: VecDeque<SessionEvent>,
    transfer_events: VecDeque<TransferEvent>,

    link_begins: u32,
    connects: u32,
    disconnects: u32,
    telemetry: Vec<Vec<TelemetryEntry>>,
    attributes: Vec<(String, Value)>,
    command_subscriptions: Vec<Vec<String>>,
    attribute_subscriptions: Vec<Vec<String>>,
    attribute_requests: Vec<RequestId>,
    responses: Vec<(RequestId, Value)>,
    announcements: Vec<FirmwareIdentity>,
    update_requests: Vec<UpdateRequest>,
    cancels: u32,
}

impl Default for CloudInner {
    fn default() -> Self {
        Self {
            link_available: true,
            link_up: false,
            accept_connect: true,
            answers_held: false,
            connected: false,
            command_subscribe_failures: 0,
            attribute_subscribe_failures: 0,
            attribute_request_failures: 0,
            announce_failures: 0,
            update_request_failures: 0,
            telemetry_failures: 0,
            auto_attribute_response: None,
            manual_transfer: false,
            offered: None,
            pending_install: None,
            slot: None,
            next_request_id: 1,
            inbound: VecDeque::new(),
            transfer_events: VecDeque::new(),
            link_begins: 0,
            connects: 0,
            disconnects: 0,
            telemetry: Vec::new(),
            attributes: Vec::new(),
            command_subscriptions: Vec::new(),
            attribute_subscriptions: Vec::new(),
            attribute_requests: Vec::new(),
            responses: Vec::new(),
            announcements: Vec::new(),
            update_requests: Vec::new(),
            cancels: 0,
        }
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

/// In-process cloud. The handle scripts the remote side (commands,
/// attribute pushes, firmware offers, injected failures) and records
/// everything the device sends.
#[derive(Debug, Clone, Default)]
pub struct LoopbackCloud {
    inner: Arc<Mutex<CloudInner>>,
}

impl LoopbackCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> LoopbackSession {
        LoopbackSession { cloud: self.clone() }
    }

    pub fn transfer(&self) -> LoopbackTransfer {
        LoopbackTransfer { cloud: self.clone() }
    }

    pub fn link(&self) -> LoopbackLink {
        LoopbackLink { cloud: self.clone() }
    }

    /// Firmware installs complete into this slot.
    pub fn attach_slot(&self, slot: Arc<FirmwareSlot>) {
        self.lock().slot = Some(slot);
    }

    // Remote side scripting

    pub fn set_link_available(&self, available: bool) {
        self.lock().link_available = available;
    }

    pub fn drop_link(&self) {
        let mut inner = self.lock();
        inner.link_up = false;
        inner.connected = false;
    }

    pub fn set_accept_connect(&self, accept: bool) {
        self.lock().accept_connect = accept;
    }

    /// Connect and subscription answers stay outstanding while held.
    pub fn hold_answers(&self, held: bool) {
        self.lock().answers_held = held;
    }

    /// Broker side closes the session.
    pub fn drop_session(&self) {
        self.lock().connected = false;
    }

    pub fn fail_command_subscriptions(&self, count: u32) {
        self.lock().command_subscribe_failures = count;
    }

    pub fn fail_attribute_subscriptions(&self, count: u32) {
        self.lock().attribute_subscribe_failures = count;
    }

    pub fn fail_attribute_requests(&self, count: u32) {
        self.lock().attribute_request_failures = count;
    }

    pub fn fail_announcements(&self, count: u32) {
        self.lock().announce_failures = count;
    }

    pub fn fail_update_requests(&self, count: u32) {
        self.lock().update_request_failures = count;
    }

    pub fn fail_telemetry(&self, count: u32) {
        self.lock().telemetry_failures = count;
    }

    /// Answer every attribute request immediately with these values.
    pub fn answer_attribute_requests(&self, attributes: Option<AttributeMap>) {
        self.lock().auto_attribute_response = attributes;
    }

    pub fn send_rpc(&self, method: &str, params: Value) -> RequestId {
        let mut inner = self.lock();
        let request_id = inner.next_request_id;
        inner.next_request_id = inner.next_request_id.wrapping_add(1);
        inner.inbound.push_back(SessionEvent::Command {
            request_id,
            method: method.to_string(),
            params,
        });
        request_id
    }

    pub fn push_attributes(&self, attributes: Option<AttributeMap>) {
        self.lock()
            .inbound
            .push_back(SessionEvent::SharedAttributes(attributes));
    }

    pub fn respond_attributes(&self, request_id: RequestId, attributes: Option<AttributeMap>) {
        self.lock().inbound.push_back(SessionEvent::AttributeResponse {
            request_id,
            attributes,
        });
    }

    /// Assigns an image; an update request for a different version
    /// downloads it and installs it into the attached slot.
    pub fn offer_firmware(&self, identity: FirmwareIdentity, size: u32) {
        self.lock().offered = Some(OfferedFirmware { identity, size });
    }

    /// Update requests produce no events; tests feed them explicitly.
    pub fn set_manual_transfer(&self, manual: bool) {
        self.lock().manual_transfer = manual;
    }

    pub fn push_transfer_event(&self, event: TransferEvent) {
        self.lock().transfer_events.push_back(event);
    }

    // Recordings

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn link_begins(&self) -> u32 {
        self.lock().link_begins
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.lock().disconnects
    }

    pub fn telemetry(&self) -> Vec<Vec<TelemetryEntry>> {
        self.lock().telemetry.clone()
    }

    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.lock().attributes.clone()
    }

    pub fn command_subscriptions(&self) -> Vec<Vec<String>> {
        self.lock().command_subscriptions.clone()
    }

    pub fn attribute_subscriptions(&self) -> Vec<Vec<String>> {
        self.lock().attribute_subscriptions.clone()
    }

    pub fn attribute_requests(&self) -> Vec<RequestId> {
        self.lock().attribute_requests.clone()
    }

    pub fn responses(&self) -> Vec<(RequestId, Value)> {
        self.lock().responses.clone()
    }

    pub fn announcements(&self) -> Vec<FirmwareIdentity> {
        self.lock().announcements.clone()
    }

    pub fn update_requests(&self) -> Vec<UpdateRequest> {
        self.lock().update_requests.clone()
    }

    pub fn cancels(&self) -> u32 {
        self.lock().cancels
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackSession {
    cloud: LoopbackCloud,
}

impl LoopbackSession {
    fn connected_inner(&self) -> Result<MutexGuard<'_, CloudInner>, SessionError> {
        let inner = self.cloud.lock();
        if inner.connected {
            Ok(inner)
        } else {
            Err(SessionError::NotConnected)
        }
    }
}

impl CloudSession for LoopbackSession {
    fn connect(&mut self, server: &str, _credential: &str, port: u16) -> nb::Result<(), SessionError> {
        let mut inner = self.cloud.lock();
        inner.connects += 1;
        if inner.answers_held {
            return Err(nb::Error::WouldBlock);
        }
        if !inner.accept_connect || !inner.link_up {
            return Err(nb::Error::Other(SessionError::ConnectRefused {
                server: server.to_string(),
                port,
            }));
        }
        inner.connected = true;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.cloud.lock().connected
    }

    fn disconnect(&mut self) {
        let mut inner = self.cloud.lock();
        inner.disconnects += 1;
        inner.connected = false;
        inner.inbound.clear();
    }

    fn send_telemetry(&mut self, entries: &[TelemetryEntry]) -> Result<(), SessionError> {
        let mut inner = self.connected_inner()?;
        if take_failure(&mut inner.telemetry_failures) {
            return Err(SessionError::Transport("telemetry rejected".to_string()));
        }
        inner.telemetry.push(entries.to_vec());
        Ok(())
    }

    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        let mut inner = self.connected_inner()?;
        inner.attributes.push((key.to_string(), value));
        Ok(())
    }

    fn subscribe_commands(&mut self, methods: &[&'static str]) -> nb::Result<(), SessionError> {
        let mut inner = self.connected_inner()?;
        if inner.answers_held {
            return Err(nb::Error::WouldBlock);
        }
        if take_failure(&mut inner.command_subscribe_failures) {
            return Err(nb::Error::Other(SessionError::SubscriptionRejected("rpc")));
        }
        inner
            .command_subscriptions
            .push(methods.iter().map(|m| m.to_string()).collect());
        Ok(())
    }

    fn subscribe_shared_attributes(&mut self, names: &[&'static str]) -> nb::Result<(), SessionError> {
        let mut inner = self.connected_inner()?;
        if inner.answers_held {
            return Err(nb::Error::WouldBlock);
        }
        if take_failure(&mut inner.attribute_subscribe_failures) {
            return Err(nb::Error::Other(SessionError::SubscriptionRejected("shared attributes")));
        }
        inner
            .attribute_subscriptions
            .push(names.iter().map(|n| n.to_string()).collect());
        Ok(())
    }

    fn request_shared_attributes(&mut self, _names: &[&'static str]) -> Result<RequestId, SessionError> {
        let mut inner = self.connected_inner()?;
        if take_failure(&mut inner.attribute_request_failures) {
            return Err(SessionError::RequestRejected);
        }

        let request_id = inner.next_request_id;
        inner.next_request_id = inner.next_request_id.wrapping_add(1);
        inner.attribute_requests.push(request_id);

        if let Some(attributes) = inner.auto_attribute_response.clone() {
            inner.inbound.push_back(SessionEvent::AttributeResponse {
                request_id,
                attributes: Some(attributes),
            });
        }
        Ok(request_id)
    }

    fn respond_command(&mut self, request_id: RequestId, response: Value) -> Result<(), SessionError> {
        let mut inner = self.connected_inner()?;
        inner.responses.push((request_id, response));
        Ok(())
    }

    fn poll(&mut self) -> Vec<SessionEvent> {
        let mut inner = self.cloud.lock();
        if !inner.connected {
            return Vec::new();
        }
        inner.inbound.drain(..).collect()
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackTransfer {
    cloud: LoopbackCloud,
}

impl FirmwareTransfer for LoopbackTransfer {
    fn announce(&mut self, identity: &FirmwareIdentity) -> Result<(), SessionError> {
        let mut inner = self.cloud.lock();
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        if take_failure(&mut inner.announce_failures) {
            return Err(SessionError::Transport("firmware info rejected".to_string()));
        }
        inner.announcements.push(identity.clone());
        Ok(())
    }

    fn request_update(&mut self, request: &UpdateRequest) -> Result<(), SessionError> {
        let mut inner = self.cloud.lock();
        if !inner.connected {
            return Err(SessionError::NotConnected);
        }
        if take_failure(&mut inner.update_request_failures) {
            return Err(SessionError::RequestRejected);
        }
        inner.update_requests.push(request.clone());

        if inner.manual_transfer {
            return Ok(());
        }

        let offer = inner
            .offered
            .as_ref()
            .filter(|offer| offer.identity != request.identity)
            .map(|offer| (offer.identity.clone(), offer.size));

        match offer {
            None => inner.transfer_events.push_back(TransferEvent::UpToDate),
            Some((identity, size)) => {
                debug!("Loopback transferring {} ({} bytes)", identity, size);
                inner
                    .transfer_events
                    .push_back(TransferEvent::Starting { total_bytes: size });
                for chunk in 1..=SIMULATED_CHUNK_COUNT {
                    inner.transfer_events.push_back(TransferEvent::Progress {
                        received: size / SIMULATED_CHUNK_COUNT * chunk,
                        total: size,
                    });
                }
                inner
                    .transfer_events
                    .push_back(TransferEvent::Finished { success: true });
                inner.pending_install = Some(identity);
            }
        }
        Ok(())
    }

    fn poll_transfer(&mut self) -> Vec<TransferEvent> {
        let mut inner = self.cloud.lock();
        let events: Vec<TransferEvent> = inner.transfer_events.drain(..).collect();

        if events.contains(&TransferEvent::Finished { success: true }) {
            let identity = inner.pending_install.take();
            if let (Some(identity), Some(slot)) = (identity, inner.slot.as_ref()) {
                slot.install(identity);
            }
        }
        events
    }

    fn cancel_update(&mut self) {
        let mut inner = self.cloud.lock();
        inner.cancels += 1;
        inner.pending_install = None;
        inner.transfer_events.clear();
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackLink {
    cloud: LoopbackCloud,
}

impl NetworkLink for LoopbackLink {
    fn is_up(&self) -> bool {
        self.cloud.lock().link_up
    }

    fn begin(&mut self) {
        self.cloud.lock().link_begins += 1;
    }

    fn poll_link(&mut self) -> nb::Result<(), LinkError> {
        let mut inner = self.cloud.lock();
        if inner.link_available {
            inner.link_up = true;
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }
}
