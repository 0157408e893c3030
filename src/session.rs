//! Cloud session and firmware transfer contracts.
//!
//! The coordinator never talks to a transport directly. Every backend (the
//! in-process loopback used by tests and `--simulate`, or the TCP adapter
//! that speaks to the gateway) implements these two traits, so the
//! connection, actuator, telemetry and OTA logic is written once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub type RequestId = u32;
pub type AttributeMap = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,
    #[error("session connect to {server}:{port} refused")]
    ConnectRefused { server: String, port: u16 },
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(&'static str),
    #[error("request could not be issued")]
    RequestRejected,
    #[error("message exceeds {limit} bytes")]
    MessageTooLarge { limit: usize },
    #[error("transport error: {0}")]
    Transport(String),
}

/// A telemetry value as it appears on the wire: a number or an actuator flag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Number(f32),
    Flag(bool),
}

impl TelemetryValue {
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            TelemetryValue::Number(v) => Some(*v),
            TelemetryValue::Flag(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TelemetryValue::Flag(b) => Some(*b),
            TelemetryValue::Number(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryEntry {
    pub key: &'static str,
    pub value: TelemetryValue,
}

impl TelemetryEntry {
    pub fn number(key: &'static str, value: f32) -> Self {
        Self {
            key,
            value: TelemetryValue::Number(value),
        }
    }

    pub fn flag(key: &'static str, value: bool) -> Self {
        Self {
            key,
            value: TelemetryValue::Flag(value),
        }
    }
}

/// Title and version of a firmware image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareIdentity {
    pub title: String,
    pub version: String,
}

impl FirmwareIdentity {
    pub fn new(title: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for FirmwareIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.title, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest {
    pub identity: FirmwareIdentity,
    /// Retries allowed per chunk before the transfer is abandoned
    pub retry_budget: u8,
    pub chunk_size: u16,
}

/// Inbound traffic surfaced by [`CloudSession::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Remote procedure call; the reply goes back through `respond_command`.
    Command {
        request_id: RequestId,
        method: String,
        params: Value,
    },
    /// Shared attribute push. `None` when the payload was null.
    SharedAttributes(Option<AttributeMap>),
    /// Answer to a previous `request_shared_attributes`.
    AttributeResponse {
        request_id: RequestId,
        attributes: Option<AttributeMap>,
    },
}

/// Progress notifications from a firmware transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// No newer firmware is assigned to this device.
    UpToDate,
    Starting { total_bytes: u32 },
    Progress { received: u32, total: u32 },
    ChunkRetry { retries_remaining: u8 },
    Finished { success: bool },
}

/// Authenticated channel to the cloud service.
///
/// Implementations must be driven from one task at a time; `poll` is the
/// cooperative point where inbound traffic is collected.
///
/// `connect` and the two subscriptions wait on an answer from the remote
/// side. They return `WouldBlock` until it arrives and are called again with
/// the same arguments; the caller owns the timeout and abandons a pending
/// operation with `disconnect`.
pub trait CloudSession: Send {
    fn connect(&mut self, server: &str, credential: &str, port: u16) -> nb::Result<(), SessionError>;
    fn connected(&self) -> bool;
    fn disconnect(&mut self);

    /// Publishes all entries as one message.
    fn send_telemetry(&mut self, entries: &[TelemetryEntry]) -> Result<(), SessionError>;
    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError>;

    fn subscribe_commands(&mut self, methods: &[&'static str]) -> nb::Result<(), SessionError>;
    fn subscribe_shared_attributes(&mut self, names: &[&'static str]) -> nb::Result<(), SessionError>;
    fn request_shared_attributes(&mut self, names: &[&'static str]) -> Result<RequestId, SessionError>;
    fn respond_command(&mut self, request_id: RequestId, response: Value) -> Result<(), SessionError>;

    fn poll(&mut self) -> Vec<SessionEvent>;
}

/// Firmware update channel layered on the same session.
pub trait FirmwareTransfer: Send {
    fn announce(&mut self, identity: &FirmwareIdentity) -> Result<(), SessionError>;
    fn request_update(&mut self, request: &UpdateRequest) -> Result<(), SessionError>;
    fn poll_transfer(&mut self) -> Vec<TransferEvent>;
    fn cancel_update(&mut self);
}
