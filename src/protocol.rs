//! Wire frames between a device and the gateway: one JSON object per line.

use crate::session::{AttributeMap, RequestId, TelemetryEntry};
use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Hard ceiling for a device frame; the configured limit may be lower.
pub const MAX_DEVICE_FRAME_SIZE: usize = 1024;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 512;
/// Gateway frames carry firmware chunks and are allowed to be larger.
pub const MAX_CLOUD_FRAME_SIZE: usize = 64 * 1024;

pub type DeviceFrameBuffer = ArrayString<MAX_DEVICE_FRAME_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame")]
    InvalidJson,
    #[error("frame of {size} bytes exceeds {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("serialization failed")]
    SerializationError,
}

/// Frames sent by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceFrame {
    Connect { token: String },
    Disconnect,
    Telemetry { values: Map<String, Value> },
    Attribute { key: String, value: Value },
    SubscribeRpc { methods: Vec<String> },
    SubscribeAttributes { names: Vec<String> },
    AttributeRequest { request_id: RequestId, names: Vec<String> },
    RpcResponse { request_id: RequestId, response: Value },
    FirmwareInfo { title: String, version: String },
    FirmwareRequest { title: String, version: String, chunk_size: u16 },
    ChunkRequest { index: u32 },
    FirmwareCancel,
}

impl DeviceFrame {
    pub fn telemetry(entries: &[TelemetryEntry]) -> Self {
        let values = entries
            .iter()
            .map(|entry| {
                let value = serde_json::to_value(entry.value).unwrap_or(Value::Null);
                (entry.key.to_string(), value)
            })
            .collect();
        DeviceFrame::Telemetry { values }
    }
}

/// Frames sent by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudFrame {
    ConnectAck { accepted: bool },
    SubscribeAck { accepted: bool },
    Rpc { request_id: RequestId, method: String, params: Value },
    SharedAttributes { attributes: Option<AttributeMap> },
    AttributeResponse { request_id: RequestId, attributes: Option<AttributeMap> },
    FirmwareAvailable { title: String, version: String, size: u32, sha256: String },
    FirmwareUpToDate,
    Chunk {
        index: u32,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    ChunkError { index: u32 },
}

/// Bounded encoder for device frames.
#[derive(Debug)]
pub struct FrameCodec {
    limit: usize,
    buffer: DeviceFrameBuffer,
}

impl FrameCodec {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.min(MAX_DEVICE_FRAME_SIZE),
            buffer: ArrayString::new(),
        }
    }

    /// Serializes a device frame, newline terminated.
    pub fn encode_device(&mut self, frame: &DeviceFrame) -> Result<&str, ProtocolError> {
        self.buffer.clear();

        let json = serde_json::to_string(frame).map_err(|_| ProtocolError::SerializationError)?;
        if json.len() + 1 > self.limit {
            return Err(ProtocolError::MessageTooLarge {
                size: json.len() + 1,
                limit: self.limit,
            });
        }
        self.buffer.push_str(&json);
        self.buffer.push('\n');

        Ok(&self.buffer)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

pub fn decode_device(line: &str) -> Result<DeviceFrame, ProtocolError> {
    if line.len() > MAX_DEVICE_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            limit: MAX_DEVICE_FRAME_SIZE,
        });
    }
    serde_json::from_str(line.trim()).map_err(|_| ProtocolError::InvalidJson)
}

pub fn encode_cloud(frame: &CloudFrame) -> Result<String, ProtocolError> {
    let mut json = serde_json::to_string(frame).map_err(|_| ProtocolError::SerializationError)?;
    if json.len() + 1 > MAX_CLOUD_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len() + 1,
            limit: MAX_CLOUD_FRAME_SIZE,
        });
    }
    json.push('\n');
    Ok(json)
}

pub fn decode_cloud(line: &str) -> Result<CloudFrame, ProtocolError> {
    if line.len() > MAX_CLOUD_FRAME_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: line.len(),
            limit: MAX_CLOUD_FRAME_SIZE,
        });
    }
    serde_json::from_str(line.trim()).map_err(|_| ProtocolError::InvalidJson)
}
