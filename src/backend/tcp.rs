use crate::connection::{LinkError, NetworkLink};
use crate::ota::FirmwareSlot;
use crate::protocol::{decode_cloud, CloudFrame, DeviceFrame, FrameCodec, ProtocolError};
use crate::session::{
    CloudSession, FirmwareIdentity, FirmwareTransfer, RequestId, SessionError, SessionEvent, TelemetryEntry,
    TransferEvent, UpdateRequest,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lowercase hex SHA-256 of an image.
pub fn image_digest(image: &[u8]) -> String {
    Sha256::digest(image)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Reports from the socket task.
#[derive(Debug)]
enum Inbound {
    Frame(CloudFrame),
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPhase {
    Closed,
    Connecting,
    Open,
}

/// Subscription sent and waiting for its acknowledgement.
#[derive(Debug, Clone, Copy)]
struct PendingAck {
    what: &'static str,
    accepted: Option<bool>,
}

#[derive(Debug)]
struct Download {
    identity: FirmwareIdentity,
    size: u32,
    expected_sha256: String,
    image: Vec<u8>,
    next_index: u32,
    retry_budget: u8,
    retries_remaining: u8,
    requested_at: Instant,
}

#[derive(Debug)]
struct Connection {
    phase: LinkPhase,
    target: Option<(String, u16)>,
    outbound: Option<UnboundedSender<String>>,
    inbound: Option<UnboundedReceiver<Inbound>>,
    connect_answer: Option<bool>,
    pending_ack: Option<PendingAck>,
    codec: FrameCodec,
    session_events: VecDeque<SessionEvent>,
    transfer_events: VecDeque<TransferEvent>,
    awaiting_offer: Option<UpdateRequest>,
    download: Option<Download>,
    next_request_id: RequestId,
    slot: Arc<FirmwareSlot>,
}

/// Owns the socket: writes queued lines and forwards decoded frames. Ends
/// once the adapter drops its sender or the gateway goes away.
async fn run_socket(
    server: String,
    port: u16,
    mut outbound: UnboundedReceiver<String>,
    inbound: UnboundedSender<Inbound>,
) {
    let stream = match time::timeout(CONNECT_TIMEOUT, TcpStream::connect((server.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("TCP connect to {}:{} failed: {}", server, port, e);
            let _ = inbound.send(Inbound::Closed(e.to_string()));
            return;
        }
        Err(_) => {
            let _ = inbound.send(Inbound::Closed("connect timed out".to_string()));
            return;
        }
    };
    // Best effort; small frames only
    let _ = stream.set_nodelay(true);

    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        let _ = inbound.send(Inbound::Closed("gateway closed the connection".to_string()));
                        break;
                    }
                    Err(e) => {
                        let _ = inbound.send(Inbound::Closed(e.to_string()));
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match decode_cloud(&line) {
                    Ok(frame) => {
                        if inbound.send(Inbound::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping gateway frame: {}", e),
                }
            }
            queued = outbound.recv() => match queued {
                Some(line) => {
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        let _ = inbound.send(Inbound::Closed(e.to_string()));
                        break;
                    }
                }
                None => {
                    // Adapter closed the session; queued lines are already out
                    let _ = writer.shutdown().await;
                    break;
                }
            }
        }
    }
}

fn transport_error(error: impl std::fmt::Display) -> SessionError {
    SessionError::Transport(error.to_string())
}

fn protocol_error(error: ProtocolError) -> SessionError {
    match error {
        ProtocolError::MessageTooLarge { limit, .. } => SessionError::MessageTooLarge { limit },
        other => transport_error(other),
    }
}

impl Connection {
    fn targets(&self, server: &str, port: u16) -> bool {
        self.target
            .as_ref()
            .is_some_and(|(s, p)| s == server && *p == port)
    }

    /// Spawns the socket task with the connect frame already queued.
    fn open(&mut self, server: &str, token: &str, port: u16) -> Result<(), SessionError> {
        self.close();

        let runtime = Handle::try_current().map_err(transport_error)?;
        let hello = self
            .codec
            .encode_device(&DeviceFrame::Connect {
                token: token.to_string(),
            })
            .map_err(protocol_error)?
            .to_string();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        outbound.send(hello).map_err(transport_error)?;
        runtime.spawn(run_socket(server.to_string(), port, outbound_rx, inbound_tx));

        self.outbound = Some(outbound);
        self.inbound = Some(inbound);
        self.target = Some((server.to_string(), port));
        self.phase = LinkPhase::Connecting;
        Ok(())
    }

    fn poll_connect(&mut self, server: &str, token: &str, port: u16) -> nb::Result<(), SessionError> {
        let refused = || {
            nb::Error::Other(SessionError::ConnectRefused {
                server: server.to_string(),
                port,
            })
        };

        if !self.targets(server, port) || self.phase == LinkPhase::Closed {
            self.open(server, token, port)?;
            return Err(nb::Error::WouldBlock);
        }
        if self.phase == LinkPhase::Open {
            return Ok(());
        }

        self.pump();
        if self.phase == LinkPhase::Closed {
            return Err(refused());
        }
        match self.connect_answer.take() {
            Some(true) => {
                info!("Gateway session open at {}:{}", server, port);
                self.phase = LinkPhase::Open;
                Ok(())
            }
            Some(false) => {
                self.close();
                Err(refused())
            }
            None => Err(nb::Error::WouldBlock),
        }
    }

    fn send(&mut self, frame: &DeviceFrame) -> Result<(), SessionError> {
        if self.phase != LinkPhase::Open {
            return Err(SessionError::NotConnected);
        }
        let line = self.codec.encode_device(frame).map_err(protocol_error)?.to_string();
        let outbound = self.outbound.as_ref().ok_or(SessionError::NotConnected)?;
        if outbound.send(line).is_err() {
            self.close();
            return Err(transport_error("gateway connection ended"));
        }
        Ok(())
    }

    fn pump(&mut self) {
        loop {
            let received = match self.inbound.as_mut() {
                Some(rx) => rx.try_recv(),
                None => return,
            };
            match received {
                Ok(Inbound::Frame(frame)) => self.route(frame),
                Ok(Inbound::Closed(reason)) => {
                    warn!("Gateway connection closed: {}", reason);
                    self.close();
                    return;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Gateway connection ended");
                    self.close();
                    return;
                }
            }
        }

        let stalled_chunk = self
            .download
            .as_ref()
            .filter(|download| download.requested_at.elapsed() >= CHUNK_TIMEOUT)
            .map(|download| download.next_index);
        if let Some(index) = stalled_chunk {
            debug!(index, "Chunk request timed out");
            self.retry_chunk(index);
        }
    }

    fn route(&mut self, frame: CloudFrame) {
        match frame {
            CloudFrame::Rpc {
                request_id,
                method,
                params,
            } => self.session_events.push_back(SessionEvent::Command {
                request_id,
                method,
                params,
            }),
            CloudFrame::SharedAttributes { attributes } => {
                self.session_events
                    .push_back(SessionEvent::SharedAttributes(attributes));
            }
            CloudFrame::AttributeResponse {
                request_id,
                attributes,
            } => self.session_events.push_back(SessionEvent::AttributeResponse {
                request_id,
                attributes,
            }),
            CloudFrame::FirmwareUpToDate => {
                if self.awaiting_offer.take().is_some() {
                    self.transfer_events.push_back(TransferEvent::UpToDate);
                }
            }
            CloudFrame::FirmwareAvailable {
                title,
                version,
                size,
                sha256,
            } => self.start_download(FirmwareIdentity::new(title, version), size, sha256),
            CloudFrame::Chunk { index, data } => self.accept_chunk(index, &data),
            CloudFrame::ChunkError { index } => self.retry_chunk(index),
            CloudFrame::ConnectAck { accepted } => {
                if self.phase == LinkPhase::Connecting {
                    self.connect_answer = Some(accepted);
                } else {
                    debug!("Ignoring unsolicited connect acknowledgement");
                }
            }
            CloudFrame::SubscribeAck { accepted } => match self.pending_ack.as_mut() {
                Some(pending) if pending.accepted.is_none() => pending.accepted = Some(accepted),
                _ => debug!("Ignoring unsolicited subscribe acknowledgement"),
            },
        }
    }

    fn start_download(&mut self, identity: FirmwareIdentity, size: u32, sha256: String) {
        let request = match self.awaiting_offer.take() {
            Some(request) => request,
            None => {
                debug!("Ignoring firmware offer without a pending request");
                return;
            }
        };

        if identity == request.identity {
            self.transfer_events.push_back(TransferEvent::UpToDate);
            return;
        }

        info!("Firmware {} offered, {} bytes", identity, size);
        self.transfer_events
            .push_back(TransferEvent::Starting { total_bytes: size });

        if size == 0 {
            self.transfer_events
                .push_back(TransferEvent::Finished { success: false });
            return;
        }

        self.download = Some(Download {
            identity,
            size,
            expected_sha256: sha256,
            image: Vec::with_capacity(size as usize),
            next_index: 0,
            retry_budget: request.retry_budget,
            retries_remaining: request.retry_budget,
            requested_at: Instant::now(),
        });
        self.request_chunk(0);
    }

    fn request_chunk(&mut self, index: u32) {
        if let Err(error) = self.send(&DeviceFrame::ChunkRequest { index }) {
            warn!("Failed to request chunk {}: {}", index, error);
            self.abort_download();
            return;
        }
        if let Some(download) = self.download.as_mut() {
            download.requested_at = Instant::now();
        }
    }

    fn accept_chunk(&mut self, index: u32, data: &[u8]) {
        let progress = match self.download.as_mut() {
            Some(download) if download.next_index == index => {
                if data.is_empty() {
                    None
                } else {
                    download.image.extend_from_slice(data);
                    download.next_index += 1;
                    download.retries_remaining = download.retry_budget;
                    Some((download.image.len() as u32, download.size))
                }
            }
            Some(_) => {
                debug!(index, "Ignoring out-of-order chunk");
                return;
            }
            None => return,
        };

        // The download finishes on the last byte, so an empty chunk is always short
        let Some((received, total)) = progress else {
            debug!(index, "Empty chunk before the end of the image");
            self.retry_chunk(index);
            return;
        };

        self.transfer_events.push_back(TransferEvent::Progress {
            received: received.min(total),
            total,
        });

        if received >= total {
            self.finish_download();
        } else {
            self.request_chunk(index + 1);
        }
    }

    fn retry_chunk(&mut self, index: u32) {
        let remaining = match self.download.as_mut() {
            Some(download) if download.retries_remaining > 0 => {
                download.retries_remaining -= 1;
                Some(download.retries_remaining)
            }
            Some(_) => None,
            None => return,
        };

        let Some(remaining) = remaining else {
            warn!("Chunk {} failed with no retries left", index);
            self.abort_download();
            return;
        };

        self.transfer_events
            .push_back(TransferEvent::ChunkRetry { retries_remaining: remaining });
        self.request_chunk(index);
    }

    fn finish_download(&mut self) {
        let download = match self.download.take() {
            Some(download) => download,
            None => return,
        };

        let digest = image_digest(&download.image);
        let intact = download.image.len() == download.size as usize
            && digest.eq_ignore_ascii_case(&download.expected_sha256);

        if intact {
            self.slot.install(download.identity);
            self.transfer_events
                .push_back(TransferEvent::Finished { success: true });
        } else {
            warn!("Firmware image failed verification");
            self.transfer_events
                .push_back(TransferEvent::Finished { success: false });
        }
    }

    fn abort_download(&mut self) {
        if self.download.take().is_some() {
            self.transfer_events
                .push_back(TransferEvent::Finished { success: false });
        }
    }

    fn close(&mut self) {
        // Dropping the sender ends the socket task after the queued lines
        self.outbound = None;
        self.inbound = None;
        self.phase = LinkPhase::Closed;
        self.target = None;
        self.connect_answer = None;
        self.pending_ack = None;
        self.session_events.clear();
        self.awaiting_offer = None;
        self.abort_download();
    }
}

/// Adapter for the gateway's line-delimited JSON protocol.
///
/// Socket I/O runs on a spawned tokio task; the session and transfer
/// handles only exchange queued lines and frames with it, so none of their
/// calls wait on the network.
#[derive(Debug, Clone)]
pub struct TcpCloud {
    inner: Arc<Mutex<Connection>>,
}

impl TcpCloud {
    pub fn new(max_message_size: usize, slot: Arc<FirmwareSlot>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Connection {
                phase: LinkPhase::Closed,
                target: None,
                outbound: None,
                inbound: None,
                connect_answer: None,
                pending_ack: None,
                codec: FrameCodec::new(max_message_size),
                session_events: VecDeque::new(),
                transfer_events: VecDeque::new(),
                awaiting_offer: None,
                download: None,
                next_request_id: 1,
                slot,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> TcpSession {
        TcpSession { cloud: self.clone() }
    }

    pub fn transfer(&self) -> TcpTransfer {
        TcpTransfer { cloud: self.clone() }
    }
}

#[derive(Debug, Clone)]
pub struct TcpSession {
    cloud: TcpCloud,
}

impl TcpSession {
    fn subscribe(&mut self, frame: DeviceFrame, what: &'static str) -> nb::Result<(), SessionError> {
        let mut conn = self.cloud.lock();
        conn.pump();
        if conn.phase != LinkPhase::Open {
            return Err(nb::Error::Other(SessionError::NotConnected));
        }

        match conn.pending_ack.take() {
            Some(PendingAck {
                what: pending,
                accepted: Some(accepted),
            }) if pending == what => {
                return if accepted {
                    Ok(())
                } else {
                    Err(nb::Error::Other(SessionError::SubscriptionRejected(what)))
                };
            }
            Some(pending) if pending.what == what => {
                conn.pending_ack = Some(pending);
                return Err(nb::Error::WouldBlock);
            }
            _ => {}
        }

        conn.send(&frame)?;
        conn.pending_ack = Some(PendingAck { what, accepted: None });
        Err(nb::Error::WouldBlock)
    }
}

impl CloudSession for TcpSession {
    fn connect(&mut self, server: &str, credential: &str, port: u16) -> nb::Result<(), SessionError> {
        self.cloud.lock().poll_connect(server, credential, port)
    }

    fn connected(&self) -> bool {
        let mut conn = self.cloud.lock();
        conn.pump();
        conn.phase == LinkPhase::Open
    }

    fn disconnect(&mut self) {
        let mut conn = self.cloud.lock();
        if conn.phase == LinkPhase::Open {
            // The socket is closed right after, a lost goodbye is harmless
            let _ = conn.send(&DeviceFrame::Disconnect);
        }
        conn.close();
    }

    fn send_telemetry(&mut self, entries: &[TelemetryEntry]) -> Result<(), SessionError> {
        self.cloud.lock().send(&DeviceFrame::telemetry(entries))
    }

    fn send_attribute(&mut self, key: &str, value: Value) -> Result<(), SessionError> {
        self.cloud.lock().send(&DeviceFrame::Attribute {
            key: key.to_string(),
            value,
        })
    }

    fn subscribe_commands(&mut self, methods: &[&'static str]) -> nb::Result<(), SessionError> {
        let frame = DeviceFrame::SubscribeRpc {
            methods: methods.iter().map(|m| m.to_string()).collect(),
        };
        self.subscribe(frame, "rpc")
    }

    fn subscribe_shared_attributes(&mut self, names: &[&'static str]) -> nb::Result<(), SessionError> {
        let frame = DeviceFrame::SubscribeAttributes {
            names: names.iter().map(|n| n.to_string()).collect(),
        };
        self.subscribe(frame, "shared attributes")
    }

    fn request_shared_attributes(&mut self, names: &[&'static str]) -> Result<RequestId, SessionError> {
        let mut conn = self.cloud.lock();
        let request_id = conn.next_request_id;
        conn.next_request_id = conn.next_request_id.wrapping_add(1);
        conn.send(&DeviceFrame::AttributeRequest {
            request_id,
            names: names.iter().map(|n| n.to_string()).collect(),
        })
        .map_err(|_| SessionError::RequestRejected)?;
        Ok(request_id)
    }

    fn respond_command(&mut self, request_id: RequestId, response: Value) -> Result<(), SessionError> {
        self.cloud
            .lock()
            .send(&DeviceFrame::RpcResponse { request_id, response })
    }

    fn poll(&mut self) -> Vec<SessionEvent> {
        let mut conn = self.cloud.lock();
        conn.pump();
        conn.session_events.drain(..).collect()
    }
}

#[derive(Debug, Clone)]
pub struct TcpTransfer {
    cloud: TcpCloud,
}

impl FirmwareTransfer for TcpTransfer {
    fn announce(&mut self, identity: &FirmwareIdentity) -> Result<(), SessionError> {
        self.cloud.lock().send(&DeviceFrame::FirmwareInfo {
            title: identity.title.clone(),
            version: identity.version.clone(),
        })
    }

    fn request_update(&mut self, request: &UpdateRequest) -> Result<(), SessionError> {
        let mut conn = self.cloud.lock();
        conn.send(&DeviceFrame::FirmwareRequest {
            title: request.identity.title.clone(),
            version: request.identity.version.clone(),
            chunk_size: request.chunk_size,
        })?;
        conn.awaiting_offer = Some(request.clone());
        Ok(())
    }

    fn poll_transfer(&mut self) -> Vec<TransferEvent> {
        let mut conn = self.cloud.lock();
        conn.pump();
        conn.transfer_events.drain(..).collect()
    }

    fn cancel_update(&mut self) {
        let mut conn = self.cloud.lock();
        let pending = conn.awaiting_offer.take().is_some();
        let downloading = conn.download.take().is_some();
        if (pending || downloading) && conn.phase == LinkPhase::Open {
            let _ = conn.send(&DeviceFrame::FirmwareCancel);
        }
    }
}

/// Network link of a host whose interfaces are managed by the OS.
#[derive(Debug, Default)]
pub struct HostLink {
    up: bool,
}

impl HostLink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NetworkLink for HostLink {
    fn is_up(&self) -> bool {
        self.up
    }

    fn begin(&mut self) {}

    fn poll_link(&mut self) -> nb::Result<(), LinkError> {
        self.up = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_slot() -> Arc<FirmwareSlot> {
        Arc::new(FirmwareSlot::new())
    }

    fn downloading(cloud: &TcpCloud, size: u32) {
        let mut conn = cloud.lock();
        conn.download = Some(Download {
            identity: FirmwareIdentity::new("DA_TTNT", "2.0.0"),
            size,
            expected_sha256: String::new(),
            image: Vec::new(),
            next_index: 0,
            retry_budget: 2,
            retries_remaining: 2,
            requested_at: Instant::now(),
        });
    }

    #[test]
    fn test_image_digest_is_lower_hex() {
        let digest = image_digest(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_send_without_connection_fails() {
        let cloud = TcpCloud::new(512, test_slot());
        let mut session = cloud.session();
        assert!(!session.connected());
        assert_eq!(
            session.send_attribute("sharedvalueFan", Value::Bool(true)),
            Err(SessionError::NotConnected)
        );
        assert!(session.poll().is_empty());
    }

    #[test]
    fn test_connect_outside_runtime_is_an_error() {
        let cloud = TcpCloud::new(512, test_slot());
        let mut session = cloud.session();
        assert!(matches!(
            session.connect("127.0.0.1", "token", 1883),
            Err(nb::Error::Other(SessionError::Transport(_)))
        ));
    }

    #[test]
    fn test_empty_chunk_counts_as_retry() {
        let cloud = TcpCloud::new(512, test_slot());
        downloading(&cloud, 100);

        let mut conn = cloud.lock();
        conn.accept_chunk(0, &[]);

        // No progress; the re-request fails offline and ends the download
        assert_eq!(
            conn.transfer_events.drain(..).collect::<Vec<_>>(),
            vec![
                TransferEvent::ChunkRetry { retries_remaining: 1 },
                TransferEvent::Finished { success: false },
            ]
        );
        assert!(conn.download.is_none());
    }

    #[test]
    fn test_empty_chunk_without_retries_aborts() {
        let cloud = TcpCloud::new(512, test_slot());
        downloading(&cloud, 100);

        let mut conn = cloud.lock();
        if let Some(download) = conn.download.as_mut() {
            download.retries_remaining = 0;
        }
        conn.accept_chunk(0, &[]);
        assert_eq!(
            conn.transfer_events.drain(..).collect::<Vec<_>>(),
            vec![TransferEvent::Finished { success: false }]
        );
    }
}
