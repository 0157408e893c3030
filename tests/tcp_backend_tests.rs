use cloudnode::backend::tcp::image_digest;
use cloudnode::backend::TcpCloud;
use cloudnode::lifecycle::{TaskGate, TaskLifecycle};
use cloudnode::ota::{FirmwareSlot, OtaCoordinator, OtaPhase, OtaSettings, OtaStatus, FIRMWARE_TITLE};
use cloudnode::protocol::{decode_device, encode_cloud, CloudFrame, DeviceFrame};
use cloudnode::session::*;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time;

const CHUNK_SIZE: u16 = 1024;

struct Image {
    data: Vec<u8>,
    sha256: String,
}

impl Image {
    fn new(size: usize) -> Self {
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let sha256 = image_digest(&data);
        Self { data, sha256 }
    }
}

/// Minimal gateway serving one device connection, returning every frame it
/// received once the device disconnects. `offer_delay` holds back the
/// answer to a firmware request.
async fn spawn_gateway(image: Image, offer_delay: Duration) -> (u16, JoinHandle<Vec<DeviceFrame>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let mut received = Vec::new();
        let mut chunk_size = 0usize;
        while let Ok(Some(line)) = lines.next_line().await {
            let frame = decode_device(&line).unwrap();
            let mut replies = Vec::new();
            match &frame {
                DeviceFrame::Connect { .. } => replies.push(CloudFrame::ConnectAck { accepted: true }),
                DeviceFrame::SubscribeRpc { .. } => {
                    replies.push(CloudFrame::SubscribeAck { accepted: true });
                    replies.push(CloudFrame::Rpc {
                        request_id: 7,
                        method: "setValueLight".to_string(),
                        params: json!(true),
                    });
                }
                DeviceFrame::SubscribeAttributes { .. } => replies.push(CloudFrame::SubscribeAck { accepted: true }),
                DeviceFrame::FirmwareRequest { chunk_size: size, .. } => {
                    chunk_size = usize::from(*size);
                    if !offer_delay.is_zero() {
                        time::sleep(offer_delay).await;
                    }
                    replies.push(CloudFrame::FirmwareAvailable {
                        title: FIRMWARE_TITLE.to_string(),
                        version: "2.0.0".to_string(),
                        size: image.data.len() as u32,
                        sha256: image.sha256.clone(),
                    });
                }
                DeviceFrame::ChunkRequest { index } => {
                    let start = *index as usize * chunk_size;
                    let end = (start + chunk_size).min(image.data.len());
                    replies.push(CloudFrame::Chunk {
                        index: *index,
                        data: image.data[start..end].to_vec(),
                    });
                }
                _ => {}
            }
            for reply in replies {
                // The device may already be gone
                let _ = writer.write_all(encode_cloud(&reply).unwrap().as_bytes()).await;
            }

            let done = matches!(frame, DeviceFrame::Disconnect);
            received.push(frame);
            if done {
                break;
            }
        }
        received
    });

    (port, handle)
}

/// Polls a non-blocking session call until the gateway has answered.
async fn settle<T>(mut op: impl FnMut() -> nb::Result<T, SessionError>) -> Result<T, SessionError> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(nb::Error::Other(error)) => return Err(error),
            Err(nb::Error::WouldBlock) => {
                assert!(Instant::now() < deadline, "gateway never answered");
                time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn drain_until_finished(transfer: &mut dyn FirmwareTransfer) -> Vec<TransferEvent> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut events = Vec::new();
    while Instant::now() < deadline {
        events.extend(transfer.poll_transfer());
        if events.iter().any(|event| matches!(event, TransferEvent::Finished { .. })) {
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    events
}

fn update_request() -> UpdateRequest {
    UpdateRequest {
        identity: FirmwareIdentity::new(FIRMWARE_TITLE, "1.0.0"),
        retry_budget: 3,
        chunk_size: CHUNK_SIZE,
    }
}

#[tokio::test]
async fn test_session_handshake_and_command_delivery() {
    let (port, gateway) = spawn_gateway(Image::new(0), Duration::ZERO).await;
    let cloud = TcpCloud::new(512, Arc::new(FirmwareSlot::new()));
    let mut session = cloud.session();

    // Nothing waits on the network; the first call only starts the connect
    assert!(matches!(
        session.connect("127.0.0.1", "device-token", port),
        Err(nb::Error::WouldBlock)
    ));
    settle(|| session.connect("127.0.0.1", "device-token", port))
        .await
        .unwrap();
    assert!(session.connected());

    assert!(matches!(
        session.subscribe_commands(&["setValueFan", "setValueLight"]),
        Err(nb::Error::WouldBlock)
    ));
    settle(|| session.subscribe_commands(&["setValueFan", "setValueLight"]))
        .await
        .unwrap();
    settle(|| session.subscribe_shared_attributes(&["sharedvalueFan", "sharedvalueLight"]))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    while events.is_empty() && Instant::now() < deadline {
        events = session.poll();
        time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        events,
        vec![SessionEvent::Command {
            request_id: 7,
            method: "setValueLight".to_string(),
            params: json!(true),
        }]
    );

    session.respond_command(7, json!({ "newLightState": true })).unwrap();
    session.send_telemetry(&[TelemetryEntry::number("temperature", 26.5)]).unwrap();
    session.disconnect();
    assert!(!session.connected());

    let frames = gateway.await.unwrap();
    assert_eq!(
        frames[0],
        DeviceFrame::Connect {
            token: "device-token".to_string()
        }
    );
    // Each subscription was sent once despite the repeated polls
    assert_eq!(
        frames
            .iter()
            .filter(|frame| matches!(frame, DeviceFrame::SubscribeRpc { .. }))
            .count(),
        1
    );
    assert!(frames.contains(&DeviceFrame::RpcResponse {
        request_id: 7,
        response: json!({ "newLightState": true }),
    }));
    assert!(frames
        .iter()
        .any(|frame| matches!(frame, DeviceFrame::Telemetry { values } if values.contains_key("temperature"))));
    assert_eq!(frames.last(), Some(&DeviceFrame::Disconnect));
}

#[tokio::test]
async fn test_firmware_download_installs_verified_image() {
    let (port, gateway) = spawn_gateway(Image::new(3000), Duration::ZERO).await;
    let slot = Arc::new(FirmwareSlot::new());
    let cloud = TcpCloud::new(512, Arc::clone(&slot));
    let mut session = cloud.session();
    let mut transfer = cloud.transfer();

    settle(|| session.connect("127.0.0.1", "device-token", port))
        .await
        .unwrap();
    transfer.announce(&update_request().identity).unwrap();
    transfer.request_update(&update_request()).unwrap();

    let events = drain_until_finished(&mut transfer).await;
    assert_eq!(events.first(), Some(&TransferEvent::Starting { total_bytes: 3000 }));
    assert_eq!(events.last(), Some(&TransferEvent::Finished { success: true }));
    assert!(events.contains(&TransferEvent::Progress {
        received: 3000,
        total: 3000
    }));
    assert_eq!(
        slot.installed(),
        Some(FirmwareIdentity::new(FIRMWARE_TITLE, "2.0.0"))
    );

    session.disconnect();
    let frames = gateway.await.unwrap();
    let chunk_requests = frames
        .iter()
        .filter(|frame| matches!(frame, DeviceFrame::ChunkRequest { .. }))
        .count();
    assert_eq!(chunk_requests, 3);
}

#[tokio::test]
async fn test_corrupt_image_is_not_installed() {
    let mut image = Image::new(2048);
    image.sha256 = image_digest(b"something else");
    let (port, gateway) = spawn_gateway(image, Duration::ZERO).await;
    let slot = Arc::new(FirmwareSlot::new());
    let cloud = TcpCloud::new(512, Arc::clone(&slot));
    let mut session = cloud.session();
    let mut transfer = cloud.transfer();

    settle(|| session.connect("127.0.0.1", "device-token", port))
        .await
        .unwrap();
    transfer.request_update(&update_request()).unwrap();

    let events = drain_until_finished(&mut transfer).await;
    assert_eq!(events.last(), Some(&TransferEvent::Finished { success: false }));
    assert!(slot.installed().is_none());

    session.disconnect();
    gateway.await.unwrap();
}

#[tokio::test]
async fn test_late_offer_after_timeout_is_not_downloaded() {
    let (port, gateway) = spawn_gateway(Image::new(3000), Duration::from_millis(300)).await;
    let slot = Arc::new(FirmwareSlot::new());
    let cloud = TcpCloud::new(512, Arc::clone(&slot));
    let mut session = cloud.session();
    let mut transfer = cloud.transfer();
    settle(|| session.connect("127.0.0.1", "device-token", port))
        .await
        .unwrap();

    let settings = OtaSettings {
        identity: FirmwareIdentity::new(FIRMWARE_TITLE, "1.0.0"),
        chunk_size: CHUNK_SIZE,
        ..OtaSettings::default()
    };
    let mut coordinator = OtaCoordinator::new(settings, Arc::new(OtaStatus::new()));
    let sensor = Arc::new(TaskGate::new("sensor"));
    coordinator.supervise(Arc::clone(&sensor) as Arc<dyn TaskLifecycle>);

    coordinator.step(0, true, &mut transfer);
    assert_eq!(coordinator.phase(), OtaPhase::UpdateRequested);
    assert!(sensor.is_paused());

    // Response window runs out before the gateway answers
    coordinator.step(10_000, true, &mut transfer);
    assert_eq!(coordinator.phase(), OtaPhase::Idle);
    assert!(!sensor.is_paused());

    for tick in 1..=100u64 {
        assert_eq!(coordinator.step(10_000 + tick * 20, true, &mut transfer), None);
        time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.phase(), OtaPhase::Idle);
    assert!(!sensor.is_paused());
    assert!(slot.installed().is_none());
    assert_eq!(coordinator.stats().downloads_started, 0);

    session.disconnect();
    let frames = gateway.await.unwrap();
    assert!(frames.contains(&DeviceFrame::FirmwareCancel));
    assert!(!frames
        .iter()
        .any(|frame| matches!(frame, DeviceFrame::ChunkRequest { .. })));
}

#[tokio::test]
async fn test_connect_refused_without_gateway() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let cloud = TcpCloud::new(512, Arc::new(FirmwareSlot::new()));
    let mut session = cloud.session();
    assert!(matches!(
        settle(|| session.connect("127.0.0.1", "device-token", port)).await,
        Err(SessionError::ConnectRefused { .. })
    ));
    assert!(!session.connected());
    assert_eq!(
        session.send_attribute("sharedvalueFan", json!(true)),
        Err(SessionError::NotConnected)
    );
}
