use clap::{App, Arg};
use cloudnode::actuator::{Output, SET_FAN_METHOD, SET_LIGHT_METHOD};
use cloudnode::backend::tcp::image_digest;
use cloudnode::protocol::{decode_device, encode_cloud, CloudFrame, DeviceFrame};
use cloudnode::session::{AttributeMap, RequestId};
use colored::*;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

const DEFAULT_PORT: &str = "1883";
const CONSOLE_BROADCAST_BUFFER_SIZE: usize = 64;
const CLIENT_OUTBOX_SIZE: usize = 256;

struct FirmwareImage {
    title: String,
    version: String,
    sha256: String,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Deterministic synthetic image so repeated offers verify identically.
    fn synthetic(title: &str, version: &str, size: usize) -> Self {
        let seed = version.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
        let data: Vec<u8> = (0..size)
            .map(|i| (seed.wrapping_add(i as u32).wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        Self {
            title: title.to_string(),
            version: version.to_string(),
            sha256: image_digest(&data),
            data,
        }
    }
}

#[derive(Default)]
struct GatewayState {
    token: Option<String>,
    shared_attributes: AttributeMap,
    firmware: Option<FirmwareImage>,
    next_rpc_id: RequestId,
}

type SharedState = Arc<Mutex<GatewayState>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("cloudnode-gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Embedded Systems Engineering Team")
        .about("Development gateway for cloudnode devices")
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Listen address")
                .takes_value(true)
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Listen port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .validator(|v| match v.parse::<u16>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Port must be between 0 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("token")
                .short("t")
                .long("token")
                .value_name("TOKEN")
                .help("Only accept devices presenting this token")
                .takes_value(true),
        )
        .get_matches();

    let addr = format!(
        "{}:{}",
        matches.value_of("bind").unwrap_or("127.0.0.1"),
        matches.value_of("port").unwrap_or(DEFAULT_PORT)
    );

    println!("{}", "Cloudnode Gateway".bright_blue().bold());
    println!("{}", "=================".bright_blue());
    println!("Console: rpc <fan|light> <on|off>, attr <fan|light> <on|off>, firmware <version> <bytes>, status");

    let state: SharedState = Arc::new(Mutex::new(GatewayState {
        token: matches.value_of("token").map(str::to_string),
        next_rpc_id: 1,
        ..GatewayState::default()
    }));
    let (console_tx, _) = broadcast::channel(CONSOLE_BROADCAST_BUFFER_SIZE);

    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {}", addr);

    let console_state = Arc::clone(&state);
    let console_frames = console_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_console(console_state, console_frames).await {
            error!("Console error: {}", e);
        }
    });

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!("Device connected: {}", peer);
                let client_state = Arc::clone(&state);
                let client_frames = console_tx.subscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_device(stream, peer, client_state, client_frames).await {
                        warn!("Device {} error: {}", peer, e);
                    }
                    info!("Device {} disconnected", peer);
                });
            }
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}

async fn handle_device(
    stream: TcpStream,
    peer: SocketAddr,
    state: SharedState,
    mut console_frames: broadcast::Receiver<CloudFrame>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (outbox, mut outbox_rx) = mpsc::channel::<CloudFrame>(CLIENT_OUTBOX_SIZE);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbox_rx.recv().await {
            let line = match encode_cloud(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Dropping frame for {}: {}", peer, e);
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut chunk_size: usize = 0;
    let mut authenticated = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match decode_device(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Bad frame from {}: {}", peer, e);
                        continue;
                    }
                };

                if !authenticated && !matches!(frame, DeviceFrame::Connect { .. }) {
                    warn!("{} sent {:?} before connecting", peer, frame);
                    continue;
                }

                match frame {
                    DeviceFrame::Connect { token } => {
                        let accepted = state
                            .lock()
                            .await
                            .token
                            .as_ref()
                            .map_or(true, |expected| *expected == token);
                        authenticated = accepted;
                        println!("{} {} {}", "CONNECT".bright_cyan(), peer, if accepted { "accepted".green() } else { "rejected".red() });
                        outbox.send(CloudFrame::ConnectAck { accepted }).await?;
                    }
                    DeviceFrame::Disconnect => {
                        println!("{} {}", "DISCONNECT".bright_cyan(), peer);
                        break;
                    }
                    DeviceFrame::Telemetry { values } => {
                        println!("{} {}", "TELEMETRY".bright_green(), Value::Object(values));
                    }
                    DeviceFrame::Attribute { key, value } => {
                        println!("{} {} = {}", "ATTRIBUTE".bright_yellow(), key, value);
                    }
                    DeviceFrame::SubscribeRpc { methods } => {
                        println!("{} rpc {:?}", "SUBSCRIBE".bright_cyan(), methods);
                        outbox.send(CloudFrame::SubscribeAck { accepted: true }).await?;
                    }
                    DeviceFrame::SubscribeAttributes { names } => {
                        println!("{} attributes {:?}", "SUBSCRIBE".bright_cyan(), names);
                        outbox.send(CloudFrame::SubscribeAck { accepted: true }).await?;
                    }
                    DeviceFrame::AttributeRequest { request_id, names } => {
                        let attributes: AttributeMap = {
                            let state = state.lock().await;
                            names
                                .iter()
                                .filter_map(|name| {
                                    state.shared_attributes.get(name).map(|value| (name.clone(), value.clone()))
                                })
                                .collect()
                        };
                        let attributes = if attributes.is_empty() { None } else { Some(attributes) };
                        outbox
                            .send(CloudFrame::AttributeResponse { request_id, attributes })
                            .await?;
                    }
                    DeviceFrame::RpcResponse { request_id, response } => {
                        println!("{} #{} {}", "RPC REPLY".bright_magenta(), request_id, response);
                    }
                    DeviceFrame::FirmwareInfo { title, version } => {
                        println!("{} {} v{}", "FIRMWARE".bright_blue(), title, version);
                    }
                    DeviceFrame::FirmwareRequest { title, version, chunk_size: requested } => {
                        chunk_size = usize::from(requested);
                        let reply = match state.lock().await.firmware.as_ref() {
                            Some(image) if image.title == title && image.version != version => {
                                println!("{} offering v{} ({} bytes)", "OTA".bright_blue(), image.version, image.data.len());
                                CloudFrame::FirmwareAvailable {
                                    title: image.title.clone(),
                                    version: image.version.clone(),
                                    size: image.data.len() as u32,
                                    sha256: image.sha256.clone(),
                                }
                            }
                            _ => CloudFrame::FirmwareUpToDate,
                        };
                        outbox.send(reply).await?;
                    }
                    DeviceFrame::ChunkRequest { index } => {
                        let reply = {
                            let state = state.lock().await;
                            let start = (index as usize).saturating_mul(chunk_size);
                            match state.firmware.as_ref() {
                                Some(image) if chunk_size > 0 && start < image.data.len() => {
                                    let end = (start + chunk_size).min(image.data.len());
                                    CloudFrame::Chunk {
                                        index,
                                        data: image.data[start..end].to_vec(),
                                    }
                                }
                                _ => CloudFrame::ChunkError { index },
                            }
                        };
                        outbox.send(reply).await?;
                    }
                    DeviceFrame::FirmwareCancel => {
                        println!("{} {} cancelled the download", "OTA".bright_blue(), peer);
                    }
                }
            }
            frame = console_frames.recv() => {
                match frame {
                    Ok(frame) if authenticated => outbox.send(frame).await?,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("{} missed {} console frames", peer, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    drop(outbox);
    // Flushes what is already queued
    let _ = writer_task.await;
    Ok(())
}

fn parse_output(word: &str) -> Option<Output> {
    match word {
        "fan" => Some(Output::Fan),
        "light" => Some(Output::Light),
        _ => None,
    }
}

fn parse_switch(word: &str) -> Option<bool> {
    match word {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

async fn run_console(state: SharedState, frames: broadcast::Sender<CloudFrame>) -> io::Result<()> {
    let mut lines = BufReader::new(io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["rpc", output, switch] => {
                let (Some(output), Some(on)) = (parse_output(output), parse_switch(switch)) else {
                    println!("{} usage: rpc <fan|light> <on|off>", "?".yellow());
                    continue;
                };
                let method = match output {
                    Output::Fan => SET_FAN_METHOD,
                    Output::Light => SET_LIGHT_METHOD,
                };
                let request_id = {
                    let mut state = state.lock().await;
                    let id = state.next_rpc_id;
                    state.next_rpc_id = state.next_rpc_id.wrapping_add(1);
                    id
                };
                let sent = frames.send(CloudFrame::Rpc {
                    request_id,
                    method: method.to_string(),
                    params: Value::Bool(on),
                });
                report_delivery(sent.is_ok(), &format!("rpc #{} {}({})", request_id, method, on));
            }
            ["attr", output, switch] => {
                let (Some(output), Some(on)) = (parse_output(output), parse_switch(switch)) else {
                    println!("{} usage: attr <fan|light> <on|off>", "?".yellow());
                    continue;
                };
                let mut update = AttributeMap::new();
                update.insert(output.attribute_name().to_string(), Value::Bool(on));
                state
                    .lock()
                    .await
                    .shared_attributes
                    .insert(output.attribute_name().to_string(), Value::Bool(on));
                let sent = frames.send(CloudFrame::SharedAttributes {
                    attributes: Some(update),
                });
                report_delivery(sent.is_ok(), &format!("{} = {}", output.attribute_name(), on));
            }
            ["firmware", version, size] => {
                let Ok(size) = size.parse::<usize>() else {
                    println!("{} usage: firmware <version> <bytes>", "?".yellow());
                    continue;
                };
                let image = FirmwareImage::synthetic(cloudnode::ota::FIRMWARE_TITLE, version, size);
                println!(
                    "{} assigned {} v{} ({} bytes, sha256 {})",
                    "OTA".bright_blue(),
                    image.title,
                    image.version,
                    size,
                    image.sha256
                );
                state.lock().await.firmware = Some(image);
            }
            ["status"] => {
                let state = state.lock().await;
                println!("{}", "Gateway status".bright_white().bold());
                println!("  Shared attributes: {}", Value::Object(state.shared_attributes.clone()));
                match state.firmware.as_ref() {
                    Some(image) => println!("  Firmware: {} v{} ({} bytes)", image.title, image.version, image.data.len()),
                    None => println!("  Firmware: none assigned"),
                }
                println!("  Devices listening: {}", frames.receiver_count());
            }
            [] => {}
            _ => println!("{} unknown command: {}", "?".yellow(), line.trim()),
        }
    }
    Ok(())
}

fn report_delivery(delivered: bool, what: &str) {
    if delivered {
        println!("{} {}", "SENT".bright_green(), what);
    } else {
        println!("{} {} (no devices connected)", "HELD".yellow(), what);
    }
}
