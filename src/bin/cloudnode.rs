use clap::{App, Arg};
use cloudnode::actuator::SimulatedRelays;
use cloudnode::agent::{halt, Board, DeviceAgent, RunOutcome};
use cloudnode::backend::{HostLink, LoopbackCloud, TcpCloud};
use cloudnode::config::DeviceConfig;
use cloudnode::logging;
use cloudnode::ota::FirmwareSlot;
use cloudnode::sensors::SimulatedSensors;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("cloudnode")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Embedded Systems Engineering Team")
        .about("Sensor node coordinator: telemetry, relay control and OTA updates")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server")
                .short("s")
                .long("server")
                .value_name("HOST")
                .help("Gateway host, overrides the configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Gateway port, overrides the configuration")
                .takes_value(true)
                .validator(|v| match v.parse::<u16>() {
                    Ok(port) if port > 0 => Ok(()),
                    _ => Err("Port must be between 1 and 65535".into()),
                }),
        )
        .arg(
            Arg::with_name("token")
                .short("t")
                .long("token")
                .value_name("TOKEN")
                .help("Device access token")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is not set")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"]),
        )
        .arg(
            Arg::with_name("simulate")
                .long("simulate")
                .help("Run against an in-process cloud instead of a gateway"),
        )
        .get_matches();

    let mut config = match DeviceConfig::load_or_default(matches.value_of("config").map(Path::new)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cloudnode: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(server) = matches.value_of("server") {
        config.cloud.server = server.to_string();
    }
    if let Some(port) = matches.value_of("port").and_then(|p| p.parse().ok()) {
        config.cloud.port = port;
    }
    if let Some(token) = matches.value_of("token") {
        config.cloud.token = token.to_string();
    }
    if let Some(level) = matches.value_of("log-level") {
        config.logging.level = level.to_string();
    }
    let simulate = matches.is_present("simulate");

    if let Err(e) = logging::init(&config.logging.level) {
        eprintln!("cloudnode: {}", e);
        halt(&e);
    }

    // Survives restarts so the next boot runs the installed image
    let slot = Arc::new(FirmwareSlot::new());
    let loopback = LoopbackCloud::new();
    loopback.attach_slot(Arc::clone(&slot));

    loop {
        let board = if simulate {
            Board {
                link: Box::new(loopback.link()),
                session: Box::new(loopback.session()),
                transfer: Box::new(loopback.transfer()),
                sensors: Box::new(SimulatedSensors::default()),
                outputs: Box::new(SimulatedRelays),
            }
        } else {
            let cloud = TcpCloud::new(config.cloud.max_message_size, Arc::clone(&slot));
            Board {
                link: Box::new(HostLink::new()),
                session: Box::new(cloud.session()),
                transfer: Box::new(cloud.transfer()),
                sensors: Box::new(SimulatedSensors::default()),
                outputs: Box::new(SimulatedRelays),
            }
        };

        let agent = match DeviceAgent::boot(config.clone(), board, &slot) {
            Ok(agent) => agent,
            Err(e) => halt(&e),
        };
        let handle = agent.handle();

        let status_handle = handle.clone();
        let status_task = tokio::spawn(async move {
            let mut ticker = time::interval(STATUS_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match serde_json::to_string(&status_handle.state()) {
                    Ok(state) => info!("Status: {}", state),
                    Err(e) => error!("Status unavailable: {}", e),
                }
            }
        });

        let run = agent.run();
        tokio::pin!(run);
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            _ = signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                handle.shutdown();
                run.await
            }
        };
        status_task.abort();

        match outcome? {
            RunOutcome::Restart => info!("Rebooting"),
            RunOutcome::Shutdown => break,
        }
    }

    Ok(())
}
