use crate::actuator::{ActuatorSink, ActuatorSnapshot, ActuatorState, ActuatorSynchronizer};
use crate::config::{ConfigError, DeviceConfig};
use crate::connection::{ConnectionManager, ConnectionState, NetworkLink, SessionStatus};
use crate::lifecycle::{TaskGate, TaskLifecycle};
use crate::ota::{FirmwareSlot, OtaAction, OtaCoordinator, OtaPhase, OtaStatus};
use crate::queue::{QueueError, QueueStats, SampleQueue};
use crate::sensors::{SensorProducer, SensorSource};
use crate::session::{CloudSession, FirmwareIdentity, FirmwareTransfer};
use crate::telemetry::{DispatchOutcome, TelemetryDispatcher};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BootError {
    #[error("log output unavailable: {0}")]
    Logging(String),
    #[error("sample queue allocation failed: {0}")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{task} task failed: {reason}")]
    TaskFailed { task: &'static str, reason: String },
}

/// Hardware and cloud collaborators the agent runs against.
pub struct Board {
    pub link: Box<dyn NetworkLink>,
    pub session: Box<dyn CloudSession>,
    pub transfer: Box<dyn FirmwareTransfer>,
    pub sensors: Box<dyn SensorSource + Send>,
    pub outputs: Box<dyn ActuatorSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A firmware update was installed; boot again to run it.
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub firmware: FirmwareIdentity,
    pub uptime_seconds: u64,
    pub connection: ConnectionState,
    pub handshake_complete: bool,
    pub ota_phase: OtaPhase,
    pub ota_progress_percent: u8,
    pub actuators: ActuatorSnapshot,
    pub queue_depth: usize,
    pub queue: QueueStats,
    pub sensor_paused: bool,
    pub telemetry_paused: bool,
    pub samples_rejected: u32,
    pub telemetry_published: u32,
}

#[derive(Debug, Default)]
struct AgentCounters {
    samples_rejected: AtomicU32,
    telemetry_published: AtomicU32,
}

#[derive(Debug, Clone, Copy)]
struct Clock {
    started: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Shared view used by the agent tasks and by [`AgentHandle`].
#[derive(Clone)]
struct Shared {
    identity: FirmwareIdentity,
    clock: Clock,
    queue: Arc<SampleQueue>,
    actuators: Arc<ActuatorState>,
    session_status: Arc<SessionStatus>,
    ota_status: Arc<OtaStatus>,
    sensor_gate: TaskGate,
    telemetry_gate: TaskGate,
    counters: Arc<AgentCounters>,
    stop: Arc<watch::Sender<bool>>,
}

/// Control and status access to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Shared,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        self.shared.stop.send_replace(true);
    }

    pub fn state(&self) -> AgentState {
        let shared = &self.shared;
        AgentState {
            firmware: shared.identity.clone(),
            uptime_seconds: shared.clock.now_ms() / 1000,
            connection: shared.session_status.state(),
            handshake_complete: shared.session_status.handshake_complete(),
            ota_phase: shared.ota_status.phase(),
            ota_progress_percent: shared.ota_status.progress_percent(),
            actuators: shared.actuators.snapshot(),
            queue_depth: shared.queue.len(),
            queue: shared.queue.stats(),
            sensor_paused: shared.sensor_gate.is_paused(),
            telemetry_paused: shared.telemetry_gate.is_paused(),
            samples_rejected: shared.counters.samples_rejected.load(Ordering::Relaxed),
            telemetry_published: shared.counters.telemetry_published.load(Ordering::Relaxed),
        }
    }
}

/// Device coordinator: a sensor task, a combined connection/telemetry/
/// actuator task sharing the one session, and an OTA task. An update cycle
/// pauses sampling and telemetry; the connection keeps being serviced.
pub struct DeviceAgent {
    config: DeviceConfig,
    board: Board,
    shared: Shared,
}

impl DeviceAgent {
    /// Validates the configuration and allocates the shared state. The
    /// announced identity comes from the firmware slot when an image was
    /// installed by a previous run.
    pub fn boot(config: DeviceConfig, board: Board, slot: &FirmwareSlot) -> Result<Self, BootError> {
        config.validate()?;
        let queue = Arc::new(SampleQueue::with_capacity(config.sampling.queue_capacity)?);
        let identity = slot.running_identity(&config.build_identity());

        info!("Booting firmware {}", identity);
        info!("   Sample queue: {} entries", queue.capacity());
        info!("   Cloud: {}:{}", config.cloud.server, config.cloud.port);

        let (stop, _) = watch::channel(false);
        let shared = Shared {
            identity,
            clock: Clock::start(),
            queue,
            actuators: Arc::new(ActuatorState::new()),
            session_status: Arc::new(SessionStatus::new()),
            ota_status: Arc::new(OtaStatus::new()),
            sensor_gate: TaskGate::new("sensor"),
            telemetry_gate: TaskGate::new("telemetry"),
            counters: Arc::new(AgentCounters::default()),
            stop: Arc::new(stop),
        };

        Ok(Self { config, board, shared })
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn identity(&self) -> &FirmwareIdentity {
        &self.shared.identity
    }

    /// Runs until shutdown or until an installed update requires a restart.
    pub async fn run(self) -> Result<RunOutcome, AgentError> {
        let Board {
            link,
            session,
            transfer,
            sensors,
            outputs,
        } = self.board;
        let config = Arc::new(self.config);
        let shared = self.shared;

        let sensor_task = tokio::spawn(sensor_loop(Arc::clone(&config), shared.clone(), sensors));
        let session_task = tokio::spawn(session_loop(
            Arc::clone(&config),
            shared.clone(),
            link,
            session,
            outputs,
        ));
        let ota_task = tokio::spawn(ota_loop(Arc::clone(&config), shared.clone(), transfer));

        let outcome = ota_task.await.map_err(|error| AgentError::TaskFailed {
            task: "ota",
            reason: error.to_string(),
        });

        // Whatever ended the OTA task ends the others too
        shared.stop.send_replace(true);

        sensor_task.await.map_err(|error| AgentError::TaskFailed {
            task: "sensor",
            reason: error.to_string(),
        })?;
        session_task.await.map_err(|error| AgentError::TaskFailed {
            task: "session",
            reason: error.to_string(),
        })?;

        let outcome = outcome?;
        info!("Agent stopped ({:?})", outcome);
        Ok(outcome)
    }
}

/// Resolves once shutdown is requested.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn sensor_loop(config: Arc<DeviceConfig>, shared: Shared, sensors: Box<dyn SensorSource + Send>) {
    let mut stop = shared.stop.subscribe();
    let mut producer = SensorProducer::new(sensors, Arc::clone(&shared.queue));
    let mut ticker = time::interval(config.sensor_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = shared.sensor_gate.checkpoint() => {}
        }

        if !producer.acquire().was_pushed() {
            shared.counters.samples_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn session_loop(
    config: Arc<DeviceConfig>,
    shared: Shared,
    mut link: Box<dyn NetworkLink>,
    mut session: Box<dyn CloudSession>,
    outputs: Box<dyn ActuatorSink>,
) {
    let mut stop = shared.stop.subscribe();
    let mut manager = ConnectionManager::new(config.connection_settings(), Arc::clone(&shared.session_status));
    let mut sync = ActuatorSynchronizer::new(outputs, Arc::clone(&shared.actuators));
    let mut dispatcher = TelemetryDispatcher::new(
        config.sampling.telemetry_interval_ms,
        Arc::clone(&shared.actuators),
    );
    let pop_timeout = config.queue_pop_timeout();
    let loop_delay = config.session_loop_delay();

    loop {
        manager.service(shared.clock.now_ms(), link.as_mut(), session.as_mut(), &mut sync);

        // Commands and attribute pushes keep flowing through an update;
        // only the telemetry side parks, leaving queued samples in place
        if !shared.telemetry_gate.is_paused() {
            let sample = tokio::select! {
                _ = stopped(&mut stop) => break,
                sample = shared.queue.pop(pop_timeout) => sample,
            };

            let ready = shared.session_status.is_ready();
            if dispatcher.dispatch(shared.clock.now_ms(), sample, ready, session.as_mut()) == DispatchOutcome::Published {
                shared.counters.telemetry_published.fetch_add(1, Ordering::Relaxed);
            }
        }

        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = time::sleep(loop_delay) => {}
        }
    }

    manager.shutdown(session.as_mut());
}

async fn ota_loop(config: Arc<DeviceConfig>, shared: Shared, mut transfer: Box<dyn FirmwareTransfer>) -> RunOutcome {
    let mut stop = shared.stop.subscribe();
    let mut coordinator = OtaCoordinator::new(
        config.ota_settings(shared.identity.clone()),
        Arc::clone(&shared.ota_status),
    );
    coordinator.supervise(Arc::new(shared.sensor_gate.clone()) as Arc<dyn TaskLifecycle>);
    coordinator.supervise(Arc::new(shared.telemetry_gate.clone()) as Arc<dyn TaskLifecycle>);

    let loop_delay = config.ota_loop_delay();

    loop {
        tokio::select! {
            _ = stopped(&mut stop) => return RunOutcome::Shutdown,
            _ = time::sleep(loop_delay) => {}
        }

        // Not ready until the first handshake has completed
        let ready = shared.session_status.is_ready();
        if let Some(OtaAction::Restart) = coordinator.step(shared.clock.now_ms(), ready, transfer.as_mut()) {
            warn!("Restarting into new firmware");
            return RunOutcome::Restart;
        }
    }
}

/// Fatal boot failure: park forever instead of running without the
/// guarantees the tasks rely on.
pub fn halt(error: &BootError) -> ! {
    error!("Boot failed, halting: {}", error);
    loop {
        std::thread::sleep(Duration::from_secs(60));
    }
}
