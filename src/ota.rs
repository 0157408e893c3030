use crate::lifecycle::TaskLifecycle;
use crate::session::{FirmwareIdentity, FirmwareTransfer, TransferEvent, UpdateRequest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

pub const FIRMWARE_TITLE: &str = "DA_TTNT";
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_CHUNK_RETRIES: u8 = 12;
pub const DEFAULT_CHUNK_SIZE: u16 = 4096;
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OtaPhase {
    Idle = 0,
    InfoSent = 1,
    UpdateRequested = 2,
    Downloading = 3,
    Finishing = 4,
    Succeeded = 5,
    Failed = 6,
}

impl OtaPhase {
    /// Phases during which the sensor and telemetry tasks stay paused.
    pub fn suspends_tasks(self) -> bool {
        matches!(
            self,
            OtaPhase::InfoSent | OtaPhase::UpdateRequested | OtaPhase::Downloading | OtaPhase::Finishing
        )
    }

    /// A transfer is in flight; the periodic check must not interfere.
    pub fn is_transferring(self) -> bool {
        matches!(self, OtaPhase::Downloading | OtaPhase::Finishing)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => OtaPhase::InfoSent,
            2 => OtaPhase::UpdateRequested,
            3 => OtaPhase::Downloading,
            4 => OtaPhase::Finishing,
            5 => OtaPhase::Succeeded,
            6 => OtaPhase::Failed,
            _ => OtaPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaState {
    pub phase: OtaPhase,
    pub firmware: FirmwareIdentity,
    pub retries_remaining: u8,
    pub bytes_received: u32,
    pub total_bytes: u32,
}

impl OtaState {
    pub fn new(firmware: FirmwareIdentity, retry_budget: u8) -> Self {
        Self {
            phase: OtaPhase::Idle,
            firmware,
            retries_remaining: retry_budget,
            bytes_received: 0,
            total_bytes: 0,
        }
    }

    pub fn progress_percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_received as f32 * 100.0 / self.total_bytes as f32
    }
}

#[derive(Debug, Clone)]
pub struct OtaSettings {
    pub identity: FirmwareIdentity,
    pub retry_budget: u8,
    pub chunk_size: u16,
    pub check_interval_ms: u64,
    /// How long to wait for the transfer to start or report no update
    pub response_timeout_ms: u64,
    /// Longest silence tolerated from a running transfer
    pub stall_timeout_ms: u64,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            identity: FirmwareIdentity::new(FIRMWARE_TITLE, FIRMWARE_VERSION),
            retry_budget: DEFAULT_CHUNK_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
        }
    }
}

/// OTA phase and progress, readable from other tasks.
#[derive(Debug, Default)]
pub struct OtaStatus {
    phase: AtomicU8,
    progress_percent: AtomicU8,
}

impl OtaStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> OtaPhase {
        OtaPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn progress_percent(&self) -> u8 {
        self.progress_percent.load(Ordering::Acquire)
    }

    fn publish(&self, state: &OtaState) {
        self.phase.store(state.phase as u8, Ordering::Release);
        self.progress_percent
            .store(state.progress_percent().min(100.0) as u8, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaAction {
    /// A new image is installed; the device must restart into it.
    Restart,
}

/// Installed firmware image. Survives the in-process restart that follows
/// a successful update, so the next boot announces the new identity.
#[derive(Debug, Default)]
pub struct FirmwareSlot {
    installed: Mutex<Option<FirmwareIdentity>>,
}

impl FirmwareSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, identity: FirmwareIdentity) {
        info!("Firmware image {} installed", identity);
        *self.installed.lock().unwrap_or_else(PoisonError::into_inner) = Some(identity);
    }

    pub fn installed(&self) -> Option<FirmwareIdentity> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identity to announce: the installed image if any, else the build.
    pub fn running_identity(&self, build: &FirmwareIdentity) -> FirmwareIdentity {
        self.installed().unwrap_or_else(|| build.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OtaStats {
    pub check_cycles: u32,
    pub announce_failures: u32,
    pub request_failures: u32,
    pub up_to_date: u32,
    pub no_response: u32,
    pub downloads_started: u32,
    pub overlapping_starts_rejected: u32,
    pub unsolicited_starts_cancelled: u32,
    pub chunk_retries: u32,
    pub stalled: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Firmware update state machine.
///
/// Each periodic check announces the running identity and asks for an
/// update. The sensor and telemetry tasks are paused before the announce
/// and stay paused until the cycle ends: with a restart on success, or a
/// resume on failure, no update, or no answer. Only one transfer can be in
/// flight; a second start notification while downloading is ignored, and a
/// start arriving after the cycle ended is cancelled.
pub struct OtaCoordinator {
    settings: OtaSettings,
    state: OtaState,
    status: Arc<OtaStatus>,
    tasks: Vec<Arc<dyn TaskLifecycle>>,
    tasks_paused: bool,
    next_check: u64,
    phase_entered_at: u64,
    last_activity: u64,
    stats: OtaStats,
}

impl OtaCoordinator {
    pub fn new(settings: OtaSettings, status: Arc<OtaStatus>) -> Self {
        let state = OtaState::new(settings.identity.clone(), settings.retry_budget);
        status.publish(&state);

        Self {
            settings,
            state,
            status,
            tasks: Vec::new(),
            tasks_paused: false,
            next_check: 0,
            phase_entered_at: 0,
            last_activity: 0,
            stats: OtaStats::default(),
        }
    }

    /// Registers a task to pause for the duration of an update cycle.
    pub fn supervise(&mut self, task: Arc<dyn TaskLifecycle>) {
        self.tasks.push(task);
    }

    /// Runs one OTA loop iteration.
    pub fn step(
        &mut self,
        current_time: u64,
        session_ready: bool,
        transfer: &mut dyn FirmwareTransfer,
    ) -> Option<OtaAction> {
        for event in transfer.poll_transfer() {
            if let Some(action) = self.handle_event(current_time, event, transfer) {
                return Some(action);
            }
        }

        self.check_timeouts(current_time, transfer);

        if current_time < self.next_check || self.state.phase.is_transferring() {
            return None;
        }

        if matches!(self.state.phase, OtaPhase::InfoSent | OtaPhase::UpdateRequested) {
            debug!("Re-arming unanswered update request");
            transfer.cancel_update();
            self.end_cycle();
        }

        if !session_ready {
            return None;
        }

        self.run_cycle(current_time, transfer);
        None
    }

    fn run_cycle(&mut self, current_time: u64, transfer: &mut dyn FirmwareTransfer) {
        self.next_check = current_time + self.settings.check_interval_ms;
        self.stats.check_cycles = self.stats.check_cycles.wrapping_add(1);
        self.pause_tasks();

        let identity = self.state.firmware.clone();
        if let Err(error) = transfer.announce(&identity) {
            warn!("Failed to send firmware info: {}", error);
            self.stats.announce_failures = self.stats.announce_failures.wrapping_add(1);
            self.end_cycle();
            return;
        }
        info!("Announced firmware {}", identity);
        self.set_phase(current_time, OtaPhase::InfoSent);

        let request = UpdateRequest {
            identity,
            retry_budget: self.settings.retry_budget,
            chunk_size: self.settings.chunk_size,
        };
        if let Err(error) = transfer.request_update(&request) {
            warn!("Failed to request firmware update: {}", error);
            self.stats.request_failures = self.stats.request_failures.wrapping_add(1);
            self.end_cycle();
            return;
        }

        info!("Firmware update requested");
        self.state.retries_remaining = self.settings.retry_budget;
        self.set_phase(current_time, OtaPhase::UpdateRequested);
    }

    fn handle_event(
        &mut self,
        current_time: u64,
        event: TransferEvent,
        transfer: &mut dyn FirmwareTransfer,
    ) -> Option<OtaAction> {
        match event {
            TransferEvent::UpToDate => {
                if matches!(self.state.phase, OtaPhase::InfoSent | OtaPhase::UpdateRequested) {
                    info!("Firmware is up to date");
                    self.stats.up_to_date = self.stats.up_to_date.wrapping_add(1);
                    self.end_cycle();
                }
            }
            TransferEvent::Starting { total_bytes } => match self.state.phase {
                OtaPhase::UpdateRequested => {
                    info!("Update starting, {} bytes", total_bytes);
                    self.stats.downloads_started = self.stats.downloads_started.wrapping_add(1);
                    self.state.bytes_received = 0;
                    self.state.total_bytes = total_bytes;
                    self.last_activity = current_time;
                    self.set_phase(current_time, OtaPhase::Downloading);
                }
                OtaPhase::Downloading | OtaPhase::Finishing => {
                    warn!("Transfer already in progress, ignoring second start");
                    self.stats.overlapping_starts_rejected =
                        self.stats.overlapping_starts_rejected.wrapping_add(1);
                }
                phase => {
                    // Tasks are running; no download may proceed outside the cycle
                    warn!("Transfer started in {:?}, cancelling", phase);
                    self.stats.unsolicited_starts_cancelled =
                        self.stats.unsolicited_starts_cancelled.wrapping_add(1);
                    transfer.cancel_update();
                }
            },
            TransferEvent::Progress { received, total } => {
                if self.state.phase.is_transferring() {
                    self.state.bytes_received = received;
                    self.state.total_bytes = total;
                    self.last_activity = current_time;
                    info!("Downloading firmware progress {:.2}%", self.state.progress_percent());
                    if total > 0 && received >= total {
                        self.set_phase(current_time, OtaPhase::Finishing);
                    } else {
                        self.status.publish(&self.state);
                    }
                }
            }
            TransferEvent::ChunkRetry { retries_remaining } => {
                if self.state.phase.is_transferring() {
                    warn!("Chunk retry, {} retries remaining", retries_remaining);
                    self.stats.chunk_retries = self.stats.chunk_retries.wrapping_add(1);
                    self.state.retries_remaining = retries_remaining;
                    self.last_activity = current_time;
                }
            }
            TransferEvent::Finished { success } => {
                if !self.state.phase.is_transferring() {
                    debug!("Ignoring transfer result in {:?}", self.state.phase);
                    return None;
                }
                if success {
                    if self.state.phase != OtaPhase::Finishing {
                        self.set_phase(current_time, OtaPhase::Finishing);
                    }
                    self.set_phase(current_time, OtaPhase::Succeeded);
                    self.stats.succeeded = self.stats.succeeded.wrapping_add(1);
                    info!("Update done, restarting");
                    return Some(OtaAction::Restart);
                }
                self.fail(current_time);
            }
        }
        None
    }

    fn check_timeouts(&mut self, current_time: u64, transfer: &mut dyn FirmwareTransfer) {
        let in_phase = current_time.saturating_sub(self.phase_entered_at);

        if self.state.phase == OtaPhase::UpdateRequested && in_phase >= self.settings.response_timeout_ms {
            info!("No firmware update offered");
            self.stats.no_response = self.stats.no_response.wrapping_add(1);
            transfer.cancel_update();
            self.end_cycle();
            return;
        }

        if self.state.phase.is_transferring()
            && current_time.saturating_sub(self.last_activity) >= self.settings.stall_timeout_ms
        {
            warn!("Firmware transfer stalled, cancelling");
            self.stats.stalled = self.stats.stalled.wrapping_add(1);
            transfer.cancel_update();
            self.fail(current_time);
        }
    }

    fn fail(&mut self, current_time: u64) {
        warn!("Firmware update failed, resuming normal operation");
        self.stats.failed = self.stats.failed.wrapping_add(1);
        self.set_phase(current_time, OtaPhase::Failed);
        self.next_check = current_time + self.settings.check_interval_ms;
        self.end_cycle();
    }

    /// Returns to Idle and resumes the paused tasks.
    fn end_cycle(&mut self) {
        self.state.bytes_received = 0;
        self.state.total_bytes = 0;
        self.state.retries_remaining = self.settings.retry_budget;
        self.state.phase = OtaPhase::Idle;
        self.status.publish(&self.state);
        self.resume_tasks();
    }

    fn set_phase(&mut self, current_time: u64, phase: OtaPhase) {
        debug!("OTA {:?} -> {:?}", self.state.phase, phase);
        self.state.phase = phase;
        self.phase_entered_at = current_time;
        self.status.publish(&self.state);
    }

    fn pause_tasks(&mut self) {
        if self.tasks_paused {
            return;
        }
        for task in &self.tasks {
            debug!(task = task.name(), "Pausing for firmware update");
            task.pause();
        }
        self.tasks_paused = true;
    }

    fn resume_tasks(&mut self) {
        if !self.tasks_paused {
            return;
        }
        for task in &self.tasks {
            debug!(task = task.name(), "Resuming after firmware update");
            task.resume();
        }
        self.tasks_paused = false;
    }

    pub fn state(&self) -> &OtaState {
        &self.state
    }

    pub fn phase(&self) -> OtaPhase {
        self.state.phase
    }

    pub fn next_check(&self) -> u64 {
        self.next_check
    }

    pub fn stats(&self) -> &OtaStats {
        &self.stats
    }
}
