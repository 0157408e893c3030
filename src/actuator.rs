use crate::session::{AttributeMap, CloudSession};
use heapless::FnvIndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const FAN_ATTRIBUTE: &str = "sharedvalueFan";
pub const LIGHT_ATTRIBUTE: &str = "sharedvalueLight";
pub const SHARED_ATTRIBUTES: [&str; 2] = [FAN_ATTRIBUTE, LIGHT_ATTRIBUTE];

pub const SET_FAN_METHOD: &str = "setValueFan";
pub const SET_LIGHT_METHOD: &str = "setValueLight";

const MAX_COMMAND_HANDLERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Output {
    Fan,
    Light,
}

impl Output {
    pub const ALL: [Output; 2] = [Output::Fan, Output::Light];

    pub fn attribute_name(self) -> &'static str {
        match self {
            Output::Fan => FAN_ATTRIBUTE,
            Output::Light => LIGHT_ATTRIBUTE,
        }
    }

    pub fn telemetry_key(self) -> &'static str {
        match self {
            Output::Fan => "fanState",
            Output::Light => "lightState",
        }
    }

    pub fn ack_key(self) -> &'static str {
        match self {
            Output::Fan => "newFanState",
            Output::Light => "newLightState",
        }
    }

    pub fn from_attribute(name: &str) -> Option<Output> {
        Output::ALL
            .into_iter()
            .find(|output| output.attribute_name() == name)
    }

    pub fn label(self) -> &'static str {
        match self {
            Output::Fan => "fan",
            Output::Light => "light",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorSnapshot {
    pub fan: bool,
    pub light: bool,
}

/// Process-wide actuator state.
///
/// Written by the synchronizer on the session task and read by the
/// telemetry path and status reporting. Stores use `Release` and loads use
/// `Acquire`, so a reader that observes a new value also observes the
/// output write that preceded it.
#[derive(Debug, Default)]
pub struct ActuatorState {
    fan: AtomicBool,
    light: AtomicBool,
}

impl ActuatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, output: Output) -> bool {
        self.flag(output).load(Ordering::Acquire)
    }

    /// Stores a new value and returns the previous one.
    pub fn set(&self, output: Output, on: bool) -> bool {
        self.flag(output).swap(on, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> ActuatorSnapshot {
        ActuatorSnapshot {
            fan: self.get(Output::Fan),
            light: self.get(Output::Light),
        }
    }

    fn flag(&self, output: Output) -> &AtomicBool {
        match output {
            Output::Fan => &self.fan,
            Output::Light => &self.light,
        }
    }
}

/// Physical outputs. Writes are synchronous and assumed to succeed.
pub trait ActuatorSink: Send {
    fn set_fan(&mut self, on: bool);
    fn set_light(&mut self, on: bool);

    fn set(&mut self, output: Output, on: bool) {
        match output {
            Output::Fan => self.set_fan(on),
            Output::Light => self.set_light(on),
        }
    }
}

impl<K: ActuatorSink + ?Sized> ActuatorSink for Box<K> {
    fn set_fan(&mut self, on: bool) {
        (**self).set_fan(on)
    }

    fn set_light(&mut self, on: bool) {
        (**self).set_light(on)
    }
}

/// Relay outputs for hosts without the board; writes are only logged.
#[derive(Debug, Default)]
pub struct SimulatedRelays;

impl ActuatorSink for SimulatedRelays {
    fn set_fan(&mut self, on: bool) {
        info!("Fan relay -> {}", if on { "ON" } else { "OFF" });
    }

    fn set_light(&mut self, on: bool) {
        info!("Light relay -> {}", if on { "ON" } else { "OFF" });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command method '{0}'")]
    UnknownMethod(String),
    #[error("invalid payload for {method}: expected boolean")]
    InvalidPayload { method: &'static str },
    #[error("command registry full")]
    RegistryFull,
}

/// Output control handed to command handlers.
pub trait OutputControl {
    /// Applies a value, returning true when the output actually changed.
    fn apply(&mut self, output: Output, on: bool) -> bool;
    fn state(&self, output: Output) -> bool;
}

pub struct CommandOutcome {
    /// Payload returned to the caller of the command
    pub ack: Value,
    /// Output whose new value must be reported back as an attribute
    pub report: Option<(Output, bool)>,
}

/// A named remote command. Handlers are looked up by method name.
pub trait CommandHandler: Send {
    fn method(&self) -> &'static str;
    fn handle(&self, params: &Value, outputs: &mut dyn OutputControl) -> Result<CommandOutcome, CommandError>;
}

/// `setValueFan` / `setValueLight`: switch one output from a boolean payload.
#[derive(Debug, Clone, Copy)]
pub struct SetOutput(pub Output);

impl CommandHandler for SetOutput {
    fn method(&self) -> &'static str {
        match self.0 {
            Output::Fan => SET_FAN_METHOD,
            Output::Light => SET_LIGHT_METHOD,
        }
    }

    fn handle(&self, params: &Value, outputs: &mut dyn OutputControl) -> Result<CommandOutcome, CommandError> {
        let on = params
            .as_bool()
            .ok_or(CommandError::InvalidPayload { method: self.method() })?;

        outputs.apply(self.0, on);
        let state = outputs.state(self.0);

        let mut ack = Map::new();
        ack.insert(self.0.ack_key().to_string(), Value::Bool(state));

        Ok(CommandOutcome {
            ack: Value::Object(ack),
            report: Some((self.0, state)),
        })
    }
}

pub struct CommandRegistry {
    handlers: FnvIndexMap<&'static str, Box<dyn CommandHandler>, MAX_COMMAND_HANDLERS>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self {
            handlers: FnvIndexMap::new(),
        }
    }

    /// Registry with the fan and light handlers installed.
    pub fn with_default_handlers() -> Self {
        let mut registry = Self::new();
        for output in Output::ALL {
            // Two handlers always fit
            let _ = registry.register(Box::new(SetOutput(output)));
        }
        registry
    }

    pub fn register(&mut self, handler: Box<dyn CommandHandler>) -> Result<(), CommandError> {
        let method = handler.method();
        self.handlers
            .insert(method, handler)
            .map(|_| ())
            .map_err(|_| CommandError::RegistryFull)
    }

    pub fn get(&self, method: &str) -> Option<&dyn CommandHandler> {
        self.handlers.get(method).map(|handler| handler.as_ref())
    }

    pub fn methods(&self) -> heapless::Vec<&'static str, MAX_COMMAND_HANDLERS> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_default_handlers()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub commands_handled: u32,
    pub commands_rejected: u32,
    pub attributes_applied: u32,
    pub attributes_ignored: u32,
    pub reports_sent: u32,
    pub output_writes: u32,
}

struct Outputs<K> {
    sink: K,
    state: Arc<ActuatorState>,
    writes: u32,
}

impl<K: ActuatorSink> OutputControl for Outputs<K> {
    fn apply(&mut self, output: Output, on: bool) -> bool {
        let previous = self.state.set(output, on);
        if previous == on {
            return false;
        }
        self.sink.set(output, on);
        self.writes = self.writes.wrapping_add(1);
        true
    }

    fn state(&self, output: Output) -> bool {
        self.state.get(output)
    }
}

/// Reconciles actuator state between remote commands and shared attribute
/// pushes.
///
/// Both paths run on the session task, so they are applied in the order the
/// session delivers them and the last delivered value wins. The physical
/// output is written only when the value actually changes.
pub struct ActuatorSynchronizer<K> {
    outputs: Outputs<K>,
    registry: CommandRegistry,
    stats: SyncStats,
}

impl<K: ActuatorSink> ActuatorSynchronizer<K> {
    pub fn new(sink: K, state: Arc<ActuatorState>) -> Self {
        Self::with_registry(sink, state, CommandRegistry::with_default_handlers())
    }

    pub fn with_registry(mut sink: K, state: Arc<ActuatorState>, registry: CommandRegistry) -> Self {
        // Outputs start de-energized
        for output in Output::ALL {
            state.set(output, false);
            sink.set(output, false);
        }

        Self {
            outputs: Outputs {
                sink,
                state,
                writes: 0,
            },
            registry,
            stats: SyncStats::default(),
        }
    }

    /// Command methods to subscribe to.
    pub fn command_methods(&self) -> heapless::Vec<&'static str, MAX_COMMAND_HANDLERS> {
        self.registry.methods()
    }

    /// Runs a remote command, reports the resulting output value back to the
    /// session as an attribute and returns the acknowledgement payload.
    pub fn handle_command(
        &mut self,
        method: &str,
        params: &Value,
        session: &mut dyn CloudSession,
    ) -> Result<Value, CommandError> {
        let handler = match self.registry.get(method) {
            Some(handler) => handler,
            None => {
                self.stats.commands_rejected = self.stats.commands_rejected.wrapping_add(1);
                return Err(CommandError::UnknownMethod(method.to_string()));
            }
        };

        let outcome = match handler.handle(params, &mut self.outputs) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.stats.commands_rejected = self.stats.commands_rejected.wrapping_add(1);
                return Err(error);
            }
        };

        self.stats.commands_handled = self.stats.commands_handled.wrapping_add(1);

        if let Some((output, on)) = outcome.report {
            info!("{} set to {} by command {}", output.label(), on, method);
            match session.send_attribute(output.attribute_name(), Value::Bool(on)) {
                Ok(()) => self.stats.reports_sent = self.stats.reports_sent.wrapping_add(1),
                Err(error) => warn!("Failed to report {} state: {}", output.label(), error),
            }
        }

        self.stats.output_writes = self.outputs.writes;
        Ok(outcome.ack)
    }

    /// Applies a shared attribute push or request response. Values are never
    /// reported back. Returns the number of recognized keys applied.
    pub fn apply_shared_attributes(&mut self, attributes: Option<&AttributeMap>) -> usize {
        let attributes = match attributes {
            Some(map) if !map.is_empty() => map,
            _ => {
                info!("Shared attribute update carried no data");
                return 0;
            }
        };

        let mut applied = 0;
        for (key, value) in attributes {
            let output = match Output::from_attribute(key) {
                Some(output) => output,
                None => {
                    debug!("Ignoring unknown shared attribute '{}'", key);
                    self.stats.attributes_ignored = self.stats.attributes_ignored.wrapping_add(1);
                    continue;
                }
            };

            let on = match value.as_bool() {
                Some(on) => on,
                None => {
                    debug!("Ignoring non-boolean value for '{}': {}", key, value);
                    self.stats.attributes_ignored = self.stats.attributes_ignored.wrapping_add(1);
                    continue;
                }
            };

            if self.outputs.apply(output, on) {
                info!("{} set to {} by shared attribute", output.label(), on);
            }
            applied += 1;
        }

        self.stats.attributes_applied = self.stats.attributes_applied.wrapping_add(applied as u32);
        self.stats.output_writes = self.outputs.writes;
        applied
    }

    pub fn state(&self) -> &Arc<ActuatorState> {
        &self.outputs.state
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn sink(&self) -> &K {
        &self.outputs.sink
    }
}
