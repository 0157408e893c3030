//! # Cloudnode
//!
//! Device-side coordinator for a connected sensor node. It samples climate,
//! light and power readings, publishes them as telemetry over a cloud
//! session, keeps two relay outputs (fan and light) in sync with remote
//! commands and shared attributes, and applies over-the-air firmware
//! updates.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cloudnode::agent::{Board, DeviceAgent, RunOutcome};
//! use cloudnode::backend::LoopbackCloud;
//! use cloudnode::actuator::SimulatedRelays;
//! use cloudnode::config::DeviceConfig;
//! use cloudnode::ota::FirmwareSlot;
//! use cloudnode::sensors::SimulatedSensors;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cloud = LoopbackCloud::new();
//! let board = Board {
//!     link: Box::new(cloud.link()),
//!     session: Box::new(cloud.session()),
//!     transfer: Box::new(cloud.transfer()),
//!     sensors: Box::new(SimulatedSensors::default()),
//!     outputs: Box::new(SimulatedRelays),
//! };
//!
//! let agent = DeviceAgent::boot(DeviceConfig::default(), board, &FirmwareSlot::new())?;
//! if agent.run().await? == RunOutcome::Restart {
//!     println!("new firmware installed");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`queue`] - Bounded sample queue between the sensor and telemetry tasks
//! - [`sensors`] - Sensor sources and the periodic producer
//! - [`connection`] - Network link and cloud session lifecycle
//! - [`actuator`] - Command and shared attribute reconciliation
//! - [`telemetry`] - Rate-limited telemetry publishing
//! - [`ota`] - Firmware update state machine
//! - [`agent`] - Task wiring and the public run loop
//! - [`backend`] - Loopback and TCP gateway implementations of the cloud traits

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod actuator;
pub mod agent;
pub mod backend;
pub mod config;
pub mod connection;
pub mod lifecycle;
pub mod logging;
pub mod ota;
pub mod protocol;
pub mod queue;
pub mod sensors;
pub mod session;
pub mod telemetry;

pub use agent::{AgentHandle, AgentState, Board, DeviceAgent, RunOutcome};
pub use config::DeviceConfig;
pub use queue::SampleQueue;
pub use sensors::{SensorProducer, SensorSample};
