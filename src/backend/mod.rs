//! Session adapters. Each backend exposes a [`CloudSession`] for the session
//! task, a [`FirmwareTransfer`] for the OTA task and a [`NetworkLink`].
//!
//! [`CloudSession`]: crate::session::CloudSession
//! [`FirmwareTransfer`]: crate::session::FirmwareTransfer
//! [`NetworkLink`]: crate::connection::NetworkLink

pub mod loopback;
pub mod tcp;

pub use loopback::{LoopbackCloud, LoopbackLink, LoopbackSession, LoopbackTransfer};
pub use tcp::{HostLink, TcpCloud, TcpSession, TcpTransfer};
