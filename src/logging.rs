use crate::agent::BootError;
use std::io::{self, Stderr};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. All tasks log through one
/// mutex-guarded stderr writer so lines never interleave. `RUST_LOG`
/// takes precedence over `level` when set.
pub fn init(level: &str) -> Result<(), BootError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|error| BootError::Logging(error.to_string()))?,
    };

    let writer: Mutex<Stderr> = Mutex::new(io::stderr());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .with_writer(writer)
        .try_init()
        .map_err(|error| BootError::Logging(error.to_string()))
}
