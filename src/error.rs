//! Error taxonomy shared by the relay pipeline.
//!
//! Sinks and the device link catch these at their own boundary and turn
//! them into state transitions; the orchestration loop never sees them.

use thiserror::Error;

use crate::ble::BleError;

#[derive(Error, Debug)]
pub enum RelayError {
    /// BLE, IPC or network failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed payload or an invalid decoded value.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Host process not running, device not found, source not configured.
    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    /// A blocking call did not answer in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Operation invalid in the current connection state.
    #[error("Invalid state: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BleError> for RelayError {
    fn from(err: BleError) -> Self {
        RelayError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Config(err.to_string())
    }
}
