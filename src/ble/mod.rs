//! BLE layer for heart-rate sensors
//!
//! Provides the transport traits the device link is written against, a
//! btleplug-backed central (feature `ble-central`), an in-process simulated
//! sensor network for tests, and the `DeviceLink` state machine itself.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod link;
pub mod simulated;
pub mod transport;

pub use link::DeviceLink;
pub use transport::{DeviceId, NotificationHandler, SensorCentral, SensorConnection};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("No Bluetooth adapter available")]
    NoAdapter,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
