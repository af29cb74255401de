//! BLE transport trait definitions and core types
//!
//! Defines the abstract central-role interface that both the simulated
//! sensor network and the btleplug implementation conform to. Only the
//! pieces a heart-rate strap needs are modelled: service-filtered discovery,
//! connect, notify subscription and disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::BleError;

/// Identifies a discovered sensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceId {
    /// Platform peripheral identifier reported by the OS Bluetooth stack.
    Hardware(String),
    /// A simulated sensor identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Hardware(id) => write!(f, "{}", id),
            DeviceId::Simulated(id) => write!(f, "sim:{}", id),
        }
    }
}

/// Callback invoked with the raw value of every notification on a
/// subscribed characteristic.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// An open GATT connection to a sensor.
#[async_trait]
pub trait SensorConnection: Send + Sync {
    /// Enable notifications on a characteristic and route them to `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError>;

    /// Disable notifications on a characteristic.
    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), BleError>;

    /// Close the link.
    async fn disconnect(&self) -> Result<(), BleError>;

    /// Ask the stack whether the link is still up.
    async fn is_alive(&self) -> bool;

    fn device(&self) -> &DeviceId;
}

/// BLE central role: discovering and connecting to sensors.
#[async_trait]
pub trait SensorCentral: Send + Sync {
    /// Scan for `timeout` and return devices advertising `service`.
    async fn discover(&self, service: Uuid, timeout: Duration) -> Result<Vec<DeviceId>, BleError>;

    /// Open a connection to a previously discovered device.
    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn SensorConnection>, BleError>;
}

/// Central used when the build has no BLE backend: never finds anything.
#[derive(Debug, Default)]
pub struct UnavailableCentral;

#[async_trait]
impl SensorCentral for UnavailableCentral {
    async fn discover(&self, _service: Uuid, _timeout: Duration) -> Result<Vec<DeviceId>, BleError> {
        Ok(Vec::new())
    }

    async fn connect(&self, _device: &DeviceId) -> Result<Box<dyn SensorConnection>, BleError> {
        Err(BleError::NoAdapter)
    }
}
