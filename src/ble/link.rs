//! DeviceLink: discovery of and connection to a BLE heart-rate strap.
//!
//! The link owns at most one sensor connection. Heart Rate Measurement
//! notifications are decoded on arrival and valid readings are published to
//! the shared `SampleBus`. Every transport failure is absorbed here: callers
//! only ever see the resulting `ConnectionState`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::transport::{DeviceId, NotificationHandler, SensorCentral, SensorConnection};
use crate::flow::SampleBus;
use crate::journal::ActivityLog;
use crate::types::ConnectionState;
use crate::types::heartrate::{decode_measurement, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

/// Default scan window.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeviceLink {
    central: Arc<dyn SensorCentral>,
    bus: Arc<SampleBus>,
    activity: ActivityLog,
    state: ConnectionState,
    scanning: bool,
    connection: Option<Box<dyn SensorConnection>>,
    device: Option<DeviceId>,
    /// Notifications that failed to decode or carried 0 BPM.
    rejected: Arc<AtomicU64>,
}

impl DeviceLink {
    pub fn new(central: Arc<dyn SensorCentral>, bus: Arc<SampleBus>, activity: ActivityLog) -> Self {
        Self {
            central,
            bus,
            activity,
            state: ConnectionState::Disconnected,
            scanning: false,
            connection: None,
            device: None,
            rejected: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// Notifications dropped as malformed or zero since construction.
    pub fn rejected_notifications(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Scan for sensors advertising the Heart Rate service.
    ///
    /// Transport errors are reported and yield an empty list.
    pub async fn scan(&mut self, timeout: Duration) -> Vec<DeviceId> {
        self.scanning = true;
        self.activity.record("Scanning for BLE heart rate devices...");
        let result = self.central.discover(HEART_RATE_SERVICE, timeout).await;
        self.scanning = false;

        match result {
            Ok(devices) => {
                self.activity.record(format!("Found {} devices.", devices.len()));
                devices
            }
            Err(e) => {
                self.activity.record(format!("BLE scanning error: {}", e));
                Vec::new()
            }
        }
    }

    /// Connect to `device` and subscribe to heart-rate notifications.
    ///
    /// No-op when a connection is already up or being set up.
    pub async fn connect(&mut self, device: DeviceId) {
        if self.state != ConnectionState::Disconnected {
            log::debug!("connect({}) ignored: link is {:?}", device, self.state);
            return;
        }

        self.state = ConnectionState::Connecting;
        self.activity
            .record(format!("Attempting to connect to {}...", device));

        let connection = match self.central.connect(&device).await {
            Ok(connection) => connection,
            Err(e) => {
                self.activity.record(format!("BLE connection error: {}", e));
                self.release();
                return;
            }
        };

        if let Err(e) = connection
            .subscribe(HEART_RATE_MEASUREMENT, self.notification_handler())
            .await
        {
            self.activity
                .record(format!("Failed to subscribe to heart rate notifications: {}", e));
            if let Err(e) = connection.disconnect().await {
                log::debug!("Closing half-open link to {} failed: {}", device, e);
            }
            self.release();
            return;
        }

        self.activity.record(format!("Connected to {}", device));
        self.connection = Some(connection);
        self.device = Some(device);
        self.state = ConnectionState::Connected;
    }

    /// Unsubscribe and close the link. No-op when not connected; never fails.
    pub async fn disconnect(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }

        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.unsubscribe(HEART_RATE_MEASUREMENT).await {
                log::debug!("Unsubscribe from {} failed: {}", connection.device(), e);
            }
            if let Err(e) = connection.disconnect().await {
                self.activity
                    .record(format!("BLE disconnection error: {}", e));
            }
        }

        let name = self
            .device
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "device".to_string());
        self.activity.record(format!("Disconnected from {}", name));
        self.release();
    }

    /// Drop the connection if the transport reports the link has died
    /// (sensor out of range, powered off). Returns `true` when it did.
    pub async fn reap_if_lost(&mut self) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        let alive = match &self.connection {
            Some(connection) => connection.is_alive().await,
            None => false,
        };
        if alive {
            return false;
        }

        let name = self
            .device
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "device".to_string());
        self.activity
            .record(format!("Lost connection to {}", name));
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.disconnect().await {
                log::debug!("Closing lost link to {} failed: {}", name, e);
            }
        }
        self.release();
        true
    }

    fn release(&mut self) {
        self.connection = None;
        self.device = None;
        self.state = ConnectionState::Disconnected;
    }

    fn notification_handler(&self) -> NotificationHandler {
        let bus = Arc::clone(&self.bus);
        let rejected = Arc::clone(&self.rejected);
        Arc::new(move |payload: &[u8]| match decode_measurement(payload) {
            Ok(sample) => bus.publish(sample),
            Err(e) => {
                rejected.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropping heart rate notification {:02x?}: {}", payload, e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::SimSensorNetwork;
    use crate::types::HeartRateSample;

    fn make_link(network: &Arc<SimSensorNetwork>) -> (DeviceLink, Arc<SampleBus>) {
        let bus = Arc::new(SampleBus::new());
        let central: Arc<dyn SensorCentral> = network.clone();
        let link = DeviceLink::new(central, Arc::clone(&bus), ActivityLog::silent());
        (link, bus)
    }

    #[tokio::test]
    async fn test_scan_returns_heart_rate_devices() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, _bus) = make_link(&network);

        let found = link.scan(SCAN_TIMEOUT).await;
        assert_eq!(found, vec![strap.id().clone()]);
        assert!(!link.is_scanning());
    }

    #[tokio::test]
    async fn test_scan_error_yields_empty_list() {
        let network = SimSensorNetwork::new();
        network.add_heart_rate_sensor();
        network.set_scan_failure(true);
        let (mut link, _bus) = make_link(&network);

        assert!(link.scan(SCAN_TIMEOUT).await.is_empty());
        assert!(!link.is_scanning());
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_and_receive() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        assert_eq!(link.state(), ConnectionState::Connected);
        assert_eq!(link.device(), Some(strap.id()));

        assert!(strap.notify(&[0x00, 72]));
        assert!(strap.notify(&[0x01, 0x4B, 0x00]));
        assert_eq!(bus.take(), HeartRateSample::new(75));
    }

    #[tokio::test]
    async fn test_zero_and_malformed_are_not_published() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, bus) = make_link(&network);
        link.connect(strap.id().clone()).await;

        strap.notify(&[0x00, 0]);
        strap.notify(&[0x01, 0x00, 0x00]);
        strap.notify(&[0x01]);
        assert_eq!(bus.take(), None);
        assert_eq!(link.rejected_notifications(), 3);
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, _bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        link.connect(strap.id().clone()).await;

        assert_eq!(network.connect_attempts(), 1);
        assert_eq!(strap.link_count(), 1);
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_refused_connection_leaves_no_handle() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        strap.set_refuse_connections(true);
        let (mut link, _bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(link.device().is_none());
        assert_eq!(strap.link_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_half_open_link() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        strap.set_fail_subscribe(true);
        let (mut link, _bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert_eq!(strap.link_count(), 0);

        // A later attempt may succeed.
        strap.set_fail_subscribe(false);
        link.connect(strap.id().clone()).await;
        assert!(link.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, bus) = make_link(&network);

        // Not connected: nothing happens.
        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);

        link.connect(strap.id().clone()).await;
        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(link.device().is_none());
        assert!(!strap.is_subscribed());
        assert_eq!(strap.link_count(), 0);

        assert!(!strap.notify(&[0x00, 80]));
        assert_eq!(bus.take(), None);
    }

    #[tokio::test]
    async fn test_disconnect_after_transport_vanished() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, _bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        strap.set_in_range(false);

        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(link.device().is_none());
    }

    #[tokio::test]
    async fn test_reap_lost_link() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let (mut link, _bus) = make_link(&network);

        link.connect(strap.id().clone()).await;
        assert!(!link.reap_if_lost().await);
        assert!(link.is_connected());

        strap.set_in_range(false);
        assert!(link.reap_if_lost().await);
        assert_eq!(link.state(), ConnectionState::Disconnected);

        strap.set_in_range(true);
        let found = link.scan(SCAN_TIMEOUT).await;
        link.connect(found[0].clone()).await;
        assert!(link.is_connected());
    }
}
