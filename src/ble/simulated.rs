//! In-process BLE sensor simulator
//!
//! Provides a simulated set of heart-rate straps that can be discovered,
//! connected and made to emit notifications entirely in-process. Used for
//! integration testing and demos without requiring real BLE hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::transport::{DeviceId, NotificationHandler, SensorCentral, SensorConnection};
use super::BleError;
use crate::types::heartrate::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};

/// Shared state of one simulated sensor.
struct SimSensorState {
    id: DeviceId,
    services: Vec<Uuid>,
    /// Whether the sensor is in radio range (discoverable and linkable).
    in_range: AtomicBool,
    refuse_connections: AtomicBool,
    fail_subscribe: AtomicBool,
    /// Number of live connections to this sensor.
    links: AtomicUsize,
    handlers: Mutex<HashMap<Uuid, NotificationHandler>>,
}

/// The simulated "air" holding every sensor that can be discovered.
pub struct SimSensorNetwork {
    sensors: Mutex<Vec<Arc<SimSensorState>>>,
    scan_failure: AtomicBool,
    scans: AtomicUsize,
    connect_attempts: AtomicUsize,
}

impl SimSensorNetwork {
    /// Create a new, empty simulated network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sensors: Mutex::new(Vec::new()),
            scan_failure: AtomicBool::new(false),
            scans: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
        })
    }

    /// Add a sensor advertising the given services.
    pub fn add_sensor(&self, services: Vec<Uuid>) -> SimSensor {
        let state = Arc::new(SimSensorState {
            id: DeviceId::Simulated(Uuid::new_v4()),
            services,
            in_range: AtomicBool::new(true),
            refuse_connections: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            links: AtomicUsize::new(0),
            handlers: Mutex::new(HashMap::new()),
        });
        if let Ok(mut sensors) = self.sensors.lock() {
            sensors.push(Arc::clone(&state));
        }
        SimSensor { state }
    }

    /// Add a sensor advertising the standard Heart Rate service.
    pub fn add_heart_rate_sensor(&self) -> SimSensor {
        self.add_sensor(vec![HEART_RATE_SERVICE])
    }

    /// Make every subsequent scan fail with a transport error.
    pub fn set_scan_failure(&self, fail: bool) {
        self.scan_failure.store(fail, Ordering::SeqCst);
    }

    /// Number of scans performed so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of connection attempts made so far.
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    fn find(&self, id: &DeviceId) -> Option<Arc<SimSensorState>> {
        let sensors = self.sensors.lock().ok()?;
        sensors.iter().find(|s| &s.id == id).cloned()
    }
}

/// Test-side handle to a simulated sensor.
#[derive(Clone)]
pub struct SimSensor {
    state: Arc<SimSensorState>,
}

impl SimSensor {
    pub fn id(&self) -> &DeviceId {
        &self.state.id
    }

    /// Emit a Heart Rate Measurement notification.
    ///
    /// Returns `false` when nobody is subscribed.
    pub fn notify(&self, payload: &[u8]) -> bool {
        let handler = self
            .state
            .handlers
            .lock()
            .ok()
            .and_then(|h| h.get(&HEART_RATE_MEASUREMENT).cloned());
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    /// Move the sensor in or out of radio range. Going out of range drops
    /// every live link.
    pub fn set_in_range(&self, in_range: bool) {
        self.state.in_range.store(in_range, Ordering::SeqCst);
        if !in_range {
            self.state.links.store(0, Ordering::SeqCst);
            if let Ok(mut handlers) = self.state.handlers.lock() {
                handlers.clear();
            }
        }
    }

    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.state.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Number of live links to this sensor.
    pub fn link_count(&self) -> usize {
        self.state.links.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.state
            .handlers
            .lock()
            .map(|h| h.contains_key(&HEART_RATE_MEASUREMENT))
            .unwrap_or(false)
    }
}

/// A simulated GATT connection.
pub struct SimSensorConnection {
    state: Arc<SimSensorState>,
    open: AtomicBool,
}

impl SimSensorConnection {
    fn usable(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.state.in_range.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SensorConnection for SimSensorConnection {
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        if !self.usable() {
            return Err(BleError::Disconnected);
        }
        if self.state.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BleError::GattError(format!(
                "characteristic {} rejected subscription",
                characteristic
            )));
        }
        let mut handlers = self
            .state
            .handlers
            .lock()
            .map_err(|_| BleError::GattError("handler table poisoned".to_string()))?;
        handlers.insert(characteristic, handler);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), BleError> {
        if !self.usable() {
            return Err(BleError::Disconnected);
        }
        if let Ok(mut handlers) = self.state.handlers.lock() {
            handlers.remove(&characteristic);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        if let Ok(mut handlers) = self.state.handlers.lock() {
            handlers.clear();
        }
        let _ = self
            .state
            .links
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if !self.state.in_range.load(Ordering::SeqCst) {
            return Err(BleError::Disconnected);
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.usable()
    }

    fn device(&self) -> &DeviceId {
        &self.state.id
    }
}

#[async_trait]
impl SensorCentral for SimSensorNetwork {
    async fn discover(&self, service: Uuid, _timeout: Duration) -> Result<Vec<DeviceId>, BleError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if self.scan_failure.load(Ordering::SeqCst) {
            return Err(BleError::ScanError("simulated adapter failure".to_string()));
        }
        let sensors = self
            .sensors
            .lock()
            .map_err(|_| BleError::ScanError("sensor table poisoned".to_string()))?;
        Ok(sensors
            .iter()
            .filter(|s| s.in_range.load(Ordering::SeqCst) && s.services.contains(&service))
            .map(|s| s.id.clone())
            .collect())
    }

    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn SensorConnection>, BleError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let state = self
            .find(device)
            .ok_or_else(|| BleError::ConnectionError(format!("No sensor at {}", device)))?;
        if !state.in_range.load(Ordering::SeqCst) {
            return Err(BleError::Timeout);
        }
        if state.refuse_connections.load(Ordering::SeqCst) {
            return Err(BleError::ConnectionError(format!(
                "{} refused the connection",
                device
            )));
        }
        state.links.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimSensorConnection {
            state,
            open: AtomicBool::new(true),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU16;

    #[tokio::test]
    async fn test_discovery_filters_by_service() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let _speaker = network.add_sensor(vec![Uuid::new_v4()]);

        let found = network
            .discover(HEART_RATE_SERVICE, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found, vec![strap.id().clone()]);
        assert_eq!(network.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_sensor_is_invisible() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        strap.set_in_range(false);

        let found = network
            .discover(HEART_RATE_SERVICE, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(found.is_empty());
        assert!(matches!(
            network.connect(strap.id()).await,
            Err(BleError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_scan_failure() {
        let network = SimSensorNetwork::new();
        network.set_scan_failure(true);
        let result = network
            .discover(HEART_RATE_SERVICE, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(BleError::ScanError(_))));
    }

    #[tokio::test]
    async fn test_notifications_reach_subscriber() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let conn = network.connect(strap.id()).await.unwrap();

        assert!(!strap.notify(&[0x00, 70]));

        let last = Arc::new(AtomicU16::new(0));
        let sink = Arc::clone(&last);
        conn.subscribe(
            HEART_RATE_MEASUREMENT,
            Arc::new(move |data: &[u8]| sink.store(u16::from(data[1]), Ordering::SeqCst)),
        )
        .await
        .unwrap();

        assert!(strap.is_subscribed());
        assert!(strap.notify(&[0x00, 70]));
        assert_eq!(last.load(Ordering::SeqCst), 70);

        conn.unsubscribe(HEART_RATE_MEASUREMENT).await.unwrap();
        assert!(!strap.is_subscribed());
    }

    #[tokio::test]
    async fn test_disconnect_twice_reports_error() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let conn = network.connect(strap.id()).await.unwrap();
        assert_eq!(strap.link_count(), 1);
        assert!(conn.is_alive().await);

        conn.disconnect().await.unwrap();
        assert_eq!(strap.link_count(), 0);
        assert!(!conn.is_alive().await);
        assert!(matches!(conn.disconnect().await, Err(BleError::Disconnected)));
    }

    #[tokio::test]
    async fn test_leaving_range_kills_link() {
        let network = SimSensorNetwork::new();
        let strap = network.add_heart_rate_sensor();
        let conn = network.connect(strap.id()).await.unwrap();

        strap.set_in_range(false);
        assert!(!conn.is_alive().await);
        assert!(matches!(
            conn.subscribe(HEART_RATE_MEASUREMENT, Arc::new(|_: &[u8]| {})).await,
            Err(BleError::Disconnected)
        ));
    }
}
