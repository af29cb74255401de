//! btleplug-backed BLE central for real heart-rate straps.
//!
//! Compiled only with the `ble-central` feature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::transport::{DeviceId, NotificationHandler, SensorCentral, SensorConnection};
use super::BleError;

/// Central bound to the first Bluetooth adapter on the host.
pub struct BtleCentral {
    adapter: Adapter,
    /// Peripherals seen by the last scan, keyed by the id handed out.
    known: Mutex<HashMap<DeviceId, Peripheral>>,
}

impl BtleCentral {
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)?;
        Ok(Self {
            adapter,
            known: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl SensorCentral for BtleCentral {
    async fn discover(&self, service: Uuid, timeout: Duration) -> Result<Vec<DeviceId>, BleError> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("stop_scan failed: {}", e);
        }

        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::ScanError(e.to_string()))?;

        // Some backends ignore the scan filter, so check advertised services too.
        let mut found = Vec::new();
        for peripheral in peripherals {
            let advertises = match peripheral.properties().await {
                Ok(Some(props)) => props.services.contains(&service),
                _ => false,
            };
            if advertises {
                let id = DeviceId::Hardware(format!("{:?}", peripheral.id()));
                found.push((id, peripheral));
            }
        }

        let mut known = self
            .known
            .lock()
            .map_err(|_| BleError::ScanError("peripheral table poisoned".to_string()))?;
        known.clear();
        Ok(found
            .into_iter()
            .map(|(id, peripheral)| {
                known.insert(id.clone(), peripheral);
                id
            })
            .collect())
    }

    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn SensorConnection>, BleError> {
        let peripheral = self
            .known
            .lock()
            .map_err(|_| BleError::ConnectionError("peripheral table poisoned".to_string()))?
            .get(device)
            .cloned()
            .ok_or_else(|| BleError::ConnectionError(format!("{} has not been discovered", device)))?;

        peripheral
            .connect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))?;
        if let Err(e) = peripheral.discover_services().await {
            if let Err(close) = peripheral.disconnect().await {
                log::debug!("Disconnect after failed service discovery failed: {}", close);
            }
            return Err(BleError::GattError(e.to_string()));
        }

        Ok(Box::new(BtleConnection {
            peripheral,
            device: device.clone(),
            pump: Mutex::new(None),
        }))
    }
}

/// A live btleplug connection; notifications are pumped by a spawned task.
pub struct BtleConnection {
    peripheral: Peripheral,
    device: DeviceId,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleConnection {
    fn stop_pump(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for BtleConnection {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

#[async_trait]
impl SensorConnection for BtleConnection {
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), BleError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                BleError::GattError(format!("characteristic {} not found", characteristic))
            })?;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))?;

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == characteristic {
                    handler(&notification.value);
                }
            }
        });

        self.stop_pump();
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), BleError> {
        self.stop_pump();
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic)
            .ok_or_else(|| {
                BleError::GattError(format!("characteristic {} not found", characteristic))
            })?;
        self.peripheral
            .unsubscribe(&target)
            .await
            .map_err(|e| BleError::GattError(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.stop_pump();
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| BleError::ConnectionError(e.to_string()))
    }

    async fn is_alive(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    fn device(&self) -> &DeviceId {
        &self.device
    }
}
