//! Acquisition loop: keeps the active source producing samples.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use super::ACQUISITION_INTERVAL;
use crate::ble::link::SCAN_TIMEOUT;
use crate::ble::DeviceLink;
use crate::cloud::CloudSource;
use crate::config::{RelayContext, SourceSelection};
use crate::flow::SampleBus;
use crate::journal::ActivityLog;

pub struct Acquisition {
    ctx: Arc<RelayContext>,
    link: Arc<Mutex<DeviceLink>>,
    cloud: Arc<dyn CloudSource>,
    bus: Arc<SampleBus>,
    activity: ActivityLog,
    active: Option<SourceSelection>,
    reported_missing_key: bool,
}

impl Acquisition {
    pub fn new(
        ctx: Arc<RelayContext>,
        link: Arc<Mutex<DeviceLink>>,
        cloud: Arc<dyn CloudSource>,
        bus: Arc<SampleBus>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            ctx,
            link,
            cloud,
            bus,
            activity,
            active: None,
            reported_missing_key: false,
        }
    }

    /// One acquisition step for whichever source is currently selected.
    pub async fn cycle(&mut self) {
        let source = self.ctx.source();
        if self.active != Some(source) {
            self.activate(source).await;
        }

        match source {
            SourceSelection::LocalSensor => self.acquire_sensor().await,
            SourceSelection::CloudPush => self.acquire_cloud().await,
        }
    }

    /// Run until shutdown is signalled. A cycle in progress is allowed to
    /// finish; the wait between cycles is cut short.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::debug!("Acquisition loop started");
        while self.ctx.is_running() {
            self.cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(ACQUISITION_INTERVAL) => {}
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Acquisition loop stopped");
    }

    async fn activate(&mut self, source: SourceSelection) {
        log::debug!("Activating {} source (was {:?})", source, self.active);
        if source != SourceSelection::LocalSensor {
            self.link.lock().await.disconnect().await;
        }
        self.reported_missing_key = false;
        self.active = Some(source);
    }

    async fn acquire_sensor(&mut self) {
        let mut link = self.link.lock().await;
        link.reap_if_lost().await;
        if link.is_connected() || link.is_scanning() {
            return;
        }

        let found = link.scan(SCAN_TIMEOUT).await;
        if self.ctx.source() != SourceSelection::LocalSensor {
            return;
        }
        if let Some(device) = found.into_iter().next() {
            link.connect(device).await;
        }
    }

    async fn acquire_cloud(&mut self) {
        let api_key = self.ctx.settings().pulsoid_api_key;
        if api_key.trim().is_empty() {
            if !self.reported_missing_key {
                self.activity
                    .record("Pulsoid API key is not set. Add it in the settings.");
                self.reported_missing_key = true;
            }
            return;
        }
        self.reported_missing_key = false;

        if let Some(sample) = self.cloud.poll(api_key.trim()).await {
            // Drop a reading that raced a switch away from the cloud.
            if self.ctx.source() == SourceSelection::CloudPush {
                self.bus.publish(sample);
            }
        }
    }
}
