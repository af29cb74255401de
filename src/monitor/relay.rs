//! The relay: wires sources, bus and sinks together and owns their tasks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::acquire::Acquisition;
use super::consume::Consumer;
use super::{Command, CONSUMPTION_INTERVAL, SHUTDOWN_GRACE};
use crate::ble::{DeviceLink, SensorCentral};
use crate::cloud::CloudSource;
use crate::config::{RelayContext, Settings, SourceSelection};
use crate::error::RelayError;
use crate::flow::SampleBus;
use crate::journal::ActivityLog;
use crate::sinks::{AvatarSink, PresenceConnector, PresenceImages, PresenceSink, ProcessProbe};
use crate::types::ConnectionState;

/// External collaborators the relay is built from.
pub struct RelayDeps {
    pub central: Arc<dyn SensorCentral>,
    pub cloud: Arc<dyn CloudSource>,
    pub presence: Arc<dyn PresenceConnector>,
    pub probe: Arc<dyn ProcessProbe>,
}

pub struct Relay {
    ctx: Arc<RelayContext>,
    bus: Arc<SampleBus>,
    link: Arc<AsyncMutex<DeviceLink>>,
    consumer: Arc<Mutex<Consumer>>,
    cloud: Arc<dyn CloudSource>,
    activity: ActivityLog,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn images_of(settings: &Settings) -> PresenceImages {
    PresenceImages::new(settings.large_image.clone(), settings.small_image.clone())
}

impl Relay {
    /// Build every component from the current settings. Fails only on
    /// misconfiguration (an unparseable OSC address).
    pub fn new(
        ctx: Arc<RelayContext>,
        deps: RelayDeps,
        activity: ActivityLog,
    ) -> Result<Self, RelayError> {
        let settings = ctx.settings();
        let target = settings.osc_target()?;
        let bus = Arc::new(SampleBus::new());

        let link = DeviceLink::new(deps.central, Arc::clone(&bus), activity.clone());
        let presence = PresenceSink::new(
            deps.presence,
            Arc::clone(&deps.probe),
            activity.clone(),
            settings.client_id(),
            images_of(&settings),
        );
        let avatar = AvatarSink::new(target, deps.probe, activity.clone());
        let consumer = Consumer::new(
            Arc::clone(&ctx),
            Arc::clone(&bus),
            presence,
            avatar,
            activity.clone(),
        );

        Ok(Self {
            ctx,
            bus,
            link: Arc::new(AsyncMutex::new(link)),
            consumer: Arc::new(Mutex::new(consumer)),
            cloud: deps.cloud,
            activity,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    pub fn bus(&self) -> &Arc<SampleBus> {
        &self.bus
    }

    pub async fn link_state(&self) -> ConnectionState {
        self.link.lock().await.state()
    }

    pub fn presence_state(&self) -> ConnectionState {
        self.lock_consumer().presence().state()
    }

    pub fn avatar_connected(&self) -> bool {
        self.lock_consumer().avatar().is_connected()
    }

    /// Run one consumption cycle inline.
    pub fn consume_now(&self) {
        self.lock_consumer().cycle(Instant::now());
    }

    fn lock_consumer(&self) -> std::sync::MutexGuard<'_, Consumer> {
        self.consumer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the consumer on the blocking pool.
    async fn with_consumer<F>(&self, f: F)
    where
        F: FnOnce(&mut Consumer) + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = consumer.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard);
        })
        .await;
        if let Err(e) = result {
            log::error!("Sink operation panicked: {}", e);
        }
    }

    /// Connect the presence sink if enabled, then spawn the acquisition
    /// loop and the consumption cycle.
    pub async fn start(self: &Arc<Self>) {
        if self.ctx.presence_enabled() {
            self.with_consumer(|c| c.presence_mut().connect()).await;
        }

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        // Acquisition loop
        {
            let acquisition = Acquisition::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.link),
                Arc::clone(&self.cloud),
                Arc::clone(&self.bus),
                self.activity.clone(),
            );
            let shutdown = self.ctx.shutdown_signal();
            tasks.push(tokio::spawn(acquisition.run(shutdown)));
        }

        // Consumption cycle
        {
            let ctx = Arc::clone(&self.ctx);
            let consumer = Arc::clone(&self.consumer);
            let mut shutdown = self.ctx.shutdown_signal();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CONSUMPTION_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                while ctx.is_running() {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    let consumer = Arc::clone(&consumer);
                    let result = tokio::task::spawn_blocking(move || {
                        let mut guard = consumer.lock().unwrap_or_else(PoisonError::into_inner);
                        guard.cycle(Instant::now());
                    })
                    .await;
                    if let Err(e) = result {
                        log::error!("Consumption cycle failed: {}", e);
                    }
                }
                log::debug!("Consumption cycle stopped");
            }));
        }
    }

    /// Apply a user command.
    pub async fn dispatch(&self, command: Command) {
        log::debug!("dispatch {:?}", command);
        match command {
            Command::SetSource(source) => self.set_source(source).await,
            Command::SetPresenceEnabled(enabled) => {
                self.ctx.set_presence_enabled(enabled);
                if enabled {
                    self.with_consumer(|c| c.presence_mut().connect()).await;
                } else {
                    self.with_consumer(|c| c.presence_mut().close()).await;
                }
                self.activity.record(format!(
                    "Discord presence {}.",
                    if enabled { "enabled" } else { "disabled" }
                ));
            }
            Command::SetAvatarEnabled(enabled) => {
                let ctx = Arc::clone(&self.ctx);
                self.with_consumer(move |c| {
                    if !enabled && ctx.avatar_enabled() {
                        // Leave the avatar showing "no heart rate", not the last reading.
                        c.avatar_mut().update_parameters(None);
                    }
                    ctx.set_avatar_enabled(enabled);
                })
                .await;
                self.activity.record(format!(
                    "VRChat OSC {}.",
                    if enabled { "enabled" } else { "disabled" }
                ));
            }
            Command::ApplySettings(settings) => self.apply_settings(settings).await,
            Command::Shutdown => self.shutdown().await,
        }
    }

    async fn set_source(&self, source: SourceSelection) {
        self.ctx.set_source(source);
        self.source_changed(source).await;
    }

    /// Drop the previous source's reading and its sensor link, if any.
    async fn source_changed(&self, source: SourceSelection) {
        self.activity
            .record(format!("Heart rate source changed to {}.", source));
        self.with_consumer(|c| c.reset_sample()).await;
        if source != SourceSelection::LocalSensor {
            self.link.lock().await.disconnect().await;
        }
    }

    async fn apply_settings(&self, settings: Settings) {
        let previous = self.ctx.settings();
        let source_changed = previous.hr_source != settings.hr_source;
        let target = match settings.osc_target() {
            Ok(target) => Some(target),
            Err(e) => {
                self.activity
                    .record(format!("Ignoring OSC address: {}", e));
                None
            }
        };

        self.ctx.replace_settings(settings.clone());
        if let Err(e) = self.ctx.save() {
            self.activity
                .record(format!("Failed to save settings: {}", e));
        }
        self.activity.record("Settings applied.");

        let presence_enabled = settings.discord_enabled;
        self.with_consumer(move |c| {
            let presence = c.presence_mut();
            presence.configure(settings.client_id(), images_of(&settings));
            if presence_enabled && !presence.is_connected() {
                presence.connect();
            } else if !presence_enabled && presence.is_connected() {
                presence.close();
            }

            if let Some(target) = target {
                let avatar = c.avatar_mut();
                if target != avatar.target() || !avatar.is_connected() {
                    avatar.reconnect(target);
                }
            }
        })
        .await;

        if source_changed {
            self.source_changed(self.ctx.source()).await;
        }
    }

    /// Stop both loops (bounded wait), then close the presence sink and
    /// the sensor link. Presence calls bound themselves, so the consumer
    /// lock is never held for long. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.ctx.request_shutdown();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                log::warn!("Relay task did not stop within {:?}; aborting", SHUTDOWN_GRACE);
                task.abort();
            }
        }

        let close = self.with_consumer(|c| c.presence_mut().close());
        if tokio::time::timeout(SHUTDOWN_GRACE, close).await.is_err() {
            log::warn!("Discord presence did not close within {:?}; skipping", SHUTDOWN_GRACE);
        }
        self.link.lock().await.disconnect().await;
        log::info!("Relay stopped");
    }
}
