//! Settings file and the shared relay context.
//!
//! `Settings` is the persisted JSON document. `RelayContext` is the single
//! lock-guarded object the orchestration, the consumption cycle and the
//! presentation layer share; hot flags live in atomics so the per-cycle
//! reads never contend with the rare writes.

use std::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::RelayError;

pub const DEFAULT_CONFIG_FILE: &str = "heartrate_config.json";
pub const DEFAULT_DISCORD_CLIENT_ID: &str = "1285817369662328904";
pub const DEFAULT_OSC_ADDRESS: &str = "127.0.0.1:9000";

/// Where heart-rate readings come from. Exactly one is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceSelection {
    /// Pulsoid cloud service.
    #[default]
    #[serde(rename = "pulsoid")]
    CloudPush,
    /// Local BLE heart-rate strap.
    #[serde(rename = "bluetooth")]
    LocalSensor,
}

impl SourceSelection {
    fn to_u8(self) -> u8 {
        match self {
            SourceSelection::CloudPush => 0,
            SourceSelection::LocalSensor => 1,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SourceSelection::LocalSensor,
            _ => SourceSelection::CloudPush,
        }
    }
}

impl fmt::Display for SourceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSelection::CloudPush => write!(f, "Pulsoid"),
            SourceSelection::LocalSensor => write!(f, "Bluetooth"),
        }
    }
}

impl FromStr for SourceSelection {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pulsoid" | "cloud" => Ok(SourceSelection::CloudPush),
            "bluetooth" | "ble" | "sensor" => Ok(SourceSelection::LocalSensor),
            other => Err(RelayError::Config(format!(
                "unknown heart rate source '{}' (expected pulsoid or bluetooth)",
                other
            ))),
        }
    }
}

/// Persisted application settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub theme: String,
    pub pulsoid_api_key: String,
    pub discord_client_id: String,
    pub large_image: Option<String>,
    pub small_image: Option<String>,
    pub discord_enabled: bool,
    pub vrchat_enabled: bool,
    pub hr_source: SourceSelection,
    pub osc_address: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            theme: "dark".to_string(),
            pulsoid_api_key: String::new(),
            discord_client_id: DEFAULT_DISCORD_CLIENT_ID.to_string(),
            large_image: None,
            small_image: None,
            discord_enabled: true,
            vrchat_enabled: true,
            hr_source: SourceSelection::CloudPush,
            osc_address: DEFAULT_OSC_ADDRESS.to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// A missing file yields defaults. A file that cannot be read or parsed
    /// also yields defaults, with a warning.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                log::info!("No settings at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                log::warn!(
                    "Error loading settings from {}: {}. Using default configuration.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Like `load`, but reports unreadable or malformed files.
    pub fn try_load(path: &Path) -> Result<Option<Self>, RelayError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&raw)?;
        Ok(Some(settings))
    }

    pub fn save(&self, path: &Path) -> Result<(), RelayError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Discord client id, falling back to the built-in application.
    pub fn client_id(&self) -> &str {
        if self.discord_client_id.trim().is_empty() {
            DEFAULT_DISCORD_CLIENT_ID
        } else {
            self.discord_client_id.trim()
        }
    }

    pub fn osc_target(&self) -> Result<SocketAddr, RelayError> {
        self.osc_address.parse().map_err(|e| {
            RelayError::Config(format!("invalid OSC address '{}': {}", self.osc_address, e))
        })
    }
}

/// Shared state passed explicitly to every part of the relay.
pub struct RelayContext {
    settings: RwLock<Settings>,
    config_path: Option<PathBuf>,
    source: AtomicU8,
    presence_enabled: AtomicBool,
    avatar_enabled: AtomicBool,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl RelayContext {
    pub fn new(settings: Settings, config_path: Option<PathBuf>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            source: AtomicU8::new(settings.hr_source.to_u8()),
            presence_enabled: AtomicBool::new(settings.discord_enabled),
            avatar_enabled: AtomicBool::new(settings.vrchat_enabled),
            running: AtomicBool::new(true),
            settings: RwLock::new(settings),
            config_path,
            shutdown_tx,
        }
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace every setting at once and resync the hot flags.
    pub fn replace_settings(&self, settings: Settings) {
        self.source.store(settings.hr_source.to_u8(), Ordering::SeqCst);
        self.presence_enabled
            .store(settings.discord_enabled, Ordering::SeqCst);
        self.avatar_enabled
            .store(settings.vrchat_enabled, Ordering::SeqCst);
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    fn edit_settings(&self, edit: impl FnOnce(&mut Settings)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        edit(&mut settings);
    }

    pub fn source(&self) -> SourceSelection {
        SourceSelection::from_u8(self.source.load(Ordering::SeqCst))
    }

    pub fn set_source(&self, source: SourceSelection) {
        self.source.store(source.to_u8(), Ordering::SeqCst);
        self.edit_settings(|s| s.hr_source = source);
    }

    pub fn presence_enabled(&self) -> bool {
        self.presence_enabled.load(Ordering::SeqCst)
    }

    pub fn set_presence_enabled(&self, enabled: bool) {
        self.presence_enabled.store(enabled, Ordering::SeqCst);
        self.edit_settings(|s| s.discord_enabled = enabled);
    }

    pub fn avatar_enabled(&self) -> bool {
        self.avatar_enabled.load(Ordering::SeqCst)
    }

    pub fn set_avatar_enabled(&self, enabled: bool) {
        self.avatar_enabled.store(enabled, Ordering::SeqCst);
        self.edit_settings(|s| s.vrchat_enabled = enabled);
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Persist the current settings to the config path, if there is one.
    pub fn save(&self) -> Result<(), RelayError> {
        match &self.config_path {
            Some(path) => self.settings().save(path),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip the running flag and wake every loop waiting on the shutdown signal.
    pub fn request_shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
    }

    /// Receiver that changes once shutdown has been requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}
