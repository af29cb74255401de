//! Activity feed and daily JSON journals.
//!
//! Every human-readable activity line goes three places: the `log` facade,
//! the presentation layer (as `DisplayEvent::Activity`) and, when enabled,
//! `activity_YYYY-MM-DD.json`. Heart-rate readings are journaled separately
//! in `heartrate_YYYY-MM-DD.json`. Both files hold `{"logs": [...]}`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::monitor::{DisplayChannel, DisplayEvent};
use crate::types::HeartRateSample;

pub const DEFAULT_LOG_DIR: &str = "HeartRate_Logs";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: String,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartRateEntry {
    pub timestamp: String,
    pub heart_rate: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalDocument {
    #[serde(default)]
    logs: Vec<serde_json::Value>,
}

/// Daily JSON journals in a single directory.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    /// Serializes read-modify-write cycles on the journal files.
    write_lock: Mutex<()>,
}

impl Journal {
    /// Open (creating if needed) the journal directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn activity_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("activity_{}.json", date.format("%Y-%m-%d")))
    }

    pub fn heart_rate_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("heartrate_{}.json", date.format("%Y-%m-%d")))
    }

    pub fn record_activity(&self, message: &str) -> Result<(), RelayError> {
        self.record_activity_at(message, Local::now())
    }

    pub fn record_activity_at(&self, message: &str, at: DateTime<Local>) -> Result<(), RelayError> {
        let entry = ActivityEntry {
            timestamp: at.to_rfc3339(),
            message: message.to_string(),
        };
        self.append(&self.activity_path(at.date_naive()), serde_json::to_value(entry)?)
    }

    pub fn record_heart_rate(&self, sample: HeartRateSample) -> Result<(), RelayError> {
        self.record_heart_rate_at(sample, Local::now())
    }

    pub fn record_heart_rate_at(
        &self,
        sample: HeartRateSample,
        at: DateTime<Local>,
    ) -> Result<(), RelayError> {
        let entry = HeartRateEntry {
            timestamp: at.to_rfc3339(),
            heart_rate: sample.bpm(),
        };
        self.append(&self.heart_rate_path(at.date_naive()), serde_json::to_value(entry)?)
    }

    fn append(&self, path: &Path, entry: serde_json::Value) -> Result<(), RelayError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        // A corrupt or unreadable file starts over rather than blocking logging.
        let mut document = fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<JournalDocument>(&raw).ok())
            .unwrap_or_default();
        document.logs.push(entry);

        fs::write(path, serde_json::to_string_pretty(&document)?)?;
        Ok(())
    }
}

/// Cloneable handle every component uses to report what it is doing.
#[derive(Clone, Default)]
pub struct ActivityLog {
    display: DisplayChannel,
    journal: Option<Arc<Journal>>,
}

impl ActivityLog {
    pub fn new(display: DisplayChannel, journal: Option<Journal>) -> Self {
        Self {
            display,
            journal: journal.map(Arc::new),
        }
    }

    /// An activity log that only writes to the `log` facade.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn display(&self) -> &DisplayChannel {
        &self.display
    }

    pub fn record(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{}", message);
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_activity(&message) {
                log::warn!("Failed to write activity journal: {}", e);
            }
        }
        self.display.emit(DisplayEvent::Activity(message));
    }

    pub fn record_heart_rate(&self, sample: HeartRateSample) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_heart_rate(sample) {
                log::warn!("Failed to write heart rate journal: {}", e);
            }
        }
    }
}
