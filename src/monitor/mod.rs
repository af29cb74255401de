//! Orchestration of the relay.
//!
//! Two tasks run side by side. The acquisition loop (every 5 s) drives the
//! active source and is the producer side of the `SampleBus`; the
//! consumption cycle (every 1 s) drains the bus and fans the newest sample
//! out to the display and the sinks. The presentation layer talks to the
//! relay only through `Command`s and listens to `DisplayEvent`s.

pub mod acquire;
pub mod consume;
pub mod relay;

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::{Settings, SourceSelection};
use crate::types::HeartRateSample;

pub use acquire::Acquisition;
pub use consume::Consumer;
pub use relay::{Relay, RelayDeps};

pub const ACQUISITION_INTERVAL: Duration = Duration::from_secs(5);
pub const CONSUMPTION_INTERVAL: Duration = Duration::from_secs(1);
/// How long the last known sample is shown once the source goes quiet.
pub const STALE_AFTER: Duration = Duration::from_secs(10);
/// Bounded wait for the loops to exit on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// User intents dispatched into the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetSource(SourceSelection),
    SetPresenceEnabled(bool),
    SetAvatarEnabled(bool),
    ApplySettings(Settings),
    Shutdown,
}

/// Display updates emitted by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEvent {
    HeartRate(Option<HeartRateSample>),
    StatusDots { presence: bool, avatar: bool },
    Activity(String),
}

/// Sending half of the display channel. The default channel has no
/// receiver and drops every event.
#[derive(Clone, Debug, Default)]
pub struct DisplayChannel {
    tx: Option<mpsc::UnboundedSender<DisplayEvent>>,
}

impl DisplayChannel {
    pub fn new(tx: mpsc::UnboundedSender<DisplayEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Create a channel together with its receiving end.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<DisplayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: DisplayEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver just means nobody is watching any more.
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_channel_drops_events() {
        let channel = DisplayChannel::default();
        channel.emit(DisplayEvent::Activity("dropped".to_string()));
    }

    #[test]
    fn test_pair_delivers_in_order() {
        let (channel, mut rx) = DisplayChannel::pair();
        channel.emit(DisplayEvent::HeartRate(HeartRateSample::new(70)));
        channel.emit(DisplayEvent::StatusDots {
            presence: true,
            avatar: false,
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            DisplayEvent::HeartRate(HeartRateSample::new(70))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            DisplayEvent::StatusDots {
                presence: true,
                avatar: false
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (channel, rx) = DisplayChannel::pair();
        drop(rx);
        channel.emit(DisplayEvent::HeartRate(None));
    }
}
