// heartrelay - heart-rate relay to Discord Rich Presence and VRChat OSC

pub mod ble;
pub mod cloud;
pub mod config;
pub mod error;
pub mod flow;
pub mod journal;
pub mod monitor;
pub mod sinks;
pub mod types;

pub use config::{RelayContext, Settings, SourceSelection};
pub use error::RelayError;
pub use flow::SampleBus;
pub use monitor::{Command, DisplayEvent, Relay, RelayDeps};
pub use types::HeartRateSample;
