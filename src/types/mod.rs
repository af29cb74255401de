pub mod heartrate;

pub use heartrate::{decode_measurement, fraction, HeartRateSample};

/// Lifecycle of a connection owned by the device link or a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}
