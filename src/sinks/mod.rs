//! Output sinks for heart-rate readings.

pub mod avatar;
pub mod presence;
pub mod process;

pub use avatar::AvatarSink;
pub use presence::{
    DiscordConnector, PresenceClient, PresenceConnector, PresenceImages, PresencePayload,
    PresenceSink,
};
pub use process::{ProcessProbe, SystemProbe, DISCORD_PROCESSES, VRCHAT_PROCESSES};
