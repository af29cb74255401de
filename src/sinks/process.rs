//! Host process liveness checks.
//!
//! The presence sink only talks to Discord while a Discord client is
//! running, and the avatar sink only sends while VRChat is running. Both
//! ask a `ProcessProbe` on every call.

use std::sync::{Mutex, PoisonError};

use sysinfo::{ProcessRefreshKind, System};

/// Executable names of the Discord desktop clients (stable, PTB, Canary)
/// as they appear on Windows, Linux and macOS.
pub const DISCORD_PROCESSES: &[&str] = &[
    "discord.exe",
    "discord ptb.exe",
    "discord canary.exe",
    "discord",
    "discordptb",
    "discordcanary",
    "discord ptb",
    "discord canary",
];

pub const VRCHAT_PROCESSES: &[&str] = &["vrchat.exe"];

pub trait ProcessProbe: Send + Sync {
    /// Whether any running process matches one of `names` (case-insensitive).
    fn is_running(&self, names: &[&str]) -> bool;
}

/// Probe backed by the OS process table.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn is_running(&self, names: &[&str]) -> bool {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        // Names only: no CPU, memory or disk figures.
        system.refresh_processes_specifics(ProcessRefreshKind::new());
        let found = system
            .processes()
            .values()
            .any(|process| matches_any(process.name(), names));
        found
    }
}

fn matches_any(process_name: &str, names: &[&str]) -> bool {
    names
        .iter()
        .any(|name| process_name.eq_ignore_ascii_case(name))
}
