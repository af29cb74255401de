//! AvatarSink: VRChat avatar parameters over OSC/UDP.
//!
//! Three parameters are written on every update:
//!
//! | address                          | type  | value                  |
//! |----------------------------------|-------|------------------------|
//! | `/avatar/parameters/HR`          | int   | bpm, 0 when absent     |
//! | `/avatar/parameters/HRPercent`   | float | `fraction(bpm)` or 0.0 |
//! | `/avatar/parameters/isHRConnected` | bool | sample present        |
//!
//! Sends are fire-and-forget datagrams from an unconnected socket, so a
//! closed target port does not surface as an error on the next send.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;

use rosc::{encoder, OscMessage, OscPacket, OscType};

use super::process::{ProcessProbe, VRCHAT_PROCESSES};
use crate::error::RelayError;
use crate::journal::ActivityLog;
use crate::types::HeartRateSample;

pub const PARAM_HEART_RATE: &str = "/avatar/parameters/HR";
pub const PARAM_PERCENT: &str = "/avatar/parameters/HRPercent";
pub const PARAM_CONNECTED: &str = "/avatar/parameters/isHRConnected";

pub struct AvatarSink {
    socket: Option<UdpSocket>,
    target: SocketAddr,
    probe: Arc<dyn ProcessProbe>,
    activity: ActivityLog,
    connected: bool,
}

impl AvatarSink {
    /// Bind an ephemeral local socket aimed at `target`. A bind failure is
    /// reported and leaves the sink not-connected.
    pub fn new(target: SocketAddr, probe: Arc<dyn ProcessProbe>, activity: ActivityLog) -> Self {
        let mut sink = Self {
            socket: None,
            target,
            probe,
            activity,
            connected: false,
        };
        sink.open();
        sink
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_game_running(&self) -> bool {
        self.probe.is_running(VRCHAT_PROCESSES)
    }

    /// Rebuild the transport, optionally towards a new target.
    pub fn reconnect(&mut self, target: SocketAddr) {
        self.target = target;
        self.socket = None;
        self.connected = false;
        self.open();
    }

    /// Write the three avatar parameters. Returns silently when VRChat is
    /// not running; a failed send marks the sink not-connected.
    pub fn update_parameters(&mut self, sample: Option<HeartRateSample>) {
        if !self.is_game_running() {
            return;
        }
        if !self.connected {
            return;
        }

        if let Err(e) = self.send_all(sample) {
            self.activity.record(format!("VRChat OSC error: {}", e));
            self.connected = false;
        }
    }

    fn open(&mut self) {
        match UdpSocket::bind(local_addr_for(self.target)) {
            Ok(socket) => {
                log::debug!("OSC socket bound to {:?}, target {}", socket.local_addr(), self.target);
                self.socket = Some(socket);
                self.connected = true;
                self.activity
                    .record(format!("VRChat OSC ready on {}", self.target));
            }
            Err(e) => {
                self.activity
                    .record(format!("Failed to create VRChat OSC client: {}", e));
            }
        }
    }

    fn send_all(&self, sample: Option<HeartRateSample>) -> Result<(), RelayError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| RelayError::State("OSC socket missing".to_string()))?;

        for message in parameter_messages(sample) {
            let packet = encoder::encode(&OscPacket::Message(message))
                .map_err(|e| RelayError::Protocol(format!("OSC encode failed: {:?}", e)))?;
            socket.send_to(&packet, self.target)?;
        }
        Ok(())
    }
}

/// Ephemeral local address in the same family as `target`.
fn local_addr_for(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

/// The OSC messages describing `sample`; `None` reports a disconnected
/// sensor.
pub fn parameter_messages(sample: Option<HeartRateSample>) -> Vec<OscMessage> {
    let (bpm, percent, connected) = match sample {
        Some(sample) => (i32::from(sample.bpm()), sample.fraction(), true),
        None => (0, 0.0, false),
    };
    vec![
        OscMessage {
            addr: PARAM_HEART_RATE.to_string(),
            args: vec![OscType::Int(bpm)],
        },
        OscMessage {
            addr: PARAM_PERCENT.to_string(),
            args: vec![OscType::Float(percent)],
        },
        OscMessage {
            addr: PARAM_CONNECTED.to_string(),
            args: vec![OscType::Bool(connected)],
        },
    ]
}
