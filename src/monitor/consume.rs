//! Consumption cycle: bus → display and sinks.
//!
//! Sink calls are blocking (IPC pipe, process table, UDP send), so the
//! relay runs each cycle on the blocking pool.

use std::sync::Arc;
use std::time::Instant;

use super::{DisplayEvent, STALE_AFTER};
use crate::config::{RelayContext, SourceSelection};
use crate::flow::SampleBus;
use crate::journal::ActivityLog;
use crate::sinks::{AvatarSink, PresenceSink};
use crate::types::HeartRateSample;

pub struct Consumer {
    ctx: Arc<RelayContext>,
    bus: Arc<SampleBus>,
    presence: PresenceSink,
    avatar: AvatarSink,
    activity: ActivityLog,
    last_known: Option<(HeartRateSample, Instant)>,
    source: SourceSelection,
}

impl Consumer {
    pub fn new(
        ctx: Arc<RelayContext>,
        bus: Arc<SampleBus>,
        presence: PresenceSink,
        avatar: AvatarSink,
        activity: ActivityLog,
    ) -> Self {
        let source = ctx.source();
        Self {
            ctx,
            bus,
            presence,
            avatar,
            activity,
            last_known: None,
            source,
        }
    }

    pub fn presence(&self) -> &PresenceSink {
        &self.presence
    }

    pub fn presence_mut(&mut self) -> &mut PresenceSink {
        &mut self.presence
    }

    pub fn avatar(&self) -> &AvatarSink {
        &self.avatar
    }

    pub fn avatar_mut(&mut self) -> &mut AvatarSink {
        &mut self.avatar
    }

    /// Forget the last known reading and anything still on the bus.
    pub fn reset_sample(&mut self) {
        self.last_known = None;
        self.bus.clear();
    }

    /// The reading to show at `now`, if it is not stale.
    pub fn current_sample(&self, now: Instant) -> Option<HeartRateSample> {
        self.last_known
            .filter(|(_, at)| now.saturating_duration_since(*at) <= STALE_AFTER)
            .map(|(sample, _)| sample)
    }

    /// Run one cycle and return the reading that was fanned out.
    pub fn cycle(&mut self, now: Instant) -> Option<HeartRateSample> {
        let source = self.ctx.source();
        if source != self.source {
            self.source = source;
            self.reset_sample();
        }

        if let Some(sample) = self.bus.take() {
            self.last_known = Some((sample, now));
            self.activity.record_heart_rate(sample);
        }
        let sample = self.current_sample(now);

        let display = self.activity.display();
        display.emit(DisplayEvent::HeartRate(sample));

        let game_running = self.avatar.is_game_running();
        if self.ctx.presence_enabled() {
            self.presence.update_presence(sample, game_running);
        }
        if self.ctx.avatar_enabled() {
            self.avatar.update_parameters(sample);
        }

        display.emit(DisplayEvent::StatusDots {
            presence: self.presence.is_connected(),
            avatar: self.avatar.is_connected() && game_running,
        });
        sample
    }
}
