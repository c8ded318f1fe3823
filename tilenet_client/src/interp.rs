//! Interpolation.
//!
//! The server sends `PlayerState` at tick boundaries; the client renders at
//! its own rate. Each update rotates `simulation` into `previous`, and between
//! updates `display` is blended from `previous` towards `simulation` by the
//! fraction of a tick that has elapsed.

use std::time::{Duration, Instant};

use tilenet_shared::{
    entity::{EntityState, PlayerBody},
    math::Rect,
};

/// Tracks update timing and writes display snapshots.
#[derive(Debug, Clone)]
pub struct Smoother {
    tick_interval: Duration,
    last_update: Option<Instant>,
}

impl Smoother {
    pub fn new(tick_hz: u32) -> Self {
        Self {
            tick_interval: Duration::from_secs_f32(1.0 / tick_hz.max(1) as f32),
            last_update: None,
        }
    }

    /// Records that authoritative state arrived at `now`.
    pub fn mark_update(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    /// Blend factor in `[0, 1]` for rendering at `now`. Before any update the
    /// display shows the simulation as is.
    pub fn alpha(&self, now: Instant) -> f32 {
        match self.last_update {
            Some(at) => {
                let elapsed = now.saturating_duration_since(at);
                (elapsed.as_secs_f32() / self.tick_interval.as_secs_f32()).clamp(0.0, 1.0)
            }
            None => 1.0,
        }
    }

    /// `display := lerp(previous, simulation, alpha)`. Only `display` is
    /// written.
    pub fn apply(body: &mut PlayerBody, alpha: f32) {
        let (from, to) = (body.previous, body.simulation);
        let position = from.position.lerp(to.position, alpha);
        body.display = EntityState {
            position,
            velocity: from.velocity.lerp(to.velocity, alpha),
            intent: to.intent,
            bounds: Rect::centered(position, body.extents()),
        };
    }

    /// `display := simulation`.
    pub fn snap(body: &mut PlayerBody) {
        body.display = body.simulation;
    }
}
