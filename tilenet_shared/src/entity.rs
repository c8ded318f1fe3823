//! Entity state buffers for prediction and interpolation.
//!
//! A [`PlayerBody`] keeps three snapshots of the same [`EntityState`]:
//! - `simulation`: authoritative physics truth, advanced once per tick;
//! - `previous`: `simulation` as it was right before the latest tick;
//! - `display`: what renderers draw, written only by smoothing code.
//!
//! The body is shared by server and client. Side-specific data is attached by
//! wrapping it (see `ServerPlayer` in the server crate and `RemotePlayer` in
//! the client crate).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::{
    math::{Rect, Vec2},
    physics::{CollisionMap, PhysicsBackend},
};

/// Physics state of one entity at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityState {
    pub position: Vec2,
    pub velocity: Vec2,
    /// Movement intent, each axis in `[-1, 1]`. Negative y asks for a jump.
    pub intent: Vec2,
    pub bounds: Rect,
}

impl EntityState {
    pub fn at(position: Vec2, extents: Vec2) -> Self {
        Self {
            position,
            bounds: Rect::centered(position, extents),
            ..Default::default()
        }
    }
}

bitflags! {
    /// Discrete physics flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PhysicsFlags: u8 {
        const GROUNDED = 1 << 0;
        const JUMPING = 1 << 1;
        /// `JUMPING` as it was before the latest tick.
        const WAS_JUMPING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Facing {
    Left,
    #[default]
    Right,
}

/// Shared physics/state fields of a player entity.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerBody {
    pub simulation: EntityState,
    pub display: EntityState,
    pub previous: EntityState,
    pub flags: PhysicsFlags,
    /// Seconds spent standing still; reset by any movement.
    pub idle_timer: f32,
    pub facing: Facing,
    extents: Vec2,
}

impl PlayerBody {
    /// All three snapshots start equal.
    pub fn new(position: Vec2, extents: Vec2) -> Self {
        let state = EntityState::at(position, extents);
        Self {
            simulation: state,
            display: state,
            previous: state,
            flags: PhysicsFlags::empty(),
            idle_timer: 0.0,
            facing: Facing::default(),
            extents,
        }
    }

    pub fn extents(&self) -> Vec2 {
        self.extents
    }

    /// Advances the simulation by one tick.
    ///
    /// `previous` receives a copy of `simulation` and `WAS_JUMPING` the
    /// current `JUMPING` before `backend` runs. `display` is left alone.
    pub fn tick(&mut self, backend: &dyn PhysicsBackend, map: &dyn CollisionMap, dt_sec: f32) {
        self.previous = self.simulation;
        let jumping = self.flags.contains(PhysicsFlags::JUMPING);
        self.flags.set(PhysicsFlags::WAS_JUMPING, jumping);
        backend.step(self, map, dt_sec);
    }

    pub fn set_intent(&mut self, intent: Vec2) {
        self.simulation.intent = Vec2::new(intent.x.clamp(-1.0, 1.0), intent.y.clamp(-1.0, 1.0));
    }

    /// Places the entity without motion history: all snapshots jump to
    /// `position`.
    pub fn teleport(&mut self, position: Vec2) {
        let mut state = EntityState::at(position, self.extents);
        state.intent = self.simulation.intent;
        self.simulation = state;
        self.previous = state;
        self.display = state;
    }

    /// Bounding box of the authoritative position.
    pub fn bounding_box(&self) -> Rect {
        Rect::centered(self.simulation.position, self.extents)
    }

    /// Grid cell under the *displayed* position, so highlights match what is
    /// drawn rather than raw physics.
    pub fn grid_cell(&self, tile_size: f32) -> (i32, i32) {
        let p = self.display.position;
        (
            (p.x / tile_size).round() as i32,
            (p.y / tile_size).round() as i32,
        )
    }

    /// Movement since the previous tick.
    pub fn delta(&self) -> Vec2 {
        self.simulation.position - self.previous.position
    }

    pub fn is_idle(&self) -> bool {
        self.idle_timer > 0.0
    }

    pub fn is_grounded(&self) -> bool {
        self.flags.contains(PhysicsFlags::GROUNDED)
    }

    pub fn is_jumping(&self) -> bool {
        self.flags.contains(PhysicsFlags::JUMPING)
    }

    pub fn jump_started(&self) -> bool {
        self.is_jumping() && !self.flags.contains(PhysicsFlags::WAS_JUMPING)
    }

    pub fn jump_ended(&self) -> bool {
        !self.is_jumping() && self.flags.contains(PhysicsFlags::WAS_JUMPING)
    }
}
