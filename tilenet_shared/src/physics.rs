//! Physics abstraction.
//!
//! A deterministic platformer step over a tile grid. Coordinates are pixels,
//! y grows downwards, one tile is `tile_size` pixels square.

use anyhow::ensure;
use serde::{Deserialize, Serialize};

use crate::{
    entity::{Facing, PhysicsFlags, PlayerBody},
    math::{Rect, Vec2},
};

/// Anything entities can collide with, addressed in tile cells.
pub trait CollisionMap {
    fn is_solid(&self, cx: i32, cy: i32) -> bool;
}

/// Physics parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicsConfig {
    /// Downward acceleration, px/s².
    pub gravity: f32,
    /// Horizontal speed at full intent, px/s.
    pub move_speed: f32,
    /// Initial upward speed of a jump, px/s.
    pub jump_speed: f32,
    pub max_fall_speed: f32,
    pub tile_size: f32,
    /// Player bounding box size, px.
    pub player_extents: Vec2,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            gravity: 1200.0,
            move_speed: 160.0,
            jump_speed: 420.0,
            max_fall_speed: 900.0,
            tile_size: 16.0,
            player_extents: Vec2::new(12.0, 24.0),
        }
    }
}

impl PhysicsConfig {
    /// Rejects values the stepper cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.tile_size.is_finite() && self.tile_size >= MIN_TILE_SIZE,
            "tile_size must be at least {MIN_TILE_SIZE}, got {}",
            self.tile_size
        );
        ensure!(
            self.player_extents.x > 0.0 && self.player_extents.y > 0.0,
            "player_extents must be positive, got {:?}",
            self.player_extents
        );
        ensure!(
            self.max_fall_speed.is_finite() && self.move_speed.is_finite() && self.jump_speed.is_finite(),
            "physics speeds must be finite"
        );
        Ok(())
    }
}

/// Physics stepper trait.
///
/// Called by [`PlayerBody::tick`] after `previous` and `WAS_JUMPING` have been
/// captured; implementations advance `simulation` and the flags only.
pub trait PhysicsBackend: Send + Sync {
    fn step(&self, body: &mut PlayerBody, map: &dyn CollisionMap, dt_sec: f32);
}

/// No-op physics.
#[derive(Debug, Default)]
pub struct NullPhysics;

impl PhysicsBackend for NullPhysics {
    fn step(&self, _body: &mut PlayerBody, _map: &dyn CollisionMap, _dt_sec: f32) {}
}

/// Inset used when mapping a rectangle's far edge to a cell, so a box that
/// merely touches a tile boundary does not count as inside the next cell.
const EDGE_EPSILON: f32 = 1e-3;

/// How far below the feet ground contact is sampled.
const GROUND_REACH: f32 = 0.05;

/// Smallest accepted `tile_size`, px.
pub const MIN_TILE_SIZE: f32 = 1.0;

/// Upper bound on collision sub-steps per tick.
const MAX_SUBSTEPS: u32 = 64;

/// Gravity, jumping and per-axis tile collision.
#[derive(Debug, Default, Clone)]
pub struct PlatformerPhysics {
    pub cfg: PhysicsConfig,
}

impl PlatformerPhysics {
    pub fn new(cfg: PhysicsConfig) -> Self {
        Self { cfg }
    }

    fn cell(&self, v: f32) -> i32 {
        (v / self.cfg.tile_size).floor() as i32
    }

    /// Number of slices for a move of `dist` px, each at most half a tile,
    /// so a single slice can never skip over a solid cell.
    fn substeps(&self, dist: f32) -> u32 {
        let limit = self.cfg.tile_size * 0.5;
        ((dist / limit).ceil() as u32).clamp(1, MAX_SUBSTEPS)
    }

    fn overlaps_solid(&self, map: &dyn CollisionMap, rect: &Rect) -> bool {
        let max = rect.max();
        let (x0, x1) = (self.cell(rect.min.x), self.cell(max.x - EDGE_EPSILON));
        let (y0, y1) = (self.cell(rect.min.y), self.cell(max.y - EDGE_EPSILON));
        (y0..=y1).any(|cy| (x0..=x1).any(|cx| map.is_solid(cx, cy)))
    }

    /// Moves along x, stopping flush against the first solid column.
    fn move_x(&self, map: &dyn CollisionMap, pos: &mut Vec2, vel: &mut Vec2, extents: Vec2, dx: f32) {
        if dx == 0.0 {
            return;
        }
        let target = Vec2::new(pos.x + dx, pos.y);
        let rect = Rect::centered(target, extents);
        if !self.overlaps_solid(map, &rect) {
            *pos = target;
            return;
        }
        let ts = self.cfg.tile_size;
        let half = extents.x * 0.5;
        pos.x = if dx > 0.0 {
            self.cell(rect.max().x - EDGE_EPSILON) as f32 * ts - half
        } else {
            (self.cell(rect.min.x) + 1) as f32 * ts + half
        };
        vel.x = 0.0;
    }

    /// Moves along y; returns true if a floor stopped the motion.
    fn move_y(&self, map: &dyn CollisionMap, pos: &mut Vec2, vel: &mut Vec2, extents: Vec2, dy: f32) -> bool {
        if dy == 0.0 {
            return false;
        }
        let target = Vec2::new(pos.x, pos.y + dy);
        let rect = Rect::centered(target, extents);
        if !self.overlaps_solid(map, &rect) {
            *pos = target;
            return false;
        }
        let ts = self.cfg.tile_size;
        let half = extents.y * 0.5;
        vel.y = 0.0;
        if dy > 0.0 {
            pos.y = self.cell(rect.max().y - EDGE_EPSILON) as f32 * ts - half;
            true
        } else {
            pos.y = (self.cell(rect.min.y) + 1) as f32 * ts + half;
            false
        }
    }

    fn on_ground(&self, map: &dyn CollisionMap, pos: Vec2, extents: Vec2) -> bool {
        let feet = Rect::centered(Vec2::new(pos.x, pos.y + GROUND_REACH), extents);
        self.overlaps_solid(map, &feet)
    }
}

impl PhysicsBackend for PlatformerPhysics {
    fn step(&self, body: &mut PlayerBody, map: &dyn CollisionMap, dt_sec: f32) {
        let cfg = &self.cfg;
        let extents = body.extents();
        let grounded = body.flags.contains(PhysicsFlags::GROUNDED);
        let s = &mut body.simulation;

        let intent_x = s.intent.x.clamp(-1.0, 1.0);
        s.velocity.x = intent_x * cfg.move_speed;

        if s.intent.y < 0.0 && grounded {
            s.velocity.y = -cfg.jump_speed;
            body.flags.insert(PhysicsFlags::JUMPING);
        }
        s.velocity.y = (s.velocity.y + cfg.gravity * dt_sec).min(cfg.max_fall_speed);

        let (mut pos, mut vel) = (s.position, s.velocity);
        let dx = vel.x * dt_sec;
        let dy = vel.y * dt_sec;
        let n = self.substeps(dx.abs().max(dy.abs()));
        let (dx, dy) = (dx / n as f32, dy / n as f32);
        let mut landed = false;
        for _ in 0..n {
            // A blocked axis has its velocity zeroed and stays put.
            if vel.x != 0.0 {
                self.move_x(map, &mut pos, &mut vel, extents, dx);
            }
            if vel.y != 0.0 {
                landed |= self.move_y(map, &mut pos, &mut vel, extents, dy);
            }
        }
        s.position = pos;
        s.velocity = vel;
        s.bounds = Rect::centered(pos, extents);

        let grounded = landed || (vel.y >= 0.0 && self.on_ground(map, pos, extents));
        body.flags.set(PhysicsFlags::GROUNDED, grounded);
        if grounded {
            body.flags.remove(PhysicsFlags::JUMPING);
        }

        if intent_x < 0.0 {
            body.facing = Facing::Left;
        } else if intent_x > 0.0 {
            body.facing = Facing::Right;
        }

        if grounded && body.simulation.intent.is_zero() {
            body.idle_timer += dt_sec;
        } else {
            body.idle_timer = 0.0;
        }
    }
}
