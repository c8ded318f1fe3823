//! Extension messages the engine registers itself.
//!
//! They travel under negotiated extension ids like any third-party message, so
//! the server registers [`BUILTIN_EXTENSIONS`] before the names from config.

use crate::{
    entity::{EntityState, Facing, PhysicsFlags, PlayerBody},
    math::Vec2,
    message_type::ExtensionMessage,
    wire::{Context, DecodeError, WireReader, WireWriter},
};

/// Names registered by every server, in this order.
pub const BUILTIN_EXTENSIONS: [&str; 3] = [PlayerInput::NAME, PlayerState::NAME, PlayerLeft::NAME];

fn write_vec2(w: &mut WireWriter, v: Vec2) {
    w.write_f32(v.x);
    w.write_f32(v.y);
}

fn read_vec2(r: &mut WireReader<'_>) -> Result<Vec2, DecodeError> {
    Ok(Vec2::new(r.read_f32()?, r.read_f32()?))
}

/// Client -> server: movement intent for the sender's player.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerInput {
    pub tick: u32,
    pub intent: Vec2,
}

impl ExtensionMessage for PlayerInput {
    const NAME: &'static str = "tilenet.player_input";

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u32(self.tick);
        write_vec2(w, self.intent);
    }

    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError> {
        if ctx != Context::Server {
            return Err(DecodeError::WrongDirection {
                kind: Self::NAME,
                context: ctx,
            });
        }
        Ok(Self {
            tick: r.read_u32()?,
            intent: read_vec2(r)?,
        })
    }
}

/// Server -> client: authoritative state of one player after a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlayerState {
    pub player_id: u32,
    pub tick: u32,
    pub position: Vec2,
    pub velocity: Vec2,
    pub intent: Vec2,
    pub flags: PhysicsFlags,
    pub facing: Facing,
    pub idle_timer: f32,
}

impl PlayerState {
    pub fn capture(player_id: u32, tick: u32, body: &PlayerBody) -> Self {
        let s = &body.simulation;
        Self {
            player_id,
            tick,
            position: s.position,
            velocity: s.velocity,
            intent: s.intent,
            flags: body.flags,
            facing: body.facing,
            idle_timer: body.idle_timer,
        }
    }

    /// Entity state carried by this message for a body of `extents`.
    pub fn entity_state(&self, extents: Vec2) -> EntityState {
        let mut state = EntityState::at(self.position, extents);
        state.velocity = self.velocity;
        state.intent = self.intent;
        state
    }
}

impl ExtensionMessage for PlayerState {
    const NAME: &'static str = "tilenet.player_state";

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u32(self.player_id);
        w.write_u32(self.tick);
        write_vec2(w, self.position);
        write_vec2(w, self.velocity);
        write_vec2(w, self.intent);
        w.write_u8(self.flags.bits());
        w.write_u8(match self.facing {
            Facing::Left => 0,
            Facing::Right => 1,
        });
        w.write_f32(self.idle_timer);
    }

    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError> {
        if ctx != Context::Client {
            return Err(DecodeError::WrongDirection {
                kind: Self::NAME,
                context: ctx,
            });
        }
        let player_id = r.read_u32()?;
        let tick = r.read_u32()?;
        let position = read_vec2(r)?;
        let velocity = read_vec2(r)?;
        let intent = read_vec2(r)?;
        let raw = r.read_u8()?;
        let flags = PhysicsFlags::from_bits(raw).ok_or(DecodeError::InvalidValue {
            field: "flags",
            value: raw as i64,
        })?;
        let facing = match r.read_u8()? {
            0 => Facing::Left,
            1 => Facing::Right,
            v => {
                return Err(DecodeError::InvalidValue {
                    field: "facing",
                    value: v as i64,
                })
            }
        };
        Ok(Self {
            player_id,
            tick,
            position,
            velocity,
            intent,
            flags,
            facing,
            idle_timer: r.read_f32()?,
        })
    }
}

/// Server -> client: a player left the world; its entity is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerLeft {
    pub player_id: u32,
}

impl ExtensionMessage for PlayerLeft {
    const NAME: &'static str = "tilenet.player_left";

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u32(self.player_id);
    }

    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError> {
        if ctx != Context::Client {
            return Err(DecodeError::WrongDirection {
                kind: Self::NAME,
                context: ctx,
            });
        }
        Ok(Self {
            player_id: r.read_u32()?,
        })
    }
}
