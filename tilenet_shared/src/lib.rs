//! `tilenet_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One choke point for world writes, with broadcast before notification.
//! - Explicit, bounds-checked wire codec; malformed input is an error, never a panic.
//! - Extension message ids negotiated from the server's table, not load order.
//! - No `unsafe`.

pub mod builtin;
pub mod config;
pub mod entity;
pub mod event;
pub mod level;
pub mod math;
pub mod message_type;
pub mod messages;
pub mod net;
pub mod physics;
pub mod tile;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::builtin::*;
    pub use crate::config::*;
    pub use crate::entity::*;
    pub use crate::event::*;
    pub use crate::level::*;
    pub use crate::math::*;
    pub use crate::message_type::*;
    pub use crate::messages::*;
    pub use crate::net::*;
    pub use crate::physics::*;
    pub use crate::tile::*;
    pub use crate::wire::*;
}
