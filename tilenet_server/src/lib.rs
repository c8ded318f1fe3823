//! `tilenet_server`
//!
//! Server-side systems:
//! - Login handshake and extension table negotiation
//! - Hosted worlds with per-world serialized mutation
//! - Fan-out of accepted mutations to every peer of a world
//! - Fixed timestep player simulation, broadcast as `PlayerState`
//! - Scheduled tile reversions
//!
//! Networking model: one TCP connection per peer carrying length-prefixed
//! frames, one reader task and one writer task per connection.

pub mod console;
pub mod server;
pub mod world_host;

pub use server::{GameServer, ServerHandle};
pub use world_host::{WorldHost, WorldRegistry};
