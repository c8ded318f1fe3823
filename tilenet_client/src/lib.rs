//! `tilenet_client`
//!
//! Client-side systems:
//! - Login handshake and extension table negotiation
//! - Replica of the joined world, updated from server broadcasts
//! - Input sampling and `PlayerInput` generation
//! - Display smoothing of remote player bodies

pub mod client;
pub mod input;
pub mod interp;

pub use client::GameClient;
