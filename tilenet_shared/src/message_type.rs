//! Message type registry.
//!
//! Two id spaces share the `u16` type id in front of every frame:
//! - the fixed [`CoreMessage`] table, versioned with the software release;
//! - extension messages, whose ids are positions in an [`ExtensionRegistry`].
//!
//! Extension ids are only meaningful against one registry. The server owns the
//! authoritative table and ships it to every client during the handshake
//! (`ExtensionTable`), and clients rebuild their registry from that table with
//! [`ExtensionRegistry::from_table`] instead of trusting local load order.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::wire::{Context, DecodeError, WireReader, WireWriter};

/// First wire id used for extension messages.
pub const EXTENSION_ID_BASE: u16 = 0x0100;

/// Largest number of extension names one registry can carry on the wire.
pub const MAX_EXTENSIONS: usize = (u16::MAX - EXTENSION_ID_BASE) as usize + 1;

/// Which side may send a core message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
    Either,
}

/// Engine-level message kinds. Ids are fixed and never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum CoreMessage {
    LoginRequest = 0,
    LoginInit = 1,
    FailedLogin = 2,
    SessionToken = 3,
    PublicKey = 4,
    Verified = 5,
    ValidSession = 6,
    WorldInit = 7,
    ServerInfo = 8,
    ExtensionTable = 9,
    TileUpdate = 10,
    Disconnect = 11,
}

impl CoreMessage {
    pub const ALL: [CoreMessage; 12] = [
        CoreMessage::LoginRequest,
        CoreMessage::LoginInit,
        CoreMessage::FailedLogin,
        CoreMessage::SessionToken,
        CoreMessage::PublicKey,
        CoreMessage::Verified,
        CoreMessage::ValidSession,
        CoreMessage::WorldInit,
        CoreMessage::ServerInfo,
        CoreMessage::ExtensionTable,
        CoreMessage::TileUpdate,
        CoreMessage::Disconnect,
    ];

    pub fn from_u16(v: u16) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub fn id(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            CoreMessage::LoginRequest => "LoginRequest",
            CoreMessage::LoginInit => "LoginInit",
            CoreMessage::FailedLogin => "FailedLogin",
            CoreMessage::SessionToken => "SessionToken",
            CoreMessage::PublicKey => "PublicKey",
            CoreMessage::Verified => "Verified",
            CoreMessage::ValidSession => "ValidSession",
            CoreMessage::WorldInit => "WorldInit",
            CoreMessage::ServerInfo => "ServerInfo",
            CoreMessage::ExtensionTable => "ExtensionTable",
            CoreMessage::TileUpdate => "TileUpdate",
            CoreMessage::Disconnect => "Disconnect",
        }
    }

    pub fn origin(self) -> Origin {
        match self {
            CoreMessage::LoginRequest | CoreMessage::Verified | CoreMessage::ValidSession => {
                Origin::Client
            }
            CoreMessage::LoginInit
            | CoreMessage::FailedLogin
            | CoreMessage::SessionToken
            | CoreMessage::PublicKey
            | CoreMessage::WorldInit
            | CoreMessage::ServerInfo
            | CoreMessage::ExtensionTable => Origin::Server,
            CoreMessage::TileUpdate | CoreMessage::Disconnect => Origin::Either,
        }
    }

    /// Rejects kinds that cannot legitimately be decoded under `ctx`.
    pub fn check_direction(self, ctx: Context) -> Result<(), DecodeError> {
        let ok = match (self.origin(), ctx.sender()) {
            (Origin::Either, _) => true,
            (Origin::Client, Context::Client) => true,
            (Origin::Server, Context::Server) => true,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(DecodeError::WrongDirection {
                kind: self.name(),
                context: ctx,
            })
        }
    }
}

/// Index into an [`ExtensionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExtensionId(pub u16);

/// Resolved type id of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Core(CoreMessage),
    Extension(ExtensionId),
}

impl MessageType {
    pub fn to_wire(self) -> u16 {
        match self {
            MessageType::Core(c) => c.id(),
            MessageType::Extension(ExtensionId(i)) => EXTENSION_ID_BASE + i,
        }
    }

    /// Splits a raw wire id. Extension ids are not checked against any
    /// registry here.
    pub fn from_wire(v: u16) -> Result<Self, DecodeError> {
        if v >= EXTENSION_ID_BASE {
            return Ok(MessageType::Extension(ExtensionId(v - EXTENSION_ID_BASE)));
        }
        CoreMessage::from_u16(v)
            .map(MessageType::Core)
            .ok_or(DecodeError::UnknownCoreType(v))
    }
}

/// Append-only ordered list of extension message names.
///
/// The id of a name is its insertion index. Adding a name twice yields two ids
/// for the same name; [`ExtensionRegistry::get_id`] resolves to the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionRegistry {
    names: Vec<String>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a registry from a table received from the authoritative side.
    pub fn from_table(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Appends `name` and returns its id.
    ///
    /// # Panics
    /// Panics if the registry already holds [`MAX_EXTENSIONS`] names.
    pub fn add_message(&mut self, name: impl Into<String>) -> ExtensionId {
        assert!(
            self.names.len() < MAX_EXTENSIONS,
            "extension registry is full"
        );
        self.names.push(name.into());
        ExtensionId((self.names.len() - 1) as u16)
    }

    /// First id registered for `name`, or `None` if it is unknown.
    pub fn get_id(&self, name: &str) -> Option<ExtensionId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| ExtensionId(i as u16))
    }

    /// Name registered at `id`.
    ///
    /// # Panics
    /// An id that was never assigned means the peers' registries disagree,
    /// and continuing would misread the next payload; this panics. Use
    /// [`ExtensionRegistry::try_get_type`] on untrusted input.
    pub fn get_type(&self, id: ExtensionId) -> &str {
        match self.try_get_type(id) {
            Some(name) => name,
            None => panic!(
                "extension id {} out of range (registry holds {}); registries are desynchronized",
                id.0,
                self.names.len()
            ),
        }
    }

    pub fn try_get_type(&self, id: ExtensionId) -> Option<&str> {
        self.names.get(id.0 as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Ordered names, as shipped in `ExtensionTable`.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns the names in `wanted` that this registry does not know.
    pub fn missing<'a>(&self, wanted: &[&'a str]) -> Vec<&'a str> {
        wanted
            .iter()
            .copied()
            .filter(|w| self.get_id(w).is_none())
            .collect()
    }

    /// Resolves a typed handle for an extension message, once.
    pub fn resolve<M: ExtensionMessage>(&self) -> Option<ExtensionHandle<M>> {
        self.get_id(M::NAME).map(|id| ExtensionHandle {
            id,
            _marker: PhantomData,
        })
    }
}

/// A message defined outside the core table.
pub trait ExtensionMessage: Sized {
    /// Name the extension registers under.
    const NAME: &'static str;

    fn encode(&self, w: &mut WireWriter, ctx: Context);

    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError>;
}

/// Extension message type bound to the id it resolved to.
#[derive(Debug)]
pub struct ExtensionHandle<M> {
    id: ExtensionId,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for ExtensionHandle<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for ExtensionHandle<M> {}

impl<M: ExtensionMessage> ExtensionHandle<M> {
    pub fn id(&self) -> ExtensionId {
        self.id
    }

    /// Pairs `msg` with this handle's id.
    pub fn wrap(&self, msg: M) -> Extension<M> {
        Extension { id: self.id, msg }
    }

    /// Frames `msg` under this handle's id.
    pub fn to_frame(&self, msg: M, ctx: Context) -> Bytes {
        self.wrap(msg).to_frame(ctx)
    }

    /// Decodes a payload previously routed to this handle's id.
    pub fn decode(&self, payload: &[u8], ctx: Context) -> Result<M, DecodeError> {
        let mut r = WireReader::new(payload);
        let msg = M::decode(&mut r, ctx)?;
        r.finish()?;
        Ok(msg)
    }
}

/// An extension message paired with its resolved id.
#[derive(Debug, Clone, PartialEq)]
pub struct Extension<M> {
    pub id: ExtensionId,
    pub msg: M,
}

/// Not a [`crate::wire::WireMessage`]: the id is only known from the
/// negotiated registry, so decoding goes through [`ExtensionHandle::decode`].
impl<M: ExtensionMessage> Extension<M> {
    pub fn type_id(&self) -> MessageType {
        MessageType::Extension(self.id)
    }

    /// Encodes `[type id][payload]` into a standalone frame.
    pub fn to_frame(&self, ctx: Context) -> Bytes {
        let mut w = WireWriter::new();
        w.write_u16(self.type_id().to_wire());
        self.msg.encode(&mut w, ctx);
        w.into_bytes()
    }
}
