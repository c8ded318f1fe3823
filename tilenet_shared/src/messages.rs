//! Core protocol messages.
//!
//! One struct per [`CoreMessage`] kind, each implementing [`WireMessage`], plus
//! the [`NetMsg`] envelope used by the dispatch loops and [`decode_frame`],
//! which splits a received frame into a core message or a still-encoded
//! extension payload.

use bytes::Bytes;

use crate::{
    level::WorldMeta,
    message_type::{CoreMessage, ExtensionId, ExtensionRegistry, MessageType},
    tile::Tile,
    wire::{Context, DecodeError, WireMessage, WireReader, WireWriter},
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Client -> server: first message on a new connection.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    pub protocol: u32,
    pub username: String,
    /// Name of the world to join.
    pub world: String,
}

impl WireMessage for LoginRequest {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::LoginRequest)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u32(self.protocol);
        w.write_str(&self.username);
        w.write_str(&self.world);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol: r.read_u32()?,
            username: r.read_str()?,
            world: r.read_str()?,
        })
    }
}

/// Server -> client: login accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginInit {
    pub player_id: u32,
    pub world_id: u64,
}

impl WireMessage for LoginInit {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::LoginInit)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u32(self.player_id);
        w.write_u64(self.world_id);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            player_id: r.read_u32()?,
            world_id: r.read_u64()?,
        })
    }
}

/// Server -> client: login rejected. The server closes afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedLogin {
    pub reason: String,
}

impl WireMessage for FailedLogin {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::FailedLogin)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.reason);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            reason: r.read_str()?,
        })
    }
}

/// Server -> client: session token issued after the key check.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionToken {
    pub token: String,
}

impl WireMessage for SessionToken {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::SessionToken)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.token);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            token: r.read_str()?,
        })
    }
}

/// Server -> client: per-connection key the client must echo back.
#[derive(Debug, Clone, PartialEq)]
pub struct PublicKey {
    pub key: Vec<u8>,
}

impl WireMessage for PublicKey {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::PublicKey)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_bytes(&self.key);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            key: r.read_bytes()?,
        })
    }
}

/// Client -> server: echo of the [`PublicKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct Verified {
    pub key: Vec<u8>,
}

impl WireMessage for Verified {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::Verified)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_bytes(&self.key);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            key: r.read_bytes()?,
        })
    }
}

/// Client -> server: presents the issued [`SessionToken`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidSession {
    pub token: String,
}

impl WireMessage for ValidSession {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::ValidSession)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.token);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            token: r.read_str()?,
        })
    }
}

/// Server -> client: full world contents as a bulk tile stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldInit {
    pub meta: WorldMeta,
    /// Bulk tile stream, see [`crate::level::TileWorld::to_stream`].
    pub tiles: Vec<u8>,
}

impl WireMessage for WorldInit {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::WorldInit)
    }

    fn encode(&self, w: &mut WireWriter, ctx: Context) {
        self.meta.encode(w, ctx);
        w.write_bytes(&self.tiles);
    }

    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            meta: WorldMeta::decode(r, ctx)?,
            tiles: r.read_bytes()?,
        })
    }
}

/// Server -> client: server metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub motd: String,
    pub players: u32,
}

impl WireMessage for ServerInfo {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::ServerInfo)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.name);
        w.write_str(&self.motd);
        w.write_u32(self.players);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            name: r.read_str()?,
            motd: r.read_str()?,
            players: r.read_u32()?,
        })
    }
}

/// Server -> client: the authoritative extension registry, in id order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionTable {
    pub names: Vec<String>,
}

impl ExtensionTable {
    pub fn from_registry(registry: &ExtensionRegistry) -> Self {
        Self {
            names: registry.names().to_vec(),
        }
    }

    pub fn into_registry(self) -> ExtensionRegistry {
        ExtensionRegistry::from_table(self.names)
    }
}

impl WireMessage for ExtensionTable {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::ExtensionTable)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u16(self.names.len() as u16);
        for name in &self.names {
            w.write_str(name);
        }
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        let count = r.read_u16()? as usize;
        // Each name needs at least its length prefix.
        if r.remaining() < count * 2 {
            return Err(DecodeError::Truncated {
                needed: count * 2,
                remaining: r.remaining(),
            });
        }
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(r.read_str()?);
        }
        Ok(Self { names })
    }
}

/// One cell change. Sent by clients as a request and broadcast by the server
/// once the change is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileUpdate {
    pub x: i32,
    pub y: i32,
    pub layer: i32,
    pub tile: Tile,
}

impl WireMessage for TileUpdate {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::TileUpdate)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_i32(self.x);
        w.write_i32(self.y);
        w.write_i32(self.layer);
        w.write_u16(self.tile.0);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            x: r.read_i32()?,
            y: r.read_i32()?,
            layer: r.read_i32()?,
            tile: Tile(r.read_u16()?),
        })
    }
}

/// Either side: the connection is about to close.
#[derive(Debug, Clone, PartialEq)]
pub struct Disconnect {
    pub reason: String,
}

impl WireMessage for Disconnect {
    fn type_id(&self) -> MessageType {
        MessageType::Core(CoreMessage::Disconnect)
    }

    fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_str(&self.reason);
    }

    fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        Ok(Self {
            reason: r.read_str()?,
        })
    }
}

/// High-level envelope over the core table.
#[derive(Debug, Clone, PartialEq)]
pub enum NetMsg {
    // ─── Login handshake ───
    LoginRequest(LoginRequest),
    PublicKey(PublicKey),
    Verified(Verified),
    SessionToken(SessionToken),
    ValidSession(ValidSession),
    LoginInit(LoginInit),
    FailedLogin(FailedLogin),

    // ─── World join ───
    ServerInfo(ServerInfo),
    ExtensionTable(ExtensionTable),
    WorldInit(WorldInit),

    // ─── Gameplay ───
    TileUpdate(TileUpdate),

    // ─── Disconnect ───
    Disconnect(Disconnect),
}

impl NetMsg {
    pub fn kind(&self) -> CoreMessage {
        match self {
            NetMsg::LoginRequest(_) => CoreMessage::LoginRequest,
            NetMsg::PublicKey(_) => CoreMessage::PublicKey,
            NetMsg::Verified(_) => CoreMessage::Verified,
            NetMsg::SessionToken(_) => CoreMessage::SessionToken,
            NetMsg::ValidSession(_) => CoreMessage::ValidSession,
            NetMsg::LoginInit(_) => CoreMessage::LoginInit,
            NetMsg::FailedLogin(_) => CoreMessage::FailedLogin,
            NetMsg::ServerInfo(_) => CoreMessage::ServerInfo,
            NetMsg::ExtensionTable(_) => CoreMessage::ExtensionTable,
            NetMsg::WorldInit(_) => CoreMessage::WorldInit,
            NetMsg::TileUpdate(_) => CoreMessage::TileUpdate,
            NetMsg::Disconnect(_) => CoreMessage::Disconnect,
        }
    }

    fn decode_kind(
        kind: CoreMessage,
        r: &mut WireReader<'_>,
        ctx: Context,
    ) -> Result<Self, DecodeError> {
        kind.check_direction(ctx)?;
        Ok(match kind {
            CoreMessage::LoginRequest => NetMsg::LoginRequest(LoginRequest::decode(r, ctx)?),
            CoreMessage::LoginInit => NetMsg::LoginInit(LoginInit::decode(r, ctx)?),
            CoreMessage::FailedLogin => NetMsg::FailedLogin(FailedLogin::decode(r, ctx)?),
            CoreMessage::SessionToken => NetMsg::SessionToken(SessionToken::decode(r, ctx)?),
            CoreMessage::PublicKey => NetMsg::PublicKey(PublicKey::decode(r, ctx)?),
            CoreMessage::Verified => NetMsg::Verified(Verified::decode(r, ctx)?),
            CoreMessage::ValidSession => NetMsg::ValidSession(ValidSession::decode(r, ctx)?),
            CoreMessage::WorldInit => NetMsg::WorldInit(WorldInit::decode(r, ctx)?),
            CoreMessage::ServerInfo => NetMsg::ServerInfo(ServerInfo::decode(r, ctx)?),
            CoreMessage::ExtensionTable => {
                NetMsg::ExtensionTable(ExtensionTable::decode(r, ctx)?)
            }
            CoreMessage::TileUpdate => NetMsg::TileUpdate(TileUpdate::decode(r, ctx)?),
            CoreMessage::Disconnect => NetMsg::Disconnect(Disconnect::decode(r, ctx)?),
        })
    }
}

impl WireMessage for NetMsg {
    fn type_id(&self) -> MessageType {
        MessageType::Core(self.kind())
    }

    /// Writes the type id, then the payload; [`NetMsg`] is self-describing.
    fn encode(&self, w: &mut WireWriter, ctx: Context) {
        w.write_u16(self.type_id().to_wire());
        match self {
            NetMsg::LoginRequest(m) => m.encode(w, ctx),
            NetMsg::PublicKey(m) => m.encode(w, ctx),
            NetMsg::Verified(m) => m.encode(w, ctx),
            NetMsg::SessionToken(m) => m.encode(w, ctx),
            NetMsg::ValidSession(m) => m.encode(w, ctx),
            NetMsg::LoginInit(m) => m.encode(w, ctx),
            NetMsg::FailedLogin(m) => m.encode(w, ctx),
            NetMsg::ServerInfo(m) => m.encode(w, ctx),
            NetMsg::ExtensionTable(m) => m.encode(w, ctx),
            NetMsg::WorldInit(m) => m.encode(w, ctx),
            NetMsg::TileUpdate(m) => m.encode(w, ctx),
            NetMsg::Disconnect(m) => m.encode(w, ctx),
        }
    }

    /// Reads the type id first, then the payload.
    fn decode(r: &mut WireReader<'_>, ctx: Context) -> Result<Self, DecodeError> {
        let raw = r.read_u16()?;
        match MessageType::from_wire(raw)? {
            MessageType::Core(kind) => Self::decode_kind(kind, r, ctx),
            MessageType::Extension(ExtensionId(id)) => Err(DecodeError::UnknownExtension(id)),
        }
    }

    /// `encode` already leads with the type id.
    fn to_frame(&self, ctx: Context) -> Bytes {
        let mut w = WireWriter::new();
        self.encode(&mut w, ctx);
        w.into_bytes()
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Core(NetMsg),
    /// Extension payload, still encoded. Route it by `name` to the handler that
    /// owns the matching [`crate::message_type::ExtensionHandle`].
    Extension {
        id: ExtensionId,
        name: String,
        payload: Bytes,
    },
}

/// Decodes one whole frame received under `ctx`.
///
/// Extension ids are resolved against `registry`; an id it does not hold is
/// [`DecodeError::UnknownExtension`]. Core frames must be consumed exactly.
pub fn decode_frame(
    frame: &Bytes,
    ctx: Context,
    registry: &ExtensionRegistry,
) -> Result<Frame, DecodeError> {
    let mut r = WireReader::new(frame);
    let raw = r.read_u16()?;
    match MessageType::from_wire(raw)? {
        MessageType::Core(kind) => {
            let msg = NetMsg::decode_kind(kind, &mut r, ctx)?;
            r.finish()?;
            Ok(Frame::Core(msg))
        }
        MessageType::Extension(id) => {
            let name = registry
                .try_get_type(id)
                .ok_or(DecodeError::UnknownExtension(id.0))?
                .to_string();
            Ok(Frame::Extension {
                id,
                name,
                payload: frame.slice(2..),
            })
        }
    }
}

/// Frames a core message for the given receiving side.
pub fn encode_frame(msg: &NetMsg, ctx: Context) -> Bytes {
    msg.to_frame(ctx)
}
