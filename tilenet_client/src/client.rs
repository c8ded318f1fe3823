//! Client implementation.
//!
//! The client maintains:
//! - One reliable stream, read by a background task into a frame queue
//! - The extension registry negotiated from the server's table
//! - A replica of the joined world, updated from `TileUpdate` broadcasts
//! - Remote player bodies, updated from `PlayerState` and smoothed for display

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{bail, Context as _};
use bytes::Bytes;
use tilenet_shared::{
    builtin::{PlayerInput, PlayerLeft, PlayerState, BUILTIN_EXTENSIONS},
    config::EngineConfig,
    entity::PlayerBody,
    event::EventHub,
    level::{TileWorld, WorldHooks},
    math::Vec2,
    message_type::{ExtensionHandle, ExtensionMessage, ExtensionRegistry},
    messages::{
        decode_frame, encode_frame, Disconnect, Frame, LoginRequest, NetMsg, ServerInfo,
        TileUpdate, ValidSession, Verified, PROTOCOL_VERSION,
    },
    net::{FrameTransport, FrameWriter, ReliableConn},
    tile::{Layer, Tile},
    wire::Context,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    input::{build_input, InputState},
    interp::Smoother,
};

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Joined a world, receiving updates.
    Joined,
    /// The server closed the connection or sent `Disconnect`.
    Disconnected,
}

/// Something [`GameClient::poll`] processed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A tile update was applied to the replica world.
    Tile(TileUpdate),
    /// The state of the player with this id was updated.
    Player(u32),
    /// The player with this id left the world and was forgotten.
    PlayerLeft(u32),
    /// An extension message this client has no built-in handling for.
    Extension { name: String, payload: Bytes },
    Disconnected(String),
}

/// Client-side player: the shared body plus replication bookkeeping.
#[derive(Debug, Clone)]
pub struct RemotePlayer {
    pub body: PlayerBody,
    pub player_id: u32,
    /// Server tick of the latest state applied.
    pub last_tick: u32,
}

type Incoming = mpsc::UnboundedReceiver<anyhow::Result<Bytes>>;

/// High-level game client.
pub struct GameClient {
    pub player_id: u32,
    pub state: ClientState,
    pub server_info: ServerInfo,
    /// Replica of the joined world.
    pub world: TileWorld,
    pub events: Arc<EventHub>,
    pub players: BTreeMap<u32, RemotePlayer>,

    registry: ExtensionRegistry,
    input_handle: Option<ExtensionHandle<PlayerInput>>,
    state_handle: Option<ExtensionHandle<PlayerState>>,
    left_handle: Option<ExtensionHandle<PlayerLeft>>,
    extents: Vec2,
    tile_size: f32,
    smoother: Smoother,
    tick: u32,

    incoming: Incoming,
    writer: FrameWriter,
    reader_task: JoinHandle<()>,
    server_addr: SocketAddr,
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Receives one core message during login.
async fn recv_login(conn: &mut ReliableConn) -> anyhow::Result<NetMsg> {
    let Some(frame) = conn.recv_frame().await? else {
        bail!("server closed the connection during login");
    };
    match decode_frame(&frame, Context::Client, &ExtensionRegistry::new())
        .context("decode login frame")?
    {
        Frame::Core(NetMsg::FailedLogin(f)) => bail!("login rejected: {}", f.reason),
        Frame::Core(msg) => Ok(msg),
        Frame::Extension { name, .. } => bail!("unexpected extension message {name} during login"),
    }
}

macro_rules! expect_msg {
    ($conn:expr, $variant:ident) => {
        match recv_login($conn).await? {
            NetMsg::$variant(m) => m,
            other => bail!(
                concat!("expected ", stringify!($variant), ", got {:?}"),
                other.kind()
            ),
        }
    };
}

impl GameClient {
    /// Connects to `cfg.server_addr`, logs in as `cfg.player_name` and joins
    /// `cfg.world.name`.
    pub async fn connect(cfg: &EngineConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, "Connecting to server");

        let mut conn = ReliableConn::connect(server_addr).await?;
        conn.send_msg(
            &NetMsg::LoginRequest(LoginRequest {
                protocol: PROTOCOL_VERSION,
                username: cfg.player_name.clone(),
                world: cfg.world.name.clone(),
            }),
            Context::Server,
        )
        .await?;

        let key = expect_msg!(&mut conn, PublicKey).key;
        conn.send_msg(&NetMsg::Verified(Verified { key }), Context::Server)
            .await?;
        let token = expect_msg!(&mut conn, SessionToken).token;
        conn.send_msg(&NetMsg::ValidSession(ValidSession { token }), Context::Server)
            .await?;

        let login = expect_msg!(&mut conn, LoginInit);
        let server_info = expect_msg!(&mut conn, ServerInfo);
        let registry = expect_msg!(&mut conn, ExtensionTable).into_registry();
        let init = expect_msg!(&mut conn, WorldInit);
        if init.meta.id.0 != login.world_id {
            bail!(
                "world id mismatch: login {}, world init {}",
                login.world_id,
                init.meta.id.0
            );
        }

        let missing = registry.missing(&BUILTIN_EXTENSIONS);
        if !missing.is_empty() {
            warn!(?missing, "Server does not register built-in extensions");
        }

        let events = Arc::new(EventHub::new());
        let world = TileWorld::from_stream(init.meta, &init.tiles, WorldHooks::local(events.clone()))
            .context("load world")?;
        info!(
            player_id = login.player_id,
            world = %world.meta().name,
            width = world.width(),
            height = world.height(),
            extensions = registry.len(),
            server = %server_info.name,
            "Joined world"
        );

        let (mut reader, writer) = conn.into_split();
        let (tx, incoming) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv_frame().await {
                    Ok(Some(frame)) => {
                        if tx.send(Ok(frame)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        });

        Ok(Self {
            player_id: login.player_id,
            state: ClientState::Joined,
            server_info,
            world,
            events,
            players: BTreeMap::new(),
            input_handle: registry.resolve::<PlayerInput>(),
            state_handle: registry.resolve::<PlayerState>(),
            left_handle: registry.resolve::<PlayerLeft>(),
            registry,
            extents: cfg.physics.player_extents,
            tile_size: cfg.physics.tile_size,
            smoother: Smoother::new(cfg.tick_hz),
            tick: 0,
            incoming,
            writer,
            reader_task,
            server_addr,
        })
    }

    /// Registry negotiated with the server.
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_player(&self) -> Option<&RemotePlayer> {
        self.players.get(&self.player_id)
    }

    /// Waits up to `timeout` for the next frame and processes it.
    ///
    /// Returns `Ok(None)` when nothing arrived. A malformed frame is an error;
    /// the connection should be dropped.
    pub async fn poll(&mut self, timeout: Duration) -> anyhow::Result<Option<ClientEvent>> {
        if self.state == ClientState::Disconnected {
            return Ok(None);
        }
        let frame = match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Ok(Some(self.mark_disconnected("connection closed".into()))),
            Ok(Some(Err(e))) => {
                warn!(error = %e, "Connection error");
                return Ok(Some(self.mark_disconnected(e.to_string())));
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match decode_frame(&frame, Context::Client, &self.registry).context("decode frame")? {
            Frame::Core(NetMsg::TileUpdate(update)) => {
                if let Err(e) = self.world.apply(&update) {
                    warn!(error = %e, "Server sent tile update outside the replica");
                }
                Ok(Some(ClientEvent::Tile(update)))
            }
            Frame::Core(NetMsg::Disconnect(d)) => {
                info!(reason = %d.reason, "Disconnected by server");
                Ok(Some(self.mark_disconnected(d.reason)))
            }
            Frame::Core(other) => {
                debug!(kind = ?other.kind(), "Unhandled message");
                Ok(None)
            }
            Frame::Extension { name, payload, .. } => {
                if let Some(handle) = self.state_handle.filter(|_| name == PlayerState::NAME) {
                    let msg = handle
                        .decode(&payload, Context::Client)
                        .context("decode player state")?;
                    self.apply_player_state(msg, Instant::now());
                    Ok(Some(ClientEvent::Player(msg.player_id)))
                } else if let Some(handle) = self.left_handle.filter(|_| name == PlayerLeft::NAME) {
                    let msg = handle
                        .decode(&payload, Context::Client)
                        .context("decode player left")?;
                    if self.players.remove(&msg.player_id).is_some() {
                        debug!(player_id = msg.player_id, "Player left");
                    }
                    Ok(Some(ClientEvent::PlayerLeft(msg.player_id)))
                } else {
                    Ok(Some(ClientEvent::Extension { name, payload }))
                }
            }
        }
    }

    fn mark_disconnected(&mut self, reason: String) -> ClientEvent {
        self.state = ClientState::Disconnected;
        ClientEvent::Disconnected(reason)
    }

    fn apply_player_state(&mut self, msg: PlayerState, now: Instant) {
        let extents = self.extents;
        let player = self.players.entry(msg.player_id).or_insert_with(|| {
            let mut body = PlayerBody::new(msg.position, extents);
            Smoother::snap(&mut body);
            RemotePlayer {
                body,
                player_id: msg.player_id,
                last_tick: msg.tick,
            }
        });
        if msg.tick < player.last_tick {
            debug!(player_id = msg.player_id, tick = msg.tick, "Stale player state");
            return;
        }
        let body = &mut player.body;
        body.previous = body.simulation;
        body.simulation = msg.entity_state(extents);
        body.flags = msg.flags;
        body.facing = msg.facing;
        body.idle_timer = msg.idle_timer;
        player.last_tick = msg.tick;
        self.smoother.mark_update(now);
    }

    /// Writes display snapshots of every known player for rendering at `now`.
    pub fn smooth(&mut self, now: Instant) {
        let alpha = self.smoother.alpha(now);
        for p in self.players.values_mut() {
            Smoother::apply(&mut p.body, alpha);
        }
    }

    /// Sends a raw frame.
    pub async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.writer.send_frame(frame).await
    }

    /// Asks the server to set one tile. The replica changes when the
    /// broadcast comes back.
    pub async fn request_tile(&mut self, x: i32, y: i32, layer: Layer, tile: Tile) -> anyhow::Result<()> {
        let update = NetMsg::TileUpdate(TileUpdate {
            x,
            y,
            layer: layer.index() as i32,
            tile,
        });
        self.send_frame(&encode_frame(&update, Context::Server)).await
    }

    /// Sends this tick's input and advances the client tick.
    pub async fn send_input(&mut self, input: InputState) -> anyhow::Result<PlayerInput> {
        let handle = self
            .input_handle
            .context("server does not accept player input")?;
        let msg = build_input(self.tick, input);
        self.send_frame(&handle.to_frame(msg, Context::Server)).await?;
        self.tick += 1;
        Ok(msg)
    }

    /// Sends any extension message the server registered.
    pub async fn send_extension<M: ExtensionMessage>(&mut self, msg: M) -> anyhow::Result<()> {
        let handle = self
            .registry
            .resolve::<M>()
            .with_context(|| format!("server does not register {}", M::NAME))?;
        self.send_frame(&handle.to_frame(msg, Context::Server)).await
    }

    /// Says goodbye and closes the write half.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        let bye = NetMsg::Disconnect(Disconnect {
            reason: reason.to_string(),
        });
        self.send_frame(&encode_frame(&bye, Context::Server)).await?;
        self.writer.shutdown().await?;
        self.state = ClientState::Disconnected;
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match *cmd {
            "status" => {
                let mut out = vec![
                    format!("State: {:?}", self.state),
                    format!("Player ID: {}", self.player_id),
                    format!("Server: {} ({})", self.server_info.name, self.server_addr),
                    format!("World: {}", self.world.meta().name),
                    format!("Tick: {}", self.tick),
                    format!("Extensions: {}", self.registry.names().join(", ")),
                ];
                for p in self.players.values() {
                    let pos = p.body.display.position;
                    out.push(format!(
                        "  player {}: ({:.1}, {:.1}) grounded={}",
                        p.player_id,
                        pos.x,
                        pos.y,
                        p.body.is_grounded()
                    ));
                }
                Ok(out)
            }
            "tile" => {
                let parsed = (|| {
                    let x: i32 = tokens.get(1)?.parse().ok()?;
                    let y: i32 = tokens.get(2)?.parse().ok()?;
                    let layer = Layer::from_index(tokens.get(3)?.parse().ok()?)?;
                    let tile = Tile(tokens.get(4)?.parse().ok()?);
                    Some((x, y, layer, tile))
                })();
                match parsed {
                    Some((x, y, layer, tile)) => {
                        self.request_tile(x, y, layer, tile).await?;
                        Ok(Vec::new())
                    }
                    None => Ok(vec!["Usage: tile <x> <y> <layer> <id>".to_string()]),
                }
            }
            "cell" => {
                match self.local_player() {
                    Some(p) => {
                        let (cx, cy) = p.body.grid_cell(self.tile_size);
                        Ok(vec![format!("Cell: ({cx}, {cy})")])
                    }
                    None => Ok(vec!["No local player yet".to_string()]),
                }
            }
            "disconnect" => {
                self.disconnect("client disconnect").await?;
                Ok(vec!["Disconnected".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}
