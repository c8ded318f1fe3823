//! Server implementation.
//!
//! The server is authoritative over every hosted world. Each connection gets a
//! reader task (this module's read loop) and a writer task draining an
//! unbounded frame queue, so per-connection order equals enqueue order. World
//! writes from any source go through [`WorldHost`], which serializes them per
//! world.
//!
//! Background tasks:
//! - fixed-timestep simulation of player bodies, broadcasting `PlayerState`;
//! - periodic application of scheduled tile reversions.
//!
//! Lock order is players, then world, then peers. `TileMutated` subscribers
//! run with the world lock held, so they may read the peer set or the world
//! registry but must not touch players or that world.

use std::{
    collections::{BTreeMap, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use anyhow::{bail, Context as _};
use bytes::Bytes;
use rand::Rng;
use tilenet_shared::{
    builtin::{PlayerInput, PlayerLeft, PlayerState, BUILTIN_EXTENSIONS},
    config::EngineConfig,
    entity::PlayerBody,
    event::EventHub,
    level::WorldError,
    math::Vec2,
    message_type::{ExtensionHandle, ExtensionMessage, ExtensionRegistry},
    messages::{
        decode_frame, encode_frame, Disconnect, ExtensionTable, FailedLogin, Frame, LoginInit, LoginRequest,
        NetMsg, PublicKey, ServerInfo, SessionToken, PROTOCOL_VERSION,
    },
    net::{FrameReader, FrameTransport, PeerId, ReliableConn, ReliableListener},
    physics::PlatformerPhysics,
    tile::{Layer, Tile},
    wire::{Context, DecodeError},
};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::world_host::{WorldHost, WorldRegistry};

/// Time a peer has to finish the login handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Length of the `PublicKey` challenge.
const KEY_LEN: usize = 32;

/// Tile ids used by the default world generator.
pub const GROUND_TILE: Tile = Tile(1);
pub const BACKDROP_TILE: Tile = Tile(2);

/// Handles one decoded-by-name extension payload from `peer`.
pub type ExtensionHandler =
    Arc<dyn Fn(&ServerShared, PeerId, &[u8]) -> Result<(), DecodeError> + Send + Sync>;

/// Server-side player: the shared body plus connection bookkeeping.
#[derive(Debug)]
pub struct ServerPlayer {
    pub body: PlayerBody,
    pub peer: PeerId,
    pub player_id: u32,
    pub name: String,
    pub world: Arc<WorldHost>,
    /// Tick of the latest `PlayerInput` applied.
    pub last_input_tick: u32,
}

/// State shared between the accept loop, connection tasks and background
/// tasks.
pub struct ServerShared {
    pub cfg: EngineConfig,
    registry: ExtensionRegistry,
    pub events: Arc<EventHub>,
    pub worlds: WorldRegistry,
    players: Mutex<BTreeMap<PeerId, ServerPlayer>>,
    handlers: RwLock<HashMap<String, ExtensionHandler>>,
    physics: PlatformerPhysics,
    player_state: Option<ExtensionHandle<PlayerState>>,
    player_left: Option<ExtensionHandle<PlayerLeft>>,
    tick: AtomicU32,
}

impl std::fmt::Debug for ServerShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerShared")
            .field("registry", &self.registry)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// Generates the default world: a ground strip two tiles thick on the
/// foreground and a backdrop on the lower half of the background.
pub fn default_terrain(height: i32) -> impl FnMut(i32, i32, Layer) -> Tile {
    move |_x, y, layer| match layer {
        Layer::Foreground if y >= height - 2 => GROUND_TILE,
        Layer::Background if y >= height / 2 => BACKDROP_TILE,
        _ => Tile::EMPTY,
    }
}

fn random_key() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..KEY_LEN).map(|_| rng.gen::<u8>()).collect()
}

fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..16).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

impl ServerShared {
    fn new(cfg: EngineConfig) -> Self {
        let mut registry = ExtensionRegistry::new();
        for name in BUILTIN_EXTENSIONS {
            registry.add_message(name);
        }
        for name in &cfg.extensions {
            registry.add_message(name.clone());
        }

        let events = Arc::new(EventHub::new());
        let worlds = WorldRegistry::new(events.clone());
        let physics = PlatformerPhysics::new(cfg.physics);
        let player_state = registry.resolve::<PlayerState>();
        let player_left = registry.resolve::<PlayerLeft>();

        let shared = Self {
            cfg,
            registry,
            events,
            worlds,
            players: Mutex::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            physics,
            player_state,
            player_left,
            tick: AtomicU32::new(0),
        };
        if let Some(input) = shared.registry.resolve::<PlayerInput>() {
            shared.on_extension(
                PlayerInput::NAME,
                Arc::new(move |shared: &ServerShared, peer: PeerId, payload: &[u8]| -> Result<(), DecodeError> {
                    let msg = input.decode(payload, Context::Server)?;
                    shared.apply_input(peer, msg);
                    Ok(())
                }),
            );
        }
        shared
    }

    fn lock_players(&self) -> MutexGuard<'_, BTreeMap<PeerId, ServerPlayer>> {
        self.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Extension registry in id order; sent to clients as `ExtensionTable`.
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Installs the handler for extension messages named `name`, replacing
    /// any previous one.
    pub fn on_extension(&self, name: &str, handler: ExtensionHandler) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler);
    }

    fn dispatch_extension(&self, peer: PeerId, name: &str, payload: &[u8]) -> Result<(), DecodeError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        match handler {
            Some(h) => h(self, peer, payload),
            None => {
                debug!(?peer, name, "No handler for extension message");
                Ok(())
            }
        }
    }

    fn apply_input(&self, peer: PeerId, input: PlayerInput) {
        if let Some(p) = self.lock_players().get_mut(&peer) {
            p.body.set_intent(input.intent);
            p.last_input_tick = input.tick;
        }
    }

    pub fn player_count(&self) -> usize {
        self.lock_players().len()
    }

    /// Runs `f` on the player bound to `peer`.
    pub fn with_player<R>(&self, peer: PeerId, f: impl FnOnce(&mut ServerPlayer) -> R) -> Option<R> {
        self.lock_players().get_mut(&peer).map(f)
    }

    pub fn tick(&self) -> u32 {
        self.tick.load(Ordering::Relaxed)
    }

    /// Advances every player body by one tick and broadcasts their state to
    /// the peers of their world. Returns the new tick number.
    ///
    /// States are queued with the players lock held, so no `PlayerState` for
    /// a player can follow its `PlayerLeft`.
    pub fn step(&self, dt_sec: f32) -> u32 {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        let mut players = self.lock_players();
        for p in players.values_mut() {
            let body = &mut p.body;
            p.world
                .with_world(|w| body.tick(&self.physics, w, dt_sec));
            if let Some(handle) = self.player_state {
                let msg = PlayerState::capture(p.player_id, tick, &p.body);
                p.world.send_to_peers(handle.to_frame(msg, Context::Client));
            }
        }
        tick
    }

    /// Drops the player bound to `peer` and tells the rest of its world.
    fn remove_player(&self, peer: PeerId) -> Option<ServerPlayer> {
        let mut players = self.lock_players();
        let player = players.remove(&peer)?;
        if let Some(handle) = self.player_left {
            let msg = PlayerLeft {
                player_id: player.player_id,
            };
            player
                .world
                .send_to_peers(handle.to_frame(msg, Context::Client));
        }
        Some(player)
    }

    /// Applies due reversions in every world.
    pub fn run_reversions(&self) -> usize {
        let now = Instant::now();
        self.worlds
            .all()
            .iter()
            .map(|host| host.run_due_reversions(now))
            .sum()
    }

    fn spawn_point(&self, host: &WorldHost) -> Vec2 {
        let tile = self.cfg.physics.tile_size;
        let width = host.with_world(|w| w.width());
        Vec2::new((width / 2) as f32 * tile + tile * 0.5, tile * 2.0)
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Game server.
pub struct GameServer {
    shared: Arc<ServerShared>,
    tcp: ReliableListener,
}

impl GameServer {
    /// Binds the listener and creates the configured world.
    pub async fn bind(cfg: EngineConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        Self::with_listener(cfg, tcp)
    }

    fn with_listener(cfg: EngineConfig, tcp: ReliableListener) -> anyhow::Result<Self> {
        cfg.validate().context("invalid config")?;
        let shared = Arc::new(ServerShared::new(cfg));
        let wc = &shared.cfg.world;
        let host = shared
            .worlds
            .create(
                &wc.name,
                &shared.cfg.server_name,
                wc.width,
                wc.height,
                default_terrain(wc.height),
            )
            .with_context(|| format!("create world {}", wc.name))?;
        if !wc.description.is_empty() {
            debug!(world = %host.meta().name, description = %wc.description, "World description");
        }
        info!(
            extensions = shared.registry.len(),
            world = %host.meta().name,
            "Server initialized"
        );
        Ok(Self { shared, tcp })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn shared(&self) -> &Arc<ServerShared> {
        &self.shared
    }

    /// Accepts connections forever, running the simulation and reversion
    /// tasks alongside. Background tasks stop when this future is dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        let _sim = AbortOnDrop(tokio::spawn(simulation_loop(self.shared.clone())));
        let _rev = AbortOnDrop(tokio::spawn(reversion_loop(self.shared.clone())));

        loop {
            let (conn, addr) = self.tcp.accept().await?;
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(shared, conn, addr).await {
                    warn!(%addr, error = %format!("{e:#}"), "Connection ended with error");
                }
            });
        }
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = self.run().await {
                warn!(error = %format!("{e:#}"), "Server stopped");
            }
        });
        Ok(ServerHandle {
            addr,
            shared,
            task: AbortOnDrop(task),
        })
    }
}

/// A running server. Dropping the handle stops accepting and stops the
/// background tasks.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub shared: Arc<ServerShared>,
    task: AbortOnDrop,
}

impl ServerHandle {
    pub fn shutdown(self) {
        self.task.0.abort();
    }
}

async fn simulation_loop(shared: Arc<ServerShared>) {
    let hz = shared.cfg.tick_hz.max(1);
    let dt = Duration::from_secs_f32(1.0 / hz as f32);
    let mut interval = tokio::time::interval(dt);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        shared.step(dt.as_secs_f32());
    }
}

async fn reversion_loop(shared: Arc<ServerShared>) {
    let period = Duration::from_millis(shared.cfg.reversion_poll_ms.max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let applied = shared.run_reversions();
        if applied > 0 {
            debug!(applied, "Applied tile reversions");
        }
    }
}

/// Receives one core message during the handshake.
async fn recv_core(conn: &mut ReliableConn, registry: &ExtensionRegistry) -> anyhow::Result<NetMsg> {
    let Some(frame) = conn.recv_frame().await? else {
        bail!("peer closed during handshake");
    };
    match decode_frame(&frame, Context::Server, registry).context("decode handshake frame")? {
        Frame::Core(msg) => Ok(msg),
        Frame::Extension { name, .. } => bail!("unexpected extension message {name} during handshake"),
    }
}

async fn reject(conn: &mut ReliableConn, reason: &str) -> anyhow::Result<()> {
    info!(reason, "Login rejected");
    conn.send_msg(
        &NetMsg::FailedLogin(FailedLogin {
            reason: reason.to_string(),
        }),
        Context::Client,
    )
    .await
}

/// Runs the login handshake up to the point where the world is sent.
/// `Ok(None)` means the login was rejected and `FailedLogin` already sent.
async fn handshake(
    shared: &ServerShared,
    conn: &mut ReliableConn,
) -> anyhow::Result<Option<(LoginRequest, Arc<WorldHost>)>> {
    let login = match recv_core(conn, &shared.registry).await? {
        NetMsg::LoginRequest(login) => login,
        other => bail!("expected LoginRequest, got {:?}", other.kind()),
    };
    if login.protocol != PROTOCOL_VERSION {
        let reason = format!(
            "protocol mismatch: server {PROTOCOL_VERSION}, client {}",
            login.protocol
        );
        reject(conn, &reason).await?;
        return Ok(None);
    }
    if login.username.trim().is_empty() {
        reject(conn, "empty username").await?;
        return Ok(None);
    }
    let Some(host) = shared.worlds.get(&login.world) else {
        reject(conn, &format!("unknown world {}", login.world)).await?;
        return Ok(None);
    };

    let key = random_key();
    conn.send_msg(&NetMsg::PublicKey(PublicKey { key: key.clone() }), Context::Client)
        .await?;
    match recv_core(conn, &shared.registry).await? {
        NetMsg::Verified(v) if v.key == key => {}
        NetMsg::Verified(_) => {
            reject(conn, "key verification failed").await?;
            return Ok(None);
        }
        other => bail!("expected Verified, got {:?}", other.kind()),
    }

    let token = random_token();
    conn.send_msg(
        &NetMsg::SessionToken(SessionToken {
            token: token.clone(),
        }),
        Context::Client,
    )
    .await?;
    match recv_core(conn, &shared.registry).await? {
        NetMsg::ValidSession(s) if s.token == token => {}
        NetMsg::ValidSession(_) => {
            reject(conn, "invalid session token").await?;
            return Ok(None);
        }
        other => bail!("expected ValidSession, got {:?}", other.kind()),
    }

    Ok(Some((login, host)))
}

async fn handle_connection(
    shared: Arc<ServerShared>,
    mut conn: ReliableConn,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    debug!(%addr, "Connection accepted");
    let login = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&shared, &mut conn))
        .await
        .context("handshake timed out")??;
    let Some((login, host)) = login else {
        return Ok(());
    };

    let peer = PeerId::new_unique();
    let player_id = peer.0;
    conn.send_msg(
        &NetMsg::LoginInit(LoginInit {
            player_id,
            world_id: host.id().0,
        }),
        Context::Client,
    )
    .await?;
    conn.send_msg(
        &NetMsg::ServerInfo(ServerInfo {
            name: shared.cfg.server_name.clone(),
            motd: shared.cfg.motd.clone(),
            players: shared.player_count() as u32 + 1,
        }),
        Context::Client,
    )
    .await?;
    conn.send_msg(
        &NetMsg::ExtensionTable(ExtensionTable::from_registry(&shared.registry)),
        Context::Client,
    )
    .await?;

    let (reader, mut writer) = conn.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer.send_frame(&frame).await {
                debug!(error = %e, "Writer stopped");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let spawn = shared.spawn_point(&host);
    shared.lock_players().insert(
        peer,
        ServerPlayer {
            body: PlayerBody::new(spawn, shared.cfg.physics.player_extents),
            peer,
            player_id,
            name: login.username.clone(),
            world: host.clone(),
            last_input_tick: 0,
        },
    );
    if !host.join(peer, tx.clone()) {
        shared.remove_player(peer);
        bail!("writer closed before join");
    }
    info!(%addr, ?peer, player = %login.username, world = %host.meta().name, "Player logged in");

    let result = read_loop(&shared, &host, peer, reader).await;

    host.leave(peer);
    shared.remove_player(peer);
    if let Err(e) = &result {
        let bye = NetMsg::Disconnect(Disconnect {
            reason: e.to_string(),
        });
        let _ = tx.send(encode_frame(&bye, Context::Client));
    }
    drop(tx);
    let _ = writer_task.await;
    info!(?peer, player = %login.username, "Player disconnected");
    result
}

async fn read_loop(
    shared: &ServerShared,
    host: &WorldHost,
    peer: PeerId,
    mut reader: FrameReader,
) -> anyhow::Result<()> {
    while let Some(frame) = reader.recv_frame().await? {
        let decoded = decode_frame(&frame, Context::Server, &shared.registry);
        match decoded {
            Ok(Frame::Core(NetMsg::TileUpdate(update))) => match host.apply(&update) {
                Ok(old) => debug!(?peer, x = update.x, y = update.y, ?old, "Tile update applied"),
                Err(e @ WorldError::OutOfBounds { .. }) => {
                    warn!(?peer, error = %e, "Rejected tile update")
                }
                Err(e) => warn!(?peer, error = %e, "Tile update failed"),
            },
            Ok(Frame::Core(NetMsg::Disconnect(d))) => {
                info!(?peer, reason = %d.reason, "Peer disconnected");
                return Ok(());
            }
            Ok(Frame::Core(other)) => {
                debug!(?peer, kind = ?other.kind(), "Ignoring message outside handshake");
            }
            Ok(Frame::Extension { name, payload, .. }) => {
                if let Err(e) = shared.dispatch_extension(peer, &name, &payload) {
                    warn!(?peer, extension = %name, error = %e, "Dropping connection after malformed extension message");
                    return Err(e).context("extension message");
                }
            }
            Err(e) => {
                warn!(?peer, error = %e, "Dropping connection after malformed frame");
                return Err(e).context("decode frame");
            }
        }
    }
    Ok(())
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, EngineConfig)> {
    let mut cfg = EngineConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        ..Default::default()
    };
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    cfg.server_addr = tcp.local_addr()?.to_string();
    let server = GameServer::with_listener(cfg.clone(), tcp)?;
    Ok((server, cfg))
}

/// Like [`bind_ephemeral`] with a caller-provided config; `server_addr` is
/// replaced by the bound address.
pub async fn bind_ephemeral_with(mut cfg: EngineConfig) -> anyhow::Result<(GameServer, EngineConfig)> {
    let tcp = ReliableListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
    cfg.server_addr = tcp.local_addr()?.to_string();
    let server = GameServer::with_listener(cfg.clone(), tcp)?;
    Ok((server, cfg))
}
