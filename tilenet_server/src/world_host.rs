//! Hosted worlds.
//!
//! A [`WorldHost`] owns one [`TileWorld`] behind a mutex together with the
//! world's pending tile reversions. Everything that writes the world (network
//! handlers, the reversion timer, server-side tools) goes through that mutex,
//! so each capture/install/broadcast/notify sequence is atomic per world while
//! different worlds proceed in parallel.
//!
//! Lock order is world state, then peer set. Nothing takes the world lock
//! while holding the peer set. Event subscribers fired by a mutation run
//! inside the world lock.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use bytes::Bytes;
use tilenet_shared::{
    event::{EventHub, WorldCreated},
    level::{Broadcast, TileWorld, WorldError, WorldHooks, WorldId, WorldMeta},
    messages::{TileUpdate, WorldInit},
    net::{PeerId, MAX_FRAME_LEN},
    tile::{Layer, Tile},
    wire::{Context, WireMessage, WireReader},
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info};

/// Outbound frame queue of one connection.
pub type PeerSender = mpsc::UnboundedSender<Bytes>;

/// Peers currently associated with one world.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: Mutex<BTreeMap<PeerId, PeerSender>>,
}

impl PeerSet {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<PeerId, PeerSender>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, peer: PeerId, tx: PeerSender) {
        self.lock().insert(peer, tx);
    }

    pub fn remove(&self, peer: PeerId) -> bool {
        self.lock().remove(&peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Broadcast for PeerSet {
    fn broadcast(&self, world: WorldId, frame: Bytes) {
        let mut peers = self.lock();
        peers.retain(|peer, tx| {
            let alive = tx.send(frame.clone()).is_ok();
            if !alive {
                debug!(?world, ?peer, "Dropping closed peer from broadcast set");
            }
            alive
        });
    }
}

/// A tile write scheduled for later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reversion {
    pub due: Instant,
    pub x: i32,
    pub y: i32,
    pub layer: Layer,
    pub tile: Tile,
}

/// Everything guarded by the world lock.
#[derive(Debug)]
pub struct WorldState {
    pub world: TileWorld,
    /// Sorted by `due`, earliest first.
    reversions: Vec<Reversion>,
}

/// One world served to peers.
#[derive(Debug)]
pub struct WorldHost {
    meta: WorldMeta,
    state: Mutex<WorldState>,
    peers: Arc<PeerSet>,
}

impl WorldHost {
    /// Hosts `world`, which must have been built with `peers` as its
    /// broadcast hook. Prefer [`WorldRegistry::create`].
    fn new(world: TileWorld, peers: Arc<PeerSet>) -> Self {
        Self {
            meta: world.meta().clone(),
            state: Mutex::new(WorldState {
                world,
                reversions: Vec::new(),
            }),
            peers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn meta(&self) -> &WorldMeta {
        &self.meta
    }

    pub fn id(&self) -> WorldId {
        self.meta.id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Runs `f` with the world lock held.
    pub fn with_world<R>(&self, f: impl FnOnce(&TileWorld) -> R) -> R {
        f(&self.lock().world)
    }

    pub fn get(&self, x: i32, y: i32, layer: Layer) -> Result<Tile, WorldError> {
        self.lock().world.get(x, y, layer)
    }

    pub fn mutate(&self, x: i32, y: i32, layer: Layer, tile: Tile) -> Result<Tile, WorldError> {
        self.lock().world.mutate(x, y, layer, tile)
    }

    pub fn apply(&self, update: &TileUpdate) -> Result<Tile, WorldError> {
        self.lock().world.apply(update)
    }

    /// Queues `WorldInit` on `tx` and registers the peer in one critical
    /// section, so the peer sees the snapshot followed by every later update
    /// and nothing twice.
    pub fn join(&self, peer: PeerId, tx: PeerSender) -> bool {
        let state = self.lock();
        let init = WorldInit {
            meta: self.meta.clone(),
            tiles: state.world.to_stream(),
        };
        if tx.send(init.to_frame(Context::Client)).is_err() {
            return false;
        }
        self.peers.insert(peer, tx);
        drop(state);
        info!(world = %self.meta.name, ?peer, "Peer joined world");
        true
    }

    pub fn leave(&self, peer: PeerId) {
        if self.peers.remove(peer) {
            info!(world = %self.meta.name, ?peer, "Peer left world");
        }
    }

    /// Sends a frame that is not a tile mutation (entity state, chat, ...) to
    /// every peer of this world.
    pub fn send_to_peers(&self, frame: Bytes) {
        self.peers.broadcast(self.meta.id, frame);
    }

    /// Schedules `tile` to be written at `(x, y, layer)` after `delay`.
    pub fn schedule_reversion(
        &self,
        x: i32,
        y: i32,
        layer: Layer,
        tile: Tile,
        delay: Duration,
    ) -> Result<(), WorldError> {
        let mut state = self.lock();
        state.world.get(x, y, layer)?;
        let rev = Reversion {
            due: Instant::now() + delay,
            x,
            y,
            layer,
            tile,
        };
        let at = state.reversions.partition_point(|r| r.due <= rev.due);
        state.reversions.insert(at, rev);
        Ok(())
    }

    /// Places `tile` now and schedules the current tile to come back after
    /// `delay`. Returns the tile that will be restored.
    pub fn place_temporary(
        &self,
        x: i32,
        y: i32,
        layer: Layer,
        tile: Tile,
        delay: Duration,
    ) -> Result<Tile, WorldError> {
        let mut state = self.lock();
        let old = state.world.mutate(x, y, layer, tile)?;
        let rev = Reversion {
            due: Instant::now() + delay,
            x,
            y,
            layer,
            tile: old,
        };
        let at = state.reversions.partition_point(|r| r.due <= rev.due);
        state.reversions.insert(at, rev);
        Ok(old)
    }

    pub fn pending_reversions(&self) -> usize {
        self.lock().reversions.len()
    }

    /// Applies every reversion due at `now`, in deadline order, through the
    /// normal mutation pipeline. Returns how many were applied.
    pub fn run_due_reversions(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let due = state.reversions.partition_point(|r| r.due <= now);
        let batch: Vec<Reversion> = state.reversions.drain(..due).collect();
        for rev in &batch {
            // Addresses were validated when scheduled and worlds never resize.
            if let Err(e) = state.world.mutate(rev.x, rev.y, rev.layer, rev.tile) {
                debug!(world = %self.meta.name, error = %e, "Reversion rejected");
            }
        }
        batch.len()
    }
}

/// Rejects worlds whose `WorldInit` frame, carrying `stream_len` bytes of
/// tiles, would not fit in one transport frame.
fn check_init_fits(
    meta: &WorldMeta,
    width: i32,
    height: i32,
    stream_len: usize,
) -> Result<(), WorldError> {
    let header = WorldInit {
        meta: meta.clone(),
        tiles: Vec::new(),
    }
    .to_frame(Context::Client)
    .len();
    let bytes = header + stream_len;
    if bytes > MAX_FRAME_LEN {
        return Err(WorldError::TooLarge {
            width,
            height,
            bytes,
        });
    }
    Ok(())
}

/// All worlds hosted by one server, by name.
#[derive(Debug)]
pub struct WorldRegistry {
    events: Arc<EventHub>,
    next_id: AtomicU64,
    worlds: RwLock<HashMap<String, Arc<WorldHost>>>,
}

impl WorldRegistry {
    pub fn new(events: Arc<EventHub>) -> Self {
        Self {
            events,
            next_id: AtomicU64::new(1),
            worlds: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a world whose cells come from `f`, registers it and fires
    /// [`WorldCreated`]. Replaces any world of the same name.
    pub fn create(
        &self,
        name: &str,
        owner: &str,
        width: i32,
        height: i32,
        f: impl FnMut(i32, i32, Layer) -> Tile,
    ) -> Result<Arc<WorldHost>, WorldError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let meta = WorldMeta::new(id, name, owner);
        self.install(meta, width, height, f)
    }

    /// Like [`WorldRegistry::create`] with caller-provided metadata.
    pub fn install(
        &self,
        meta: WorldMeta,
        width: i32,
        height: i32,
        f: impl FnMut(i32, i32, Layer) -> Tile,
    ) -> Result<Arc<WorldHost>, WorldError> {
        check_init_fits(&meta, width, height, TileWorld::stream_len(width, height))?;
        let peers = Arc::new(PeerSet::default());
        let hooks = WorldHooks::new(peers.clone(), self.events.clone());
        let world = TileWorld::generate(meta.clone(), width, height, hooks, f)?;
        let host = Arc::new(WorldHost::new(world, peers));

        self.worlds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta.name.clone(), host.clone());
        info!(world = %meta.name, id = meta.id.0, width, height, "World created");
        self.events.fire(&WorldCreated { meta });
        Ok(host)
    }

    /// Rehydrates a world from a bulk tile stream and registers it.
    pub fn load(&self, meta: WorldMeta, stream: &[u8]) -> Result<Arc<WorldHost>, WorldError> {
        let mut header = WireReader::new(stream);
        let (width, height) = (header.read_i32().unwrap_or(0), header.read_i32().unwrap_or(0));
        check_init_fits(&meta, width, height, stream.len())?;
        let peers = Arc::new(PeerSet::default());
        let hooks = WorldHooks::new(peers.clone(), self.events.clone());
        let world = TileWorld::from_stream(meta.clone(), stream, hooks)?;
        let host = Arc::new(WorldHost::new(world, peers));
        self.worlds
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta.name.clone(), host.clone());
        info!(world = %meta.name, id = meta.id.0, "World loaded");
        self.events.fire(&WorldCreated { meta });
        Ok(host)
    }

    pub fn get(&self, name: &str) -> Option<Arc<WorldHost>> {
        self.worlds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<WorldHost>> {
        let mut all: Vec<_> = self
            .worlds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|h| h.id());
        all
    }

    pub fn len(&self) -> usize {
        self.worlds.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tilenet_shared::{
        event::{Priority, TileMutated},
        message_type::ExtensionRegistry,
        messages::{decode_frame, Frame, NetMsg},
    };

    use super::*;

    fn registry() -> (WorldRegistry, Arc<EventHub>) {
        let events = Arc::new(EventHub::new());
        (WorldRegistry::new(events.clone()), events)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<NetMsg> {
        let reg = ExtensionRegistry::new();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match decode_frame(&frame, Context::Client, &reg).unwrap() {
                Frame::Core(msg) => out.push(msg),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        out
    }

    #[test]
    fn create_fires_world_created() {
        let (worlds, events) = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        events.subscribe::<WorldCreated, _>(Priority::Normal, move |e| {
            s.lock().unwrap().push(e.meta.name.clone());
        });

        let host = worlds.create("arena", "ada", 4, 4, |_, _, _| Tile::EMPTY).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["arena".to_string()]);
        assert_eq!(worlds.get("arena").unwrap().id(), host.id());
        assert!(worlds.get("nope").is_none());
    }

    #[test]
    fn worlds_too_large_to_send_are_refused() {
        let (worlds, events) = registry();
        let created = Arc::new(Mutex::new(0));
        let c = created.clone();
        events.subscribe::<WorldCreated, _>(Priority::Normal, move |_| {
            *c.lock().unwrap() += 1;
        });

        // 2048 x 2048 x 2 layers x 2 bytes is exactly 16 MiB before headers.
        let err = worlds
            .create("huge", "o", 2048, 2048, |_, _, _| Tile::EMPTY)
            .unwrap_err();
        assert!(matches!(err, WorldError::TooLarge { width: 2048, height: 2048, .. }));

        let mut stream = vec![0u8; MAX_FRAME_LEN];
        stream[..8].copy_from_slice(&[0, 0, 8, 0, 0, 0, 4, 0]);
        let err = worlds
            .load(WorldMeta::new(9, "loaded", "o"), &stream)
            .unwrap_err();
        assert!(matches!(err, WorldError::TooLarge { width: 2048, height: 1024, .. }));

        assert!(worlds.is_empty());
        assert_eq!(*created.lock().unwrap(), 0);

        // Just under the limit is still accepted and deliverable.
        let host = worlds.create("big", "o", 2040, 2040, |_, _, _| Tile::EMPTY).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(host.join(PeerId::new_unique(), tx));
        assert!(rx.try_recv().unwrap().len() <= MAX_FRAME_LEN);
    }

    #[test]
    fn mutation_subscribers_may_read_peers_and_registry() {
        let events = Arc::new(EventHub::new());
        let worlds = Arc::new(WorldRegistry::new(events.clone()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (w, s) = (Arc::downgrade(&worlds), seen.clone());
        events.subscribe::<TileMutated, _>(Priority::Normal, move |e| {
            let Some(worlds) = w.upgrade() else { return };
            let host = worlds.get("w").unwrap();
            s.lock().unwrap().push((e.x, host.peer_count(), worlds.len()));
        });

        let host = worlds.create("w", "o", 4, 4, |_, _, _| Tile::EMPTY).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(host.join(PeerId::new_unique(), tx));
        host.mutate(2, 0, Layer::Foreground, Tile(4)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(2, 1, 1)]);
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn join_sends_snapshot_before_updates() {
        let (worlds, _) = registry();
        let host = worlds.create("w", "o", 3, 3, |_, _, _| Tile(1)).unwrap();
        host.mutate(0, 0, Layer::Foreground, Tile(5)).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(host.join(PeerId(1), tx));
        host.mutate(1, 1, Layer::Background, Tile(6)).unwrap();

        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 2);
        match &msgs[0] {
            NetMsg::WorldInit(init) => {
                let replica = TileWorld::from_stream(
                    init.meta.clone(),
                    &init.tiles,
                    WorldHooks::local(Arc::new(EventHub::new())),
                )
                .unwrap();
                assert_eq!(replica.get(0, 0, Layer::Foreground).unwrap(), Tile(5));
                assert_eq!(replica.get(1, 1, Layer::Background).unwrap(), Tile(1));
            }
            other => panic!("expected WorldInit, got {other:?}"),
        }
        assert_eq!(
            msgs[1],
            NetMsg::TileUpdate(TileUpdate {
                x: 1,
                y: 1,
                layer: 1,
                tile: Tile(6)
            })
        );
    }

    #[test]
    fn closed_peers_are_dropped_without_rollback() {
        let (worlds, _) = registry();
        let host = worlds.create("w", "o", 2, 2, |_, _, _| Tile::EMPTY).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        host.join(PeerId(1), tx);
        drop(rx);

        host.mutate(0, 1, Layer::Foreground, Tile(3)).unwrap();
        assert_eq!(host.peer_count(), 0);
        assert_eq!(host.get(0, 1, Layer::Foreground).unwrap(), Tile(3));
    }

    #[test]
    fn concurrent_mutations_serialize_per_world() {
        let (worlds, events) = registry();
        let host = worlds.create("w", "o", 16, 16, |_, _, _| Tile::EMPTY).unwrap();
        let notified = Arc::new(Mutex::new(Vec::new()));
        let n = notified.clone();
        events.subscribe::<TileMutated, _>(Priority::Normal, move |e| {
            n.lock().unwrap().push((e.x, e.y));
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        host.join(PeerId(1), tx);
        let _ = drain(&mut rx);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let host = host.clone();
                thread::spawn(move || {
                    for i in 0..16 {
                        host.mutate(i, t, Layer::Foreground, Tile(t as u16 + 1)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let broadcasts: Vec<(i32, i32)> = drain(&mut rx)
            .into_iter()
            .map(|m| match m {
                NetMsg::TileUpdate(u) => (u.x, u.y),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        // No lost updates, and broadcast order equals notification order.
        assert_eq!(broadcasts.len(), 64);
        assert_eq!(broadcasts, *notified.lock().unwrap());
        for t in 0..4 {
            for i in 0..16 {
                assert_eq!(host.get(i, t, Layer::Foreground).unwrap(), Tile(t as u16 + 1));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reversions_apply_in_deadline_order() {
        let (worlds, _) = registry();
        let host = worlds.create("w", "o", 4, 4, |_, _, _| Tile(1)).unwrap();

        assert_eq!(
            host.place_temporary(2, 2, Layer::Foreground, Tile(9), Duration::from_secs(2))
                .unwrap(),
            Tile(1)
        );
        host.schedule_reversion(0, 0, Layer::Background, Tile(7), Duration::from_secs(1))
            .unwrap();
        assert!(host
            .schedule_reversion(9, 0, Layer::Background, Tile(7), Duration::from_secs(1))
            .is_err());
        assert_eq!(host.pending_reversions(), 2);

        assert_eq!(host.run_due_reversions(Instant::now()), 0);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(host.run_due_reversions(Instant::now()), 1);
        assert_eq!(host.get(0, 0, Layer::Background).unwrap(), Tile(7));
        assert_eq!(host.get(2, 2, Layer::Foreground).unwrap(), Tile(9));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(host.run_due_reversions(Instant::now()), 1);
        assert_eq!(host.get(2, 2, Layer::Foreground).unwrap(), Tile(1));
        assert_eq!(host.pending_reversions(), 0);
    }
}
