//! Authoritative tile worlds.
//!
//! A [`TileWorld`] is a fixed `width x height` grid per [`Layer`] plus identity
//! metadata. [`TileWorld::mutate`] is the only way to change a cell after
//! construction, and every accepted mutation:
//! 1. captures the old tile and installs the new one;
//! 2. emits one `TileUpdate` frame through the world's [`Broadcast`] hook;
//! 3. then fires one [`TileMutated`] event on the world's [`EventHub`].
//!
//! Hooks are a required constructor argument and cannot be replaced. Bulk
//! installation (fresh worlds, tile streams) fills the cell buffer before the
//! world value exists, so it cannot reach the hooks.
//!
//! `TileWorld` itself is not synchronized; hosts wrap it in a lock so the
//! capture/install/broadcast/notify sequence is atomic per world.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    event::{EventHub, TileMutated},
    messages::TileUpdate,
    physics::CollisionMap,
    tile::{Layer, Tile},
    wire::{Context, DecodeError, WireMessage, WireReader, WireWriter},
};

/// Largest accepted width or height.
pub const MAX_DIMENSION: i32 = 4096;

/// Unique world id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub u64);

/// Identity and descriptive metadata of a world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldMeta {
    pub id: WorldId,
    pub name: String,
    /// Creator/owner name.
    pub owner: String,
    pub description: String,
    /// Creation time, whole seconds.
    pub created_at: DateTime<Utc>,
}

impl WorldMeta {
    pub fn new(id: u64, name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorldId(id),
            name: name.into(),
            owner: owner.into(),
            description: String::new(),
            created_at: DateTime::<Utc>::from_timestamp(now.timestamp(), 0).unwrap_or(now),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn encode(&self, w: &mut WireWriter, _ctx: Context) {
        w.write_u64(self.id.0);
        w.write_str(&self.name);
        w.write_str(&self.owner);
        w.write_str(&self.description);
        w.write_i64(self.created_at.timestamp());
    }

    pub fn decode(r: &mut WireReader<'_>, _ctx: Context) -> Result<Self, DecodeError> {
        let id = WorldId(r.read_u64()?);
        let name = r.read_str()?;
        let owner = r.read_str()?;
        let description = r.read_str()?;
        let secs = r.read_i64()?;
        let created_at = DateTime::<Utc>::from_timestamp(secs, 0).ok_or(DecodeError::InvalidValue {
            field: "created_at",
            value: secs,
        })?;
        Ok(Self {
            id,
            name,
            owner,
            description,
            created_at,
        })
    }
}

/// Outbound fan-out for accepted mutations.
pub trait Broadcast: Send + Sync {
    /// Delivers `frame` to every peer currently associated with `world`.
    /// Must not block; peers that are gone are skipped.
    fn broadcast(&self, world: WorldId, frame: Bytes);
}

/// Broadcast sink for worlds without peers (client replicas, tools).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBroadcast;

impl Broadcast for NullBroadcast {
    fn broadcast(&self, _world: WorldId, _frame: Bytes) {}
}

/// Side-effect hooks a world is built with.
#[derive(Clone)]
pub struct WorldHooks {
    pub broadcast: Arc<dyn Broadcast>,
    pub events: Arc<EventHub>,
}

impl WorldHooks {
    pub fn new(broadcast: Arc<dyn Broadcast>, events: Arc<EventHub>) -> Self {
        Self { broadcast, events }
    }

    /// Hooks with no peers, notifying `events`.
    pub fn local(events: Arc<EventHub>) -> Self {
        Self::new(Arc::new(NullBroadcast), events)
    }
}

impl std::fmt::Debug for WorldHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldHooks").finish_non_exhaustive()
    }
}

/// World operation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorldError {
    #[error("cell ({x}, {y}) on layer {layer} is outside the world")]
    OutOfBounds { x: i32, y: i32, layer: i32 },

    #[error("invalid world dimensions {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },

    #[error("world {width}x{height} needs a {bytes} byte snapshot, over the frame limit")]
    TooLarge { width: i32, height: i32, bytes: usize },

    #[error("malformed tile stream: {0}")]
    Stream(#[from] DecodeError),
}

/// The authoritative grid of one world.
#[derive(Debug)]
pub struct TileWorld {
    meta: WorldMeta,
    width: i32,
    height: i32,
    /// Layer-major, then row-major.
    cells: Vec<Tile>,
    hooks: WorldHooks,
}

fn check_dimensions(width: i32, height: i32) -> Result<usize, WorldError> {
    if width <= 0 || height <= 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(WorldError::InvalidDimensions { width, height });
    }
    Ok(width as usize * height as usize)
}

impl TileWorld {
    /// Creates an empty world.
    pub fn new(
        meta: WorldMeta,
        width: i32,
        height: i32,
        hooks: WorldHooks,
    ) -> Result<Self, WorldError> {
        Self::generate(meta, width, height, hooks, |_, _, _| Tile::EMPTY)
    }

    /// Creates a world whose initial cells come from `f(x, y, layer)`.
    /// No broadcasts or notifications are emitted.
    pub fn generate(
        meta: WorldMeta,
        width: i32,
        height: i32,
        hooks: WorldHooks,
        mut f: impl FnMut(i32, i32, Layer) -> Tile,
    ) -> Result<Self, WorldError> {
        let area = check_dimensions(width, height)?;
        let mut cells = Vec::with_capacity(area * Layer::COUNT);
        for layer in Layer::ALL {
            for y in 0..height {
                for x in 0..width {
                    cells.push(f(x, y, layer));
                }
            }
        }
        Ok(Self {
            meta,
            width,
            height,
            cells,
            hooks,
        })
    }

    /// Rehydrates a world from a bulk tile stream.
    ///
    /// Format: `width: i32, height: i32`, then `width * height` `u16` tile ids
    /// per layer in [`Layer::ALL`] order, row-major. No broadcasts or
    /// notifications are emitted.
    pub fn from_stream(
        meta: WorldMeta,
        stream: &[u8],
        hooks: WorldHooks,
    ) -> Result<Self, WorldError> {
        let mut r = WireReader::new(stream);
        let width = r.read_i32()?;
        let height = r.read_i32()?;
        let area = check_dimensions(width, height)?;

        let total = area * Layer::COUNT;
        if r.remaining() < total * 2 {
            return Err(DecodeError::Truncated {
                needed: total * 2,
                remaining: r.remaining(),
            }
            .into());
        }
        let mut cells = Vec::with_capacity(total);
        for _ in 0..total {
            cells.push(Tile(r.read_u16()?));
        }
        r.finish()?;

        debug!(world = ?meta.id, width, height, "World rehydrated from stream");
        Ok(Self {
            meta,
            width,
            height,
            cells,
            hooks,
        })
    }

    /// Length of the bulk tile stream for a `width` x `height` world.
    pub fn stream_len(width: i32, height: i32) -> usize {
        let area = width.max(0) as usize * height.max(0) as usize;
        8 + area * Layer::COUNT * 2
    }

    /// Serializes the grid in the bulk tile stream format.
    pub fn to_stream(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(Self::stream_len(self.width, self.height));
        w.write_i32(self.width);
        w.write_i32(self.height);
        for tile in &self.cells {
            w.write_u16(tile.0);
        }
        w.into_bytes().to_vec()
    }

    pub fn meta(&self) -> &WorldMeta {
        &self.meta
    }

    pub fn id(&self) -> WorldId {
        self.meta.id
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.hooks.events
    }

    fn index(&self, x: i32, y: i32, layer: Layer) -> Result<usize, WorldError> {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return Err(WorldError::OutOfBounds {
                x,
                y,
                layer: layer.index() as i32,
            });
        }
        let area = self.width as usize * self.height as usize;
        Ok(layer.index() * area + y as usize * self.width as usize + x as usize)
    }

    pub fn get(&self, x: i32, y: i32, layer: Layer) -> Result<Tile, WorldError> {
        self.index(x, y, layer).map(|i| self.cells[i])
    }

    /// Sets one cell, broadcasts the change, then notifies observers.
    /// Returns the tile that was replaced.
    pub fn mutate(&mut self, x: i32, y: i32, layer: Layer, tile: Tile) -> Result<Tile, WorldError> {
        let i = self.index(x, y, layer)?;
        let old = std::mem::replace(&mut self.cells[i], tile);

        let frame = TileUpdate {
            x,
            y,
            layer: layer.index() as i32,
            tile,
        }
        .to_frame(Context::Client);
        self.hooks.broadcast.broadcast(self.meta.id, frame);

        self.hooks.events.fire(&TileMutated {
            world: self.meta.id,
            x,
            y,
            layer,
            old,
            new: tile,
        });

        debug!(world = ?self.meta.id, x, y, ?layer, ?old, new = ?tile, "Tile mutated");
        Ok(old)
    }

    /// Applies a wire-level update; an unknown layer index is out of bounds.
    pub fn apply(&mut self, update: &TileUpdate) -> Result<Tile, WorldError> {
        let layer = Layer::from_index(update.layer).ok_or(WorldError::OutOfBounds {
            x: update.x,
            y: update.y,
            layer: update.layer,
        })?;
        self.mutate(update.x, update.y, layer, update.tile)
    }
}

impl CollisionMap for TileWorld {
    /// Non-empty foreground tiles are solid, and so is everything outside
    /// the grid.
    fn is_solid(&self, cx: i32, cy: i32) -> bool {
        self.get(cx, cy, Layer::Foreground)
            .map_or(true, |t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        event::Priority,
        message_type::ExtensionRegistry,
        messages::{decode_frame, Frame, NetMsg},
    };

    /// Records frames and events in one shared log so their relative order
    /// can be checked.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        frames: Mutex<Vec<Bytes>>,
    }

    impl Broadcast for Recorder {
        fn broadcast(&self, world: WorldId, frame: Bytes) {
            self.log.lock().unwrap().push(format!("broadcast {}", world.0));
            self.frames.lock().unwrap().push(frame);
        }
    }

    type Seen = Arc<Mutex<Vec<TileMutated>>>;

    fn world_with_recorder(width: i32, height: i32) -> (TileWorld, Arc<Recorder>, Seen) {
        let recorder = Arc::new(Recorder::default());
        let events = Arc::new(EventHub::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            let rec = recorder.clone();
            events.subscribe::<TileMutated, _>(Priority::Normal, move |e| {
                rec.log.lock().unwrap().push("notify".to_string());
                seen.lock().unwrap().push(*e);
            });
        }
        let hooks = WorldHooks::new(recorder.clone(), events);
        let meta = WorldMeta::new(7, "test", "ada");
        let world = TileWorld::generate(meta, width, height, hooks, |_, _, layer| match layer {
            Layer::Foreground => Tile(1),
            Layer::Background => Tile::EMPTY,
        })
        .unwrap();
        (world, recorder, seen)
    }

    fn decode_update(frame: &Bytes) -> TileUpdate {
        match decode_frame(frame, Context::Client, &ExtensionRegistry::new()).unwrap() {
            Frame::Core(NetMsg::TileUpdate(u)) => u,
            other => panic!("expected TileUpdate, got {other:?}"),
        }
    }

    #[test]
    fn mutate_scenario_10x10() {
        let (mut world, recorder, seen) = world_with_recorder(10, 10);
        let a = Tile(1);
        let b = Tile(2);

        let old = world.mutate(5, 5, Layer::Foreground, b).unwrap();
        assert_eq!(old, a);
        assert_eq!(world.get(5, 5, Layer::Foreground).unwrap(), b);

        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            decode_update(&frames[0]),
            TileUpdate {
                x: 5,
                y: 5,
                layer: 0,
                tile: b
            }
        );

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![TileMutated {
                world: WorldId(7),
                x: 5,
                y: 5,
                layer: Layer::Foreground,
                old: a,
                new: b
            }]
        );
        assert_eq!(
            *recorder.log.lock().unwrap(),
            vec!["broadcast 7".to_string(), "notify".to_string()]
        );
    }

    #[test]
    fn grid_roundtrip_every_cell() {
        let (mut world, _, _) = world_with_recorder(4, 3);
        for layer in Layer::ALL {
            for y in 0..3 {
                for x in 0..4 {
                    let before = world.get(x, y, layer).unwrap();
                    let t = Tile((x * 10 + y) as u16 + layer.index() as u16 * 100);
                    assert_eq!(world.mutate(x, y, layer, t).unwrap(), before);
                    assert_eq!(world.get(x, y, layer).unwrap(), t);
                }
            }
        }
    }

    #[test]
    fn out_of_bounds_is_rejected_without_side_effects() {
        let (mut world, recorder, seen) = world_with_recorder(10, 10);
        let before = world.to_stream();

        for (x, y) in [(-1, 0), (0, -1), (10, 0), (0, 10), (i32::MAX, i32::MIN)] {
            assert_eq!(
                world.mutate(x, y, Layer::Background, Tile(9)),
                Err(WorldError::OutOfBounds { x, y, layer: 1 })
            );
        }
        assert_eq!(
            world.apply(&TileUpdate {
                x: 1,
                y: 1,
                layer: 2,
                tile: Tile(9)
            }),
            Err(WorldError::OutOfBounds { x: 1, y: 1, layer: 2 })
        );

        assert_eq!(world.to_stream(), before);
        assert!(recorder.frames.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn broadcasts_follow_call_order() {
        let (mut world, recorder, _) = world_with_recorder(8, 8);
        for i in 0..8 {
            world.mutate(i, 7 - i, Layer::Background, Tile(i as u16 + 10)).unwrap();
        }
        let xs: Vec<i32> = recorder
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| decode_update(f).x)
            .collect();
        assert_eq!(xs, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn stream_roundtrip_is_silent() {
        let (mut world, recorder, seen) = world_with_recorder(5, 4);
        world.mutate(2, 3, Layer::Background, Tile(77)).unwrap();
        let stream = world.to_stream();
        let frames_before = recorder.frames.lock().unwrap().len();

        let hooks = WorldHooks::new(recorder.clone(), world.events().clone());
        let copy = TileWorld::from_stream(world.meta().clone(), &stream, hooks).unwrap();
        assert_eq!(copy.width(), 5);
        assert_eq!(copy.height(), 4);
        assert_eq!(copy.get(2, 3, Layer::Background).unwrap(), Tile(77));
        assert_eq!(copy.get(0, 0, Layer::Foreground).unwrap(), Tile(1));
        assert_eq!(copy.to_stream(), stream);

        // Loading emitted nothing.
        assert_eq!(recorder.frames.lock().unwrap().len(), frames_before);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn rehydrated_world_mutates_through_pipeline() {
        let (world, recorder, seen) = world_with_recorder(3, 3);
        let stream = world.to_stream();
        let hooks = WorldHooks::new(recorder.clone(), world.events().clone());
        let mut copy = TileWorld::from_stream(world.meta().clone(), &stream, hooks).unwrap();

        copy.mutate(0, 0, Layer::Foreground, Tile::EMPTY).unwrap();
        assert_eq!(recorder.frames.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn stream_rejects_bad_input() {
        let hooks = || WorldHooks::local(Arc::new(EventHub::new()));
        let meta = || WorldMeta::new(1, "w", "o");

        let mut w = WireWriter::new();
        w.write_i32(0);
        w.write_i32(5);
        assert_eq!(
            TileWorld::from_stream(meta(), &w.into_bytes(), hooks()).unwrap_err(),
            WorldError::InvalidDimensions { width: 0, height: 5 }
        );

        let mut w = WireWriter::new();
        w.write_i32(2);
        w.write_i32(2);
        w.write_u16(1);
        assert!(matches!(
            TileWorld::from_stream(meta(), &w.into_bytes(), hooks()),
            Err(WorldError::Stream(DecodeError::Truncated { .. }))
        ));

        assert!(matches!(
            TileWorld::from_stream(meta(), &[0, 0], hooks()),
            Err(WorldError::Stream(DecodeError::Truncated { .. }))
        ));
    }

    #[test]
    fn outside_grid_is_solid() {
        let (world, _, _) = world_with_recorder(2, 2);
        assert!(world.is_solid(0, 0));
        assert!(world.is_solid(-1, 0));
        assert!(world.is_solid(2, 1));

        let empty = TileWorld::new(
            WorldMeta::new(2, "e", "o"),
            2,
            2,
            WorldHooks::local(Arc::new(EventHub::new())),
        )
        .unwrap();
        assert!(!empty.is_solid(1, 1));
    }
}
