//! Event hub.
//!
//! A small typed publish/subscribe hub, passed explicitly (usually as
//! `Arc<EventHub>`) to everything that publishes or subscribes.
//! - Server: extensions observe world creation and tile mutations.
//! - Client: UI/renderers observe replica changes.
//!
//! Subscribers fire in [`Priority`] order, then registration order, on the
//! publishing thread and with whatever locks the publisher holds.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    level::{WorldId, WorldMeta},
    tile::{Layer, Tile},
};

/// Invocation tier. Lower tiers fire first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    First,
    Early,
    #[default]
    Normal,
    Late,
    Last,
}

/// Marker for types that can be published on an [`EventHub`].
pub trait Event: Any + Send + Sync {}

/// A world was created and registered.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldCreated {
    pub meta: WorldMeta,
}

impl Event for WorldCreated {}

/// A cell changed through the mutation pipeline.
///
/// Fired from inside [`crate::level::TileWorld::mutate`], after the broadcast
/// and while whoever serializes that world still holds its lock. Subscribers
/// must not mutate or lock the same world, nor take any lock the host orders
/// before it; hand such work to a task or channel instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileMutated {
    pub world: WorldId,
    pub x: i32,
    pub y: i32,
    pub layer: Layer,
    pub old: Tile,
    pub new: Tile,
}

impl Event for TileMutated {}

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: SubscriptionId,
    priority: Priority,
    callback: Callback<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            priority: self.priority,
            callback: self.callback.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    lists: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

/// Typed, priority-ordered event hub.
#[derive(Default)]
pub struct EventHub {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventHub")
            .field("event_kinds", &inner.lists.len())
            .finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for events of type `E`.
    pub fn subscribe<E, F>(&self, priority: Priority, callback: F) -> SubscriptionId
    where
        E: Event,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;

        let list = inner
            .lists
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<Subscriber<E>>::new()));
        let Some(list) = list.downcast_mut::<Vec<Subscriber<E>>>() else {
            unreachable!("subscriber list keyed by its own TypeId");
        };

        // After every subscriber of the same or an earlier tier.
        let at = list.partition_point(|s| s.priority <= priority);
        list.insert(
            at,
            Subscriber {
                id,
                priority,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Removes a subscription. Returns false if it was not registered for `E`.
    pub fn unsubscribe<E: Event>(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = inner
            .lists
            .get_mut(&TypeId::of::<E>())
            .and_then(|b| b.downcast_mut::<Vec<Subscriber<E>>>())
        else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        list.len() != before
    }

    /// Invokes every subscriber of `E`. Returns how many ran.
    ///
    /// The subscriber list is snapshotted first, so callbacks may subscribe
    /// or unsubscribe without deadlocking.
    pub fn fire<E: Event>(&self, event: &E) -> usize {
        let subscribers: Vec<Subscriber<E>> = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match inner
                .lists
                .get(&TypeId::of::<E>())
                .and_then(|b| b.downcast_ref::<Vec<Subscriber<E>>>())
            {
                Some(list) => list.clone(),
                None => return 0,
            }
        };
        for s in &subscribers {
            (s.callback)(event);
        }
        subscribers.len()
    }

    pub fn subscriber_count<E: Event>(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .lists
            .get(&TypeId::of::<E>())
            .and_then(|b| b.downcast_ref::<Vec<Subscriber<E>>>())
            .map_or(0, Vec::len)
    }
}
