use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DeliveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reference to one viewer: the outbound queue drained by that connection's writer task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    outbound: mpsc::Sender<Bytes>,
}

impl ClientHandle {
    pub fn new(id: ClientId, outbound: mpsc::Sender<Bytes>) -> Self {
        Self { id, outbound }
    }

    /// Creates a handle plus the receiving end for the connection's writer task.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(ClientId::new(), tx), rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queues a frame without waiting; a full queue counts as a failed delivery.
    pub fn try_deliver(&self, frame: Bytes) -> Result<(), DeliveryError> {
        self.outbound.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Lagging,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub delivered: usize,
    pub bytes: usize,
    pub pruned: usize,
}

/// Set of viewers that receive live delta frames.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    slab: Slab<ClientHandle>,
    index_map: HashMap<ClientId, usize>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `handle`; returns `false` if a client with the same id is already present.
    pub fn register(&self, handle: ClientHandle) -> bool {
        let active = {
            let mut guard = self.inner.lock();
            if guard.index_map.contains_key(&handle.id) {
                return false;
            }
            let id = handle.id;
            let key = guard.slab.insert(handle);
            guard.index_map.insert(id, key);
            guard.slab.len()
        };
        gauge!("beach_canvas_clients_active", active as f64);
        true
    }

    pub fn unregister(&self, id: ClientId) -> bool {
        let (removed, active) = {
            let mut guard = self.inner.lock();
            let removed = match guard.index_map.remove(&id) {
                Some(key) => {
                    guard.slab.remove(key);
                    true
                }
                None => false,
            };
            (removed, guard.slab.len())
        };
        if removed {
            gauge!("beach_canvas_clients_active", active as f64);
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.inner.lock().index_map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` over the membership as it was when the call started.
    ///
    /// The lock is released before `f` runs, so `f` may register or unregister clients.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&ClientHandle),
    {
        let members: Vec<ClientHandle> = {
            let guard = self.inner.lock();
            guard.slab.iter().map(|(_, handle)| handle.clone()).collect()
        };
        for handle in &members {
            f(handle);
        }
    }

    /// Hands `frame` to every client, unregistering the ones whose delivery fails.
    pub fn broadcast(&self, frame: &Bytes) -> BroadcastMetrics {
        let mut metrics = BroadcastMetrics::default();
        let mut failed = Vec::new();
        self.for_each(|handle| match handle.try_deliver(frame.clone()) {
            Ok(()) => {
                metrics.delivered += 1;
                metrics.bytes += frame.len();
            }
            Err(err) => failed.push((handle.id(), err)),
        });

        for (id, err) in failed {
            if self.unregister(id) {
                metrics.pruned += 1;
                counter!("beach_canvas_clients_pruned_total", 1, "reason" => prune_label(&err));
                match err {
                    DeliveryError::Closed => debug!(client_id = %id, "pruned closed client"),
                    DeliveryError::Lagging => warn!(client_id = %id, "pruned lagging client"),
                }
            }
        }
        metrics
    }
}

fn prune_label(err: &DeliveryError) -> &'static str {
    match err {
        DeliveryError::Closed => "closed",
        DeliveryError::Lagging => "lagging",
    }
}
