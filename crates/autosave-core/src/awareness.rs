//! Awareness channel: an eventually-consistent map of small per-peer blobs.
//!
//! The coordinator only needs three operations: read every peer's entry,
//! write fields of its own entry, and be told when anything changed.
//! `AwarenessHub` and `MemoryAwareness` implement the channel in memory for
//! tests and the simulator, including delayed propagation.

use crate::events::{EventBus, Subscription};
use crate::PeerId;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::debug;

/// The fields one peer publishes, e.g. `{"autosave": {...}, "user": {...}}`.
pub type AwarenessState = serde_json::Map<String, Value>;

/// Notification that a peer's entry changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwarenessChange {
    Updated(PeerId),
    Removed(PeerId),
}

/// Read-all / write-own / subscribe access to the awareness channel.
pub trait Awareness: Send + Sync {
    /// The peer this endpoint writes for.
    fn local_peer(&self) -> PeerId;

    /// Snapshot of every currently known peer's entry, including our own.
    fn states(&self) -> HashMap<PeerId, AwarenessState>;

    /// Set one field of our own entry and gossip it.
    fn set_local_state_field(&self, field: &str, value: Value);

    /// Register for change notifications.
    fn subscribe(&self, callback: Box<dyn Fn(AwarenessChange) + Send + Sync>) -> Subscription;
}

#[derive(Debug, Clone)]
struct Delivery {
    from: PeerId,
    to: PeerId,
    clock: u64,
    /// `None` removes the entry.
    state: Option<AwarenessState>,
}

#[derive(Default)]
struct HubInner {
    peers: BTreeMap<PeerId, Weak<MemoryAwareness>>,
    held: bool,
    queue: VecDeque<Delivery>,
}

/// In-memory awareness network connecting `MemoryAwareness` endpoints.
///
/// Delivery is synchronous unless the hub is held, in which case updates
/// queue up until `release()`. Wrap in `Arc`.
#[derive(Default)]
pub struct AwarenessHub {
    inner: Mutex<HubInner>,
}

impl AwarenessHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect a new endpoint. It starts with the current entries of every
    /// connected peer.
    pub fn join(self: &Arc<Self>, peer_id: PeerId) -> Arc<MemoryAwareness> {
        let endpoint = Arc::new(MemoryAwareness {
            peer_id,
            hub: Arc::downgrade(self),
            view: RwLock::new(HashMap::new()),
            clock: Mutex::new(0),
            disconnected: AtomicBool::new(false),
            bus: Arc::new(EventBus::new()),
        });

        let existing: Vec<_> = {
            let mut inner = self.lock();
            let existing = inner.peers.values().filter_map(Weak::upgrade).collect();
            inner.peers.insert(peer_id, Arc::downgrade(&endpoint));
            existing
        };
        for peer in existing {
            if let Some((clock, state)) = peer.own_entry() {
                endpoint.receive(peer.peer_id, clock, Some(state));
            }
        }

        debug!("Peer {} joined awareness hub", peer_id);
        endpoint
    }

    /// Queue updates instead of delivering them, emulating propagation delay.
    pub fn hold(&self) {
        self.lock().held = true;
    }

    /// Deliver everything queued, in order, and resume synchronous delivery.
    pub fn release(&self) {
        self.lock().held = false;
        loop {
            let next = {
                let mut inner = self.lock();
                inner.queue.pop_front().map(|delivery| {
                    let target = inner.peers.get(&delivery.to).and_then(Weak::upgrade);
                    (delivery, target)
                })
            };
            match next {
                Some((delivery, Some(target))) => {
                    target.receive(delivery.from, delivery.clock, delivery.state)
                }
                Some((_, None)) => continue,
                None => break,
            }
        }
    }

    /// Release queued updates and hold again, one gossip round.
    pub fn flush(&self) {
        self.release();
        self.hold();
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    fn broadcast(&self, from: PeerId, clock: u64, state: Option<AwarenessState>) {
        let targets: Vec<_> = {
            let mut inner = self.lock();
            let recipients: Vec<PeerId> = inner.peers.keys().copied().filter(|id| *id != from).collect();
            if inner.held {
                for to in recipients {
                    inner.queue.push_back(Delivery {
                        from,
                        to,
                        clock,
                        state: state.clone(),
                    });
                }
                return;
            }
            recipients
                .iter()
                .filter_map(|id| inner.peers.get(id).and_then(Weak::upgrade))
                .collect()
        };
        for target in targets {
            target.receive(from, clock, state.clone());
        }
    }

    fn leave(&self, peer_id: PeerId) {
        let removed = self.lock().peers.remove(&peer_id).is_some();
        if removed {
            debug!("Peer {} left awareness hub", peer_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One peer's endpoint on an `AwarenessHub`.
///
/// Keeps its own view of every peer's entry, tagged with the sender's clock;
/// deliveries older than the view are dropped. After `disconnect()` local
/// writes are no longer gossiped.
pub struct MemoryAwareness {
    peer_id: PeerId,
    hub: Weak<AwarenessHub>,
    view: RwLock<HashMap<PeerId, (u64, AwarenessState)>>,
    clock: Mutex<u64>,
    disconnected: AtomicBool,
    bus: Arc<EventBus<AwarenessChange>>,
}

impl MemoryAwareness {
    /// Leave the hub; every other peer drops our entry.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        let clock = self.tick();
        self.view
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.peer_id);
        if let Some(hub) = self.hub.upgrade() {
            hub.leave(self.peer_id);
            hub.broadcast(self.peer_id, clock, None);
        }
        self.bus.emit(AwarenessChange::Removed(self.peer_id));
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn own_entry(&self) -> Option<(u64, AwarenessState)> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.peer_id)
            .cloned()
    }

    fn tick(&self) -> u64 {
        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        *clock += 1;
        *clock
    }

    fn receive(&self, from: PeerId, clock: u64, state: Option<AwarenessState>) {
        let change = {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            if let Some((known, _)) = view.get(&from) {
                if *known >= clock {
                    return;
                }
            }
            match state {
                Some(state) => {
                    view.insert(from, (clock, state));
                    AwarenessChange::Updated(from)
                }
                None => {
                    if view.remove(&from).is_none() {
                        return;
                    }
                    AwarenessChange::Removed(from)
                }
            }
        };
        self.bus.emit(change);
    }
}

impl Awareness for MemoryAwareness {
    fn local_peer(&self) -> PeerId {
        self.peer_id
    }

    fn states(&self) -> HashMap<PeerId, AwarenessState> {
        self.view
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(peer_id, (_, state))| (*peer_id, state.clone()))
            .collect()
    }

    fn set_local_state_field(&self, field: &str, value: Value) {
        let clock = self.tick();
        let state = {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            let entry = view
                .entry(self.peer_id)
                .or_insert_with(|| (0, AwarenessState::new()));
            entry.0 = clock;
            entry.1.insert(field.to_string(), value);
            entry.1.clone()
        };
        self.bus.emit(AwarenessChange::Updated(self.peer_id));
        if self.is_disconnected() {
            debug!("Peer {} is disconnected, not gossiping {}", self.peer_id, field);
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.broadcast(self.peer_id, clock, Some(state));
        }
    }

    fn subscribe(&self, callback: Box<dyn Fn(AwarenessChange) + Send + Sync>) -> Subscription {
        self.bus.subscribe(callback)
    }
}

impl Drop for MemoryAwareness {
    fn drop(&mut self) {
        if self.is_disconnected() {
            return;
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.leave(self.peer_id);
            hub.broadcast(self.peer_id, u64::MAX, None);
        }
    }
}
