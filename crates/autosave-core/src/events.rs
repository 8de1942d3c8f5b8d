//! Event infrastructure for autosave-core.
//!
//! Provides `AutosaveEvent` for hosts, a generic `EventBus` used by the
//! coordinator and the in-memory collaborators, and the `Subscription`
//! disposer returned by every subscribe call in this crate.

use crate::status::SaveStatus;
use crate::{Author, PeerId};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Events emitted by an `AutosaveCoordinator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AutosaveEvent {
    /// Global save status changed.
    StatusChanged { status: SaveStatus },
    /// This peer persisted the document on behalf of `authors`.
    SaveSucceeded { authors: Vec<Author> },
    /// The save callback rejected. The coordinator already recovered.
    SaveFailed { error: String },
    /// A peer (possibly this one) saved a version newer than any seen so far.
    VersionCreated {
        version: String,
        saved_by: PeerId,
        author: Option<Author>,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an arbitrary teardown, e.g. a subscription of an external library.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

type Callback<E> = Arc<dyn Fn(E) + Send + Sync>;

/// Event bus for publishing events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus<E> {
    callbacks: RwLock<Vec<(usize, Callback<E>)>>,
    next_id: AtomicUsize,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<E: Clone + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(self: &Arc<Self>, callback: impl Fn(E) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let bus = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.unsubscribe(id);
            }
        })
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: E) {
        // Clone the callback list so a callback may subscribe or emit again.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::<u32>::new());
        let total = Arc::new(AtomicUsize::new(0));
        let total_clone = Arc::clone(&total);

        let _sub = bus.subscribe(move |n| {
            total_clone.fetch_add(n as usize, Ordering::Relaxed);
        });

        bus.emit(3);
        bus.emit(4);

        assert_eq!(total.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::<()>::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(());
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_emit_reentrantly() {
        let bus = Arc::new(EventBus::<u32>::new());
        let seen = Arc::new(RwLock::new(Vec::new()));

        let weak_bus = Arc::downgrade(&bus);
        let seen_clone = Arc::clone(&seen);
        let _sub = bus.subscribe(move |n| {
            seen_clone.write().unwrap().push(n);
            if n > 0 {
                if let Some(bus) = weak_bus.upgrade() {
                    bus.emit(n - 1);
                }
            }
        });

        bus.emit(2);
        assert_eq!(*seen.read().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_subscription_outliving_bus_is_harmless() {
        let bus = Arc::new(EventBus::<()>::new());
        let sub = bus.subscribe(|_| {});
        drop(bus);
        drop(sub);
    }

    #[test]
    fn test_event_serialization() {
        let event = AutosaveEvent::StatusChanged {
            status: SaveStatus::Saving,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"statusChanged\""));
        assert!(json.contains("\"status\":\"SAVING\""));

        let event = AutosaveEvent::VersionCreated {
            version: "1.2".into(),
            saved_by: PeerId::from(2),
            author: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "versionCreated");
        assert_eq!(value["savedBy"], "0000000000000002");
    }
}
