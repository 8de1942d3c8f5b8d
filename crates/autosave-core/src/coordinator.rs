//! AutosaveCoordinator: decides when, and which peer, persists a shared document.
//!
//! There is no leader. Every peer runs a coordinator that works like this:
//!
//! 1. Each local edit bumps the peer's `update_count`, marks it dirty,
//!    publishes its state into the awareness channel and (re)arms a debounce
//!    timer for the quiet period.
//! 2. When the timer fires, the peer backs off (re-arms the timer) if any
//!    peer is saving, saves if any peer is dirty, and does nothing otherwise.
//! 3. A save snapshots every peer's `update_count`, advertises `saving`,
//!    invokes the host's save callback and, on success, publishes the
//!    snapshot as its `saved_update_count`.
//! 4. Every peer recomputes its own `dirty` flag whenever awareness changes:
//!    it is clean once any peer vouches for all of its edits.
//! 5. When another peer turns dirty and no timer is pending, the timer is
//!    armed as well, so unsaved changes get saved even if their author's own
//!    timer never runs (e.g. it left, or its save failed).
//!
//! "At most one peer saves" is best effort only. Awareness is eventually
//! consistent, so two peers may both see nobody saving and save together;
//! the host's storage must tolerate that. An optional claim window
//! (`claim_delay_ms`) narrows the race further.
//!
//! Event handlers mutate local state under a short lock and publish after
//! releasing it. They are meant to run one at a time, as on a current-thread
//! runtime or a single UI thread; concurrent publishes from several threads
//! may reach the awareness channel out of order.

use crate::awareness::Awareness;
use crate::config::AutosaveConfig;
use crate::document::{DocumentLog, DocumentUpdate, UpdateSource};
use crate::error::{AutosaveError, Result};
use crate::events::{AutosaveEvent, EventBus, Subscription};
use crate::peers::{compute_dirty, PeerSnapshot};
use crate::save::{SaveHandler, SaveOutcome, SaveReceipt};
use crate::status::{derive_status, SaveStatus, StatusEmitter};
use crate::timer::DebounceTimer;
use crate::state::compare_versions;
use crate::{PeerAutosaveState, PeerId, SavePriority};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Autosave coordinator for one peer. Stops when dropped.
pub struct AutosaveCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: PeerId,
    config: AutosaveConfig,
    awareness: Arc<dyn Awareness>,
    saver: Arc<dyn SaveHandler>,
    local: Mutex<Local>,
    timer: DebounceTimer,
    events: Arc<EventBus<AutosaveEvent>>,
    status: StatusEmitter,
    subscriptions: Mutex<Vec<Subscription>>,
}

#[derive(Default)]
struct Local {
    state: PeerAutosaveState,
    /// When this peer last turned dirty, for `max_delay_ms`.
    dirty_since: Option<Instant>,
    /// Other peers seen dirty at the last awareness change.
    remote_dirty: BTreeSet<PeerId>,
    /// Newest version announced through `VersionCreated`.
    latest_version: Option<String>,
    stopped: bool,
}

/// Result of a successful save, applied in `finish_save`.
struct Saved {
    update_counts: BTreeMap<PeerId, u64>,
    version: Option<String>,
}

impl AutosaveCoordinator {
    /// Publish an initial state, subscribe to the document and the awareness
    /// channel, and start coordinating.
    ///
    /// Must be called from within a tokio runtime; the debounce timer runs on it.
    pub fn start(
        document: &dyn DocumentLog,
        awareness: Arc<dyn Awareness>,
        saver: Arc<dyn SaveHandler>,
        config: AutosaveConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;

        let peer_id = document.peer_id();
        if awareness.local_peer() != peer_id {
            return Err(AutosaveError::PeerMismatch {
                document: peer_id,
                awareness: awareness.local_peer(),
            });
        }

        let events = Arc::new(EventBus::new());
        let inner = Arc::new(Inner {
            peer_id,
            config,
            awareness,
            saver,
            local: Mutex::new(Local::default()),
            timer: DebounceTimer::new(runtime),
            status: StatusEmitter::new(Arc::clone(&events)),
            events,
            subscriptions: Mutex::new(Vec::new()),
        });

        inner.try_publish()?;

        let weak = Arc::downgrade(&inner);
        let awareness_sub = inner.awareness.subscribe(Box::new(move |_change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_awareness_change();
            }
        }));
        let weak = Arc::downgrade(&inner);
        let document_sub = document.subscribe_updates(Box::new(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.on_document_update(update);
            }
        }));
        inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([awareness_sub, document_sub]);

        // Peers that were already dirty before we joined.
        inner.on_awareness_change();

        info!("Autosave started for peer {}", peer_id);
        Ok(Self { inner })
    }

    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    pub fn config(&self) -> &AutosaveConfig {
        &self.inner.config
    }

    /// Last status emitted.
    pub fn status(&self) -> SaveStatus {
        self.inner.status.current()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock_local().state.dirty
    }

    /// Newest document version saved by any peer, as far as this peer knows.
    pub fn latest_version(&self) -> Option<String> {
        self.inner.lock_local().latest_version.clone()
    }

    /// Copy of this peer's autosave state.
    pub fn state(&self) -> PeerAutosaveState {
        self.inner.local_state()
    }

    /// Save now, e.g. on an explicit "Save" action. Never fails: the outcome
    /// tells what happened.
    pub async fn save(&self) -> SaveOutcome {
        self.inner.attempt_save(SavePriority::Manual).await
    }

    pub fn subscribe(&self, callback: impl Fn(AutosaveEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.subscribe(callback)
    }

    /// Receive only status transitions.
    pub fn on_status_change(
        &self,
        callback: impl Fn(SaveStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.subscribe(move |event| {
            if let AutosaveEvent::StatusChanged { status } = event {
                callback(status);
            }
        })
    }

    /// Cancel the pending save and stop reacting to edits and awareness.
    /// A save already in flight still completes and publishes its result.
    pub fn stop(&self) {
        self.inner.timer.cancel();
        self.inner.lock_local().stopped = true;
        let subscriptions = std::mem::take(
            &mut *self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        drop(subscriptions);
        debug!("Autosave stopped for peer {}", self.inner.peer_id);
    }
}

impl Drop for AutosaveCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn on_document_update(self: &Arc<Self>, update: DocumentUpdate) {
        if update.source == UpdateSource::Remote {
            return;
        }
        if update.origin.as_deref() == Some(self.config.save_origin.as_str()) {
            debug!("Ignoring save write-back on peer {}", self.peer_id);
            return;
        }

        let peers = self.remote_snapshot();
        let overdue = {
            let mut local = self.lock_local();
            if local.stopped {
                return;
            }
            local.state.update_count += 1;
            self.refresh_dirty(&mut local, &peers);
            match (self.config.max_delay(), local.dirty_since) {
                (Some(max_delay), Some(since)) => since.elapsed() >= max_delay,
                _ => false,
            }
        };

        self.timer.cancel();
        self.publish();
        self.refresh_status();

        let delay = if overdue {
            debug!("Peer {} dirty for too long, saving now", self.peer_id);
            Duration::ZERO
        } else {
            self.config.quiet_period()
        };
        self.schedule_save(delay);
    }

    fn on_awareness_change(self: &Arc<Self>) {
        let peers = self.remote_snapshot();
        let (changed, newly_dirty) = {
            let mut local = self.lock_local();
            if local.stopped {
                return;
            }
            let remote_dirty = peers.dirty_peers(self.peer_id);
            let newly_dirty = remote_dirty.difference(&local.remote_dirty).next().is_some();
            local.remote_dirty = remote_dirty;
            (self.refresh_dirty(&mut local, &peers), newly_dirty)
        };
        if changed {
            self.publish();
        }
        self.refresh_status();
        self.refresh_version();

        if newly_dirty && !self.timer.is_pending() {
            debug!("Peer {} arms its save timer for another peer's edits", self.peer_id);
            self.schedule_save(self.config.quiet_period());
        }
    }

    fn schedule_save(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.timer.schedule(delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_save_timer().await;
            }
        });
    }

    async fn on_save_timer(self: &Arc<Self>) {
        if self.is_stopped() {
            return;
        }
        let peers = self.snapshot();
        if peers.any_saving() {
            debug!(
                "Someone is saving, peer {} retries in {:?}",
                self.peer_id,
                self.config.quiet_period()
            );
            self.schedule_save(self.config.quiet_period());
        } else if peers.any_dirty() {
            self.attempt_save(SavePriority::Auto).await;
        }
    }

    async fn attempt_save(self: &Arc<Self>, priority: SavePriority) -> SaveOutcome {
        let peers = self.snapshot();
        let mut authors = peers.dirty_authors();
        if authors.is_empty() {
            debug!("Nothing to save on peer {}", self.peer_id);
            return SaveOutcome::NothingToSave;
        }
        let mut update_counts = peers.update_counts();

        {
            let mut local = self.lock_local();
            if local.state.saving {
                return SaveOutcome::AlreadySaving;
            }
            local.state.saving = true;
            local.state.save_priority = Some(priority);
        }
        self.publish();
        self.refresh_status();

        if let Some(claim_delay) = self.config.claim_delay() {
            tokio::time::sleep(claim_delay).await;
            let peers = self.snapshot();
            match peers.save_winner() {
                Some(winner) if winner == self.peer_id => {}
                winner => {
                    info!(
                        "Peer {} yields save to {}",
                        self.peer_id,
                        winner.map(|id| id.to_string()).unwrap_or_default()
                    );
                    self.finish_save(None);
                    return SaveOutcome::Yielded;
                }
            }
            authors = peers.dirty_authors();
            if authors.is_empty() {
                self.finish_save(None);
                return SaveOutcome::NothingToSave;
            }
            update_counts = peers.update_counts();
        }

        info!(
            "Peer {} saving on behalf of {} author(s)",
            self.peer_id,
            authors.len()
        );
        match self.saver.save(authors.clone()).await {
            Ok(SaveReceipt { version }) => {
                debug!("Saved update counts {:?}", update_counts);
                self.events.emit(AutosaveEvent::SaveSucceeded {
                    authors: authors.clone(),
                });
                self.finish_save(Some(Saved {
                    update_counts,
                    version: version.clone(),
                }));
                SaveOutcome::Saved { authors, version }
            }
            Err(e) => {
                warn!("Peer {} failed to save: {}", self.peer_id, e);
                self.finish_save(None);
                let error = e.to_string();
                self.events.emit(AutosaveEvent::SaveFailed {
                    error: error.clone(),
                });
                SaveOutcome::Failed { error }
            }
        }
    }

    /// Clear `saving` and, after a successful save, vouch for `saved`.
    /// One publish covers both.
    fn finish_save(&self, saved: Option<Saved>) {
        let peers = self.remote_snapshot();
        {
            let mut local = self.lock_local();
            if let Some(saved) = saved {
                local.state.saved_update_count = saved.update_counts;
                if saved.version.is_some() {
                    local.state.version = saved.version;
                }
            }
            local.state.saving = false;
            local.state.save_priority = None;
            self.refresh_dirty(&mut local, &peers);
        }
        self.publish();
        self.refresh_status();
        self.refresh_version();
    }

    /// Announce the newest saved version once, whoever saved it.
    fn refresh_version(&self) {
        let peers = self.snapshot();
        let Some((saved_by, version)) = peers.latest_version() else {
            return;
        };
        {
            let mut local = self.lock_local();
            let newer = match &local.latest_version {
                Some(known) => compare_versions(version, known) == Ordering::Greater,
                None => true,
            };
            if !newer {
                return;
            }
            local.latest_version = Some(version.to_string());
        }
        info!("Version {} saved by peer {}", version, saved_by);
        self.events.emit(AutosaveEvent::VersionCreated {
            version: version.to_string(),
            saved_by,
            author: peers.get(saved_by).and_then(|entry| entry.author.clone()),
        });
    }

    /// Returns true if `dirty` flipped.
    fn refresh_dirty(&self, local: &mut Local, peers: &PeerSnapshot) -> bool {
        let dirty = compute_dirty(self.peer_id, &local.state, peers);
        if dirty == local.state.dirty {
            return false;
        }
        local.state.dirty = dirty;
        local.dirty_since = dirty.then(Instant::now);
        true
    }

    fn refresh_status(&self) {
        self.status.update(derive_status(&self.snapshot()));
    }

    /// Every peer as published, including our own last publish.
    fn remote_snapshot(&self) -> PeerSnapshot {
        PeerSnapshot::from_awareness(
            self.awareness.states(),
            &self.config.state_field,
            &self.config.author_field,
        )
    }

    /// Every peer, with our own entry replaced by the current local state.
    fn snapshot(&self) -> PeerSnapshot {
        let local = self.local_state();
        self.remote_snapshot().with_local(self.peer_id, local)
    }

    fn publish(&self) {
        if let Err(e) = self.try_publish() {
            error!("Failed to publish autosave state for {}: {}", self.peer_id, e);
        }
    }

    fn try_publish(&self) -> Result<()> {
        let value = serde_json::to_value(self.local_state())?;
        self.awareness
            .set_local_state_field(&self.config.state_field, value);
        Ok(())
    }

    fn is_stopped(&self) -> bool {
        self.lock_local().stopped
    }

    fn local_state(&self) -> PeerAutosaveState {
        self.lock_local().state.clone()
    }

    fn lock_local(&self) -> MutexGuard<'_, Local> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::AwarenessHub;
    use crate::document::MemoryDocument;
    use crate::save::SaveError;
    use crate::Author;

    fn never_called() -> Arc<dyn SaveHandler> {
        Arc::new(|_authors: Vec<Author>| async move {
            Err::<(), _>(SaveError::Rejected("unexpected save".into()))
        })
    }

    #[test]
    fn test_start_outside_runtime_fails() {
        let hub = AwarenessHub::new();
        let doc = MemoryDocument::new(PeerId::from(1));
        let result = AutosaveCoordinator::start(
            &doc,
            hub.join(PeerId::from(1)),
            never_called(),
            AutosaveConfig::default(),
        );
        assert!(matches!(result, Err(AutosaveError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_mismatched_peers() {
        let hub = AwarenessHub::new();
        let doc = MemoryDocument::new(PeerId::from(1));
        let result = AutosaveCoordinator::start(
            &doc,
            hub.join(PeerId::from(2)),
            never_called(),
            AutosaveConfig::default(),
        );
        assert!(matches!(
            result,
            Err(AutosaveError::PeerMismatch { document, awareness })
                if document == PeerId::from(1) && awareness == PeerId::from(2)
        ));
    }

    #[tokio::test]
    async fn test_start_publishes_initial_state() {
        let hub = AwarenessHub::new();
        let awareness = hub.join(PeerId::from(1));
        let doc = MemoryDocument::new(PeerId::from(1));
        let coordinator = AutosaveCoordinator::start(
            &doc,
            awareness.clone(),
            never_called(),
            AutosaveConfig::default(),
        )
        .unwrap();

        let published = &awareness.states()[&PeerId::from(1)]["autosave"];
        let state: PeerAutosaveState = serde_json::from_value(published.clone()).unwrap();
        assert_eq!(state, PeerAutosaveState::default());
        assert_eq!(coordinator.status(), SaveStatus::Saved);
        assert!(!coordinator.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_write_back_and_remote_updates_are_ignored() {
        let hub = AwarenessHub::new();
        let doc = MemoryDocument::new(PeerId::from(1));
        let coordinator = AutosaveCoordinator::start(
            &doc,
            hub.join(PeerId::from(1)),
            never_called(),
            AutosaveConfig::default(),
        )
        .unwrap();

        doc.apply(DocumentUpdate::local().with_origin("autosave"));
        doc.apply(DocumentUpdate::remote());
        assert_eq!(coordinator.state().update_count, 0);
        assert!(!coordinator.inner.timer.is_pending());

        // A foreign origin is still a local edit.
        doc.apply(DocumentUpdate::local().with_origin("paste"));
        assert_eq!(coordinator.state().update_count, 1);
        assert!(coordinator.is_dirty());
        assert!(coordinator.inner.timer.is_pending());
    }
}
