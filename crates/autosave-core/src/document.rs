//! Replicated document log: the source of "something changed" notifications.
//!
//! The coordinator never looks at document content. It needs the local peer
//! id and a stream of update notifications telling local edits apart from
//! remote ones and from its own save write-backs.

use crate::events::{EventBus, Subscription};
use crate::PeerId;
use loro::event::DiffEvent;
use loro::{EventTriggerKind, LoroDoc};
use std::sync::Arc;

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Produced by this peer (user edit or programmatic write).
    Local,
    /// Merged from another peer, or a checkout of an older version.
    Remote,
}

/// One update notification from the document log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpdate {
    pub source: UpdateSource,
    /// Origin tag of the commit, if the writer set one.
    pub origin: Option<String>,
}

impl DocumentUpdate {
    pub fn local() -> Self {
        Self {
            source: UpdateSource::Local,
            origin: None,
        }
    }

    pub fn remote() -> Self {
        Self {
            source: UpdateSource::Remote,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

pub type UpdateCallback = Box<dyn Fn(DocumentUpdate) + Send + Sync>;

/// Access to the replicated document the coordinator watches.
pub trait DocumentLog: Send + Sync {
    /// Stable identifier of this connection, shared with the awareness channel.
    fn peer_id(&self) -> PeerId;

    fn subscribe_updates(&self, callback: UpdateCallback) -> Subscription;
}

/// Document log driven by hand, for tests and simulations.
pub struct MemoryDocument {
    peer_id: PeerId,
    bus: Arc<EventBus<DocumentUpdate>>,
}

impl MemoryDocument {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            bus: Arc::new(EventBus::new()),
        }
    }

    /// A local user edit.
    pub fn edit(&self) {
        self.bus.emit(DocumentUpdate::local());
    }

    /// Deliver an arbitrary update notification.
    pub fn apply(&self, update: DocumentUpdate) {
        self.bus.emit(update);
    }
}

impl DocumentLog for MemoryDocument {
    fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn subscribe_updates(&self, callback: UpdateCallback) -> Subscription {
        self.bus.subscribe(callback)
    }
}

/// Document log backed by a Loro document.
///
/// Root events triggered by local commits are local updates carrying the
/// commit origin (see `LoroDoc::set_next_commit_origin`); imports and
/// checkouts are remote.
pub struct LoroDocumentLog {
    doc: LoroDoc,
}

impl LoroDocumentLog {
    pub fn new(doc: LoroDoc) -> Self {
        Self { doc }
    }

    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }
}

impl DocumentLog for LoroDocumentLog {
    fn peer_id(&self) -> PeerId {
        PeerId::from(self.doc.peer_id())
    }

    fn subscribe_updates(&self, callback: UpdateCallback) -> Subscription {
        let subscription = self.doc.subscribe_root(Arc::new(move |event: DiffEvent| {
            let source = match event.triggered_by {
                EventTriggerKind::Local => UpdateSource::Local,
                _ => UpdateSource::Remote,
            };
            let origin = (!event.origin.is_empty()).then(|| event.origin.to_string());
            callback(DocumentUpdate { source, origin });
        }));
        Subscription::new(move || drop(subscription))
    }
}
