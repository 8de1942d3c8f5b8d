//! autosave-core: Leaderless autosave coordination for collaboratively edited documents.
//!
//! This crate provides:
//! - `AutosaveCoordinator`, which decides when and which peer persists a shared
//!   document, using only an awareness (presence) channel between peers
//! - Global `UNSAVED`/`SAVING`/`SAVED` status, emitted only on transitions
//! - `Awareness`, `DocumentLog` and `SaveHandler` trait abstractions, with
//!   in-memory implementations and a Loro document adapter

pub mod awareness;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod events;
pub mod peer_id;
pub mod peers;
pub mod save;
pub mod state;
pub mod status;
pub mod timer;

pub use awareness::{Awareness, AwarenessChange, AwarenessHub, AwarenessState, MemoryAwareness};
pub use config::AutosaveConfig;
pub use coordinator::AutosaveCoordinator;
pub use document::{DocumentLog, DocumentUpdate, LoroDocumentLog, MemoryDocument, UpdateSource};
pub use error::AutosaveError;
pub use events::{AutosaveEvent, EventBus, Subscription};
pub use peer_id::{PeerId, PeerIdError};
pub use peers::PeerSnapshot;
pub use save::{SaveError, SaveHandler, SaveOutcome, SaveReceipt};
pub use state::{compare_versions, Author, PeerAutosaveState, SavePriority};
pub use status::SaveStatus;
