//! Errors raised while setting up a coordinator.
//!
//! Save failures are not errors at this level: they surface as
//! `SaveOutcome::Failed` and `AutosaveEvent::SaveFailed`.

use crate::PeerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AutosaveError {
    #[error("Autosave must be started inside a tokio runtime: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),

    #[error("Document peer {document} does not match awareness peer {awareness}")]
    PeerMismatch { document: PeerId, awareness: PeerId },

    #[error("Failed to encode autosave state: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AutosaveError>;
