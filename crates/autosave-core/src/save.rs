//! The host-supplied persistence callback and what a save attempt produced.

use crate::Author;
use async_trait::async_trait;
use std::future::Future;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Save rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What a successful save produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReceipt {
    /// Version the storage assigned to the saved document, if it keeps any.
    pub version: Option<String>,
}

impl SaveReceipt {
    pub fn version(version: impl Into<String>) -> Self {
        Self {
            version: Some(version.into()),
        }
    }
}

impl From<()> for SaveReceipt {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// Persists the document on behalf of `authors`.
///
/// Peers may call this concurrently with equivalent content; the storage
/// behind it has to tolerate duplicate saves.
#[async_trait]
pub trait SaveHandler: Send + Sync {
    async fn save(&self, authors: Vec<Author>) -> Result<SaveReceipt, SaveError>;
}

/// Closures may resolve to `()` or to a `SaveReceipt`.
#[async_trait]
impl<F, Fut, R> SaveHandler for F
where
    F: Fn(Vec<Author>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<R, SaveError>> + Send + 'static,
    R: Into<SaveReceipt> + Send,
{
    async fn save(&self, authors: Vec<Author>) -> Result<SaveReceipt, SaveError> {
        (self)(authors).await.map(Into::into)
    }
}

/// Result of one save attempt, as seen by the caller of `save()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The callback resolved; this peer now vouches for the snapshot.
    Saved {
        authors: Vec<Author>,
        version: Option<String>,
    },
    /// No peer was dirty, the callback was not invoked.
    NothingToSave,
    /// This peer already has a save in flight.
    AlreadySaving,
    /// Another peer won the save claim.
    Yielded,
    /// The callback rejected. State is unchanged apart from `saving`.
    Failed { error: String },
}
