//! Per-peer autosave state gossiped through the awareness channel.

use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The autosave entry one peer publishes about itself.
///
/// Every field defaults so that entries written by older or partial clients
/// still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerAutosaveState {
    /// Local edits made by this peer since it joined. Never decreases.
    pub update_count: u64,
    /// For each peer, the highest `update_count` this peer has persisted.
    /// Only written after a successful save, and replaced as a whole.
    pub saved_update_count: BTreeMap<PeerId, u64>,
    /// Local edits not yet confirmed persisted by any peer.
    pub dirty: bool,
    /// A save callback invocation is in flight on this peer.
    pub saving: bool,
    /// Priority of the in-flight save, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_priority: Option<SavePriority>,
    /// Document version created by this peer's last successful save, when
    /// the storage reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PeerAutosaveState {
    /// The update count of `peer` this peer vouches for, zero if none.
    pub fn saved_for(&self, peer: PeerId) -> u64 {
        self.saved_update_count.get(&peer).copied().unwrap_or(0)
    }
}

/// Order two document versions such as `"1.9"` and `"1.10"`.
///
/// Dot-separated components compare numerically when both are numbers and
/// as text otherwise. A version that is a prefix of another is older.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let order = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if order != Ordering::Equal {
                    return order;
                }
            }
        }
    }
}

/// Why a save was started. Manual saves win arbitration over autosaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SavePriority {
    Auto,
    Manual,
}

/// Identity of a peer, taken from its awareness entry and handed to the
/// save callback for every peer with unsaved changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
