//! Aggregate queries over the autosave entries of all connected peers.
//!
//! A `PeerSnapshot` is an immutable copy of the awareness map taken at one
//! instant. Queries are consistent within one snapshot, but nothing makes a
//! snapshot atomic across peers: another peer may start saving a moment after
//! it was taken, and the coordinator must tolerate acting on stale data.

use crate::awareness::AwarenessState;
use crate::state::compare_versions;
use crate::{Author, PeerAutosaveState, PeerId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::debug;

/// One peer's decoded awareness entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub state: PeerAutosaveState,
    /// `None` when the peer did not publish a readable author.
    pub author: Option<Author>,
}

/// Snapshot of every peer with a readable autosave entry, ordered by peer id.
#[derive(Debug, Clone, Default)]
pub struct PeerSnapshot {
    entries: BTreeMap<PeerId, PeerEntry>,
}

impl PeerSnapshot {
    /// Decode awareness states. Peers whose autosave field is missing or
    /// malformed are left out: they contribute neither dirty nor saving.
    pub fn from_awareness(
        states: HashMap<PeerId, AwarenessState>,
        state_field: &str,
        author_field: &str,
    ) -> Self {
        let mut entries = BTreeMap::new();
        for (peer_id, mut fields) in states {
            let Some(raw_state) = fields.remove(state_field) else {
                continue;
            };
            let state = match serde_json::from_value::<PeerAutosaveState>(raw_state) {
                Ok(state) => state,
                Err(e) => {
                    debug!("Ignoring malformed autosave entry from {}: {}", peer_id, e);
                    continue;
                }
            };
            let author = fields
                .remove(author_field)
                .and_then(|raw| serde_json::from_value::<Author>(raw).ok());
            entries.insert(peer_id, PeerEntry { state, author });
        }
        Self { entries }
    }

    /// Build a snapshot from already decoded states, without authors.
    pub fn from_states(states: impl IntoIterator<Item = (PeerId, PeerAutosaveState)>) -> Self {
        let entries = states
            .into_iter()
            .map(|(peer_id, state)| (peer_id, PeerEntry { state, author: None }))
            .collect();
        Self { entries }
    }

    /// Replace `peer_id`'s state with a fresher local copy, keeping its author.
    ///
    /// The awareness map only holds what was last published; the local peer
    /// always knows its own state better.
    pub fn with_local(mut self, peer_id: PeerId, state: PeerAutosaveState) -> Self {
        match self.entries.get_mut(&peer_id) {
            Some(entry) => entry.state = state,
            None => {
                self.entries.insert(peer_id, PeerEntry { state, author: None });
            }
        }
        self
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerEntry> {
        self.entries.get(&peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn any_saving(&self) -> bool {
        self.entries.values().any(|entry| entry.state.saving)
    }

    pub fn any_dirty(&self) -> bool {
        self.entries.values().any(|entry| entry.state.dirty)
    }

    /// Distinct authors of every dirty peer, in peer id order.
    ///
    /// A dirty peer without a readable author is credited under its peer id,
    /// so its changes are never skipped for lack of a name.
    pub fn dirty_authors(&self) -> Vec<Author> {
        let mut seen = HashSet::new();
        let mut authors = Vec::new();
        for (peer_id, entry) in &self.entries {
            if !entry.state.dirty {
                continue;
            }
            let author = entry
                .author
                .clone()
                .unwrap_or_else(|| Author::new(peer_id.to_string()));
            if seen.insert(author.name.clone()) {
                authors.push(author);
            }
        }
        authors
    }

    /// Current `update_count` of every peer, as vouched for after a save.
    pub fn update_counts(&self) -> BTreeMap<PeerId, u64> {
        self.entries
            .iter()
            .map(|(peer_id, entry)| (*peer_id, entry.state.update_count))
            .collect()
    }

    /// Whether a peer other than `except` has persisted `count` edits of `peer`.
    pub fn confirmed_by_other(&self, peer: PeerId, count: u64, except: PeerId) -> bool {
        self.entries
            .iter()
            .filter(|(id, _)| **id != except)
            .any(|(_, entry)| entry.state.saved_for(peer) >= count)
    }

    /// Peers other than `except` that are dirty.
    pub fn dirty_peers(&self, except: PeerId) -> BTreeSet<PeerId> {
        self.iter()
            .filter(|(id, entry)| *id != except && entry.state.dirty)
            .map(|(id, _)| id)
            .collect()
    }

    /// Newest version any peer has saved, with the peer that saved it.
    /// Equal versions from several peers resolve to the lowest peer id.
    pub fn latest_version(&self) -> Option<(PeerId, &str)> {
        self.iter()
            .filter_map(|(id, entry)| entry.state.version.as_deref().map(|v| (id, v)))
            .max_by(|(a_id, a), (b_id, b)| compare_versions(a, b).then_with(|| b_id.cmp(a_id)))
    }

    /// The peer that should go ahead when several claim a save at once:
    /// highest priority first, then lowest peer id.
    pub fn save_winner(&self) -> Option<PeerId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state.saving)
            .max_by(|(a_id, a), (b_id, b)| {
                a.state
                    .save_priority
                    .cmp(&b.state.save_priority)
                    .then_with(|| b_id.cmp(a_id))
            })
            .map(|(peer_id, _)| *peer_id)
    }
}

/// Recompute `dirty` for `local_id` from its own state and everyone else's.
///
/// Clean when there are no edits, or when some peer (possibly itself) has
/// saved at least `update_count` of them.
pub fn compute_dirty(local_id: PeerId, state: &PeerAutosaveState, peers: &PeerSnapshot) -> bool {
    let count = state.update_count;
    count > 0
        && state.saved_for(local_id) < count
        && !peers.confirmed_by_other(local_id, count, local_id)
}
