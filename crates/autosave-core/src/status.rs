//! Global save status derived from every peer's autosave entry.

use crate::events::{AutosaveEvent, EventBus};
use crate::peers::PeerSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Mutex};

/// Coarse document status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaveStatus {
    Unsaved,
    Saving,
    Saved,
}

impl Display for SaveStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaveStatus::Unsaved => "UNSAVED",
            SaveStatus::Saving => "SAVING",
            SaveStatus::Saved => "SAVED",
        };
        f.write_str(name)
    }
}

/// Saving wins over dirty, dirty wins over saved.
pub fn derive_status(peers: &PeerSnapshot) -> SaveStatus {
    if peers.any_saving() {
        SaveStatus::Saving
    } else if peers.any_dirty() {
        SaveStatus::Unsaved
    } else {
        SaveStatus::Saved
    }
}

/// Publishes `StatusChanged` events, only on actual transitions.
///
/// Starts out as `Saved`, so a peer joining a clean session emits nothing.
pub struct StatusEmitter {
    last: Mutex<SaveStatus>,
    bus: Arc<EventBus<AutosaveEvent>>,
}

impl StatusEmitter {
    pub fn new(bus: Arc<EventBus<AutosaveEvent>>) -> Self {
        Self {
            last: Mutex::new(SaveStatus::Saved),
            bus,
        }
    }

    pub fn current(&self) -> SaveStatus {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `status`; emits and returns true if it differs from the last one.
    pub fn update(&self, status: SaveStatus) -> bool {
        {
            let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
            if *last == status {
                return false;
            }
            *last = status;
        }
        // Emitted outside the lock: listeners may call back into the coordinator.
        self.bus.emit(AutosaveEvent::StatusChanged { status });
        true
    }
}
