//! Coordinator configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for an `AutosaveCoordinator`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutosaveConfig {
    /// Inactivity after the last local edit before a save is attempted (default: 1000ms)
    #[serde(default = "default_quiet_period")]
    pub quiet_period_ms: u64,

    /// Longest a peer may stay dirty while edits keep arriving (default: unbounded)
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// How long a peer advertises `saving` before deciding whether it won the
    /// save claim (default: no arbitration)
    #[serde(default)]
    pub claim_delay_ms: Option<u64>,

    /// Awareness field holding the autosave state
    #[serde(default = "default_state_field")]
    pub state_field: String,

    /// Awareness field holding the peer's author, `{"name": ...}`
    #[serde(default = "default_author_field")]
    pub author_field: String,

    /// Commit origin marking the coordinator's own save write-backs
    #[serde(default = "default_save_origin")]
    pub save_origin: String,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: default_quiet_period(),
            max_delay_ms: None,
            claim_delay_ms: None,
            state_field: default_state_field(),
            author_field: default_author_field(),
            save_origin: default_save_origin(),
        }
    }
}

impl AutosaveConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }

    pub fn claim_delay(&self) -> Option<Duration> {
        self.claim_delay_ms.map(Duration::from_millis)
    }

    pub fn with_quiet_period(mut self, period: Duration) -> Self {
        self.quiet_period_ms = millis(period);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = Some(millis(delay));
        self
    }

    pub fn with_claim_delay(mut self, delay: Duration) -> Self {
        self.claim_delay_ms = Some(millis(delay));
        self
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn default_quiet_period() -> u64 {
    1000
}

fn default_state_field() -> String {
    "autosave".to_string()
}

fn default_author_field() -> String {
    "user".to_string()
}

fn default_save_origin() -> String {
    "autosave".to_string()
}
