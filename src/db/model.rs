//! View models returned by the repositories.

use crate::model::SyncEvent;

/// Result of `record_event`: either a fresh row or the event that absorbed
/// the write under the dedup rule.
#[derive(Debug, Clone)]
pub enum EventOutcome {
    Recorded(SyncEvent),
    Deduplicated(SyncEvent),
}

impl EventOutcome {
    pub fn event(&self) -> &SyncEvent {
        match self {
            EventOutcome::Recorded(e) | EventOutcome::Deduplicated(e) => e,
        }
    }

    pub fn was_deduplicated(&self) -> bool {
        matches!(self, EventOutcome::Deduplicated(_))
    }
}

/// Raw per-state job counts for one batch. `delayed` is kept separate here;
/// the batch coordinator folds it into `waiting` for the public stats.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchCounts {
    pub completed: i64,
    pub failed: i64,
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
}
