use serde::{Deserialize, Serialize};

use crate::state::phase::ContestPhase;

/// Contest phase as spelled on the wire (REST documents and phase signals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WirePhase {
    /// Contest has not started.
    Upcoming,
    /// Contest is running.
    Live,
    /// Contest is over.
    Ended,
}

impl From<WirePhase> for ContestPhase {
    fn from(value: WirePhase) -> Self {
        match value {
            WirePhase::Upcoming => ContestPhase::Upcoming,
            WirePhase::Live => ContestPhase::Live,
            WirePhase::Ended => ContestPhase::Ended,
        }
    }
}

impl From<ContestPhase> for WirePhase {
    fn from(value: ContestPhase) -> Self {
        match value {
            ContestPhase::Upcoming => WirePhase::Upcoming,
            ContestPhase::Live => WirePhase::Live,
            ContestPhase::Ended => WirePhase::Ended,
        }
    }
}
