//! Item states shown for sequence tree nodes.

use serde::{Deserialize, Serialize};

/// Processing state of a sequence node. A node without state is `None` in an `Option`.
///
/// ```text
/// (none) ──> Processing ──> Success | Error | Stopped            (sample, contact)
/// (none) ──> Active ──> Success | Compliance | Timeout
///                       | Error | AnalysisError | Stopped          (measurement)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    /// Container node is being worked on
    Processing,
    /// Measurement node is running
    Active,
    /// Completed without error
    Success,
    /// Instrument protection limit tripped
    Compliance,
    /// Instrument transport timed out
    Timeout,
    /// Any other failure
    Error,
    /// Aborted or never started because of an abort
    Stopped,
    /// Post-measurement analysis rejected the data
    AnalysisError,
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemState::Processing => write!(f, "Processing..."),
            ItemState::Active => write!(f, "Active"),
            ItemState::Success => write!(f, "Success"),
            ItemState::Compliance => write!(f, "Compliance"),
            ItemState::Timeout => write!(f, "Timeout"),
            ItemState::Error => write!(f, "Error"),
            ItemState::Stopped => write!(f, "Stopped"),
            ItemState::AnalysisError => write!(f, "AnalysisError"),
        }
    }
}

impl ItemState {
    /// True while the node is being worked on.
    pub fn is_busy(&self) -> bool {
        matches!(self, ItemState::Processing | ItemState::Active)
    }

    /// True for final states other than `Success`.
    pub fn is_failure(&self) -> bool {
        !self.is_busy() && *self != ItemState::Success
    }
}
