//! Operation engines
//!
//! Multi-step protocol flows persisted as state machines so an interrupted
//! send or melt can be resumed or rolled back after a restart.

pub mod locks;
pub mod melt;
pub mod send;

use serde::Serialize;

pub use locks::{OperationGuard, OperationLocks, RecoveryGuard, RecoveryLock};
pub use melt::{
    Bolt11Handler, MeltEngine, MeltExecution, MeltHandlerRegistry, MeltMethodHandler,
    MeltPendingDecision, MeltResult,
};
pub use send::SendEngine;

/// Outcome of a recovery pass over non-terminal operations
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub finalized: Vec<String>,
    pub rolled_back: Vec<String>,
    /// Interrupted operations moved forward to pending
    pub resumed: Vec<String>,
    /// Locked by another call, or left for a manual decision
    pub skipped: Vec<String>,
    pub still_pending: Vec<String>,
    /// (operation id, error)
    pub errors: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
