//! Hedge bookkeeping and safety state.
//!
//! - Logical position ledger
//! - Staged profit-taking timers
//! - Consecutive failure quarantine and structured alerts
//! - Per-symbol in-progress guard

mod in_progress;
mod malfunction;
mod position_tracker;
mod timers;

pub use in_progress::{InProgressGuard, InProgressSet, OperationKind};
pub use malfunction::{AlertKind, AlertSeverity, FailureTracker, HedgeAlert};
pub use position_tracker::{CloseFill, OpenFill, Position, PositionManager};
pub use timers::{StageTrigger, TimerManager, TimerStatus};
