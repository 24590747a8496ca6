//! Hedge strategy.
//!
//! Contains the core logic for:
//! - Premium calculation across the two venues
//! - Two-leg order execution with compensation
//! - Post-trade balance correction between legs
//! - The periodic build / profit-taking cycle

mod balancer;
mod error;
mod executor;
mod orchestrator;
mod premium;

pub use balancer::{PositionBalance, PositionBalancer, RebalanceAction, RebalanceResult};
pub use error::{
    BalanceError, Compensation, ExecutionError, LegOutcome, OrchestratorError, PremiumError,
};
pub use executor::{HedgeDirection, HedgeFill, OrderExecutor};
pub use orchestrator::{HedgeOrchestrator, SkipReason, SymbolOutcome};
pub use premium::{premium_pct, PremiumCalculator, PremiumQuote};
