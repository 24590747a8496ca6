//! Error types for premium calculation, execution and balancing.

use super::executor::HedgeFill;
use crate::exchange::VenueError;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PremiumError {
    #[error("Price unavailable for {symbol}: {source}")]
    Unavailable {
        symbol: String,
        #[source]
        source: VenueError,
    },
}

/// Outcome of one leg, as carried in [`ExecutionError::LegFailure`].
#[derive(Debug, Clone, PartialEq)]
pub enum LegOutcome {
    Filled { order_id: String, quantity: Decimal },
    Failed(String),
    TimedOut,
    /// Nothing to trade on this venue
    Skipped,
}

impl LegOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, LegOutcome::Filled { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, LegOutcome::Filled { .. } | LegOutcome::Skipped)
    }

    pub fn filled_quantity(&self) -> Decimal {
        match self {
            LegOutcome::Filled { quantity, .. } => *quantity,
            _ => Decimal::ZERO,
        }
    }

    pub fn order_id(&self) -> Option<String> {
        match self {
            LegOutcome::Filled { order_id, .. } => Some(order_id.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Display for LegOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LegOutcome::Filled { order_id, quantity } => write!(f, "filled {quantity} ({order_id})"),
            LegOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            LegOutcome::TimedOut => write!(f, "timed out"),
            LegOutcome::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of a compensating order.
#[derive(Debug, Clone, PartialEq)]
pub enum Compensation {
    NotNeeded,
    Completed { order_id: String },
    Failed(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Data unavailable for {symbol}: {reason}")]
    DataUnavailable { symbol: String, reason: String },

    #[error("Invalid request for {symbol}: {reason}")]
    InvalidRequest { symbol: String, reason: String },

    #[error("{venue} order {notional_usd} USD below minimum {minimum_usd} USD")]
    BelowMinimum {
        venue: String,
        notional_usd: Decimal,
        minimum_usd: Decimal,
    },

    #[error("Insufficient {asset} on {venue}: need {required}, have {available}")]
    InsufficientBalance {
        venue: String,
        asset: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("Leg failure for {symbol}: spot {spot}, derivative {derivative}, compensation {compensation:?}")]
    LegFailure {
        symbol: String,
        spot: LegOutcome,
        derivative: LegOutcome,
        compensation: Compensation,
    },

    /// Both legs filled but disagree. `fill` holds the traded quantities,
    /// valued at the matched part only.
    #[error(
        "Uneven fill for {symbol}: spot {}, derivative {} contracts, {gap_pct}% apart",
        .fill.spot_quantity,
        .fill.contracts
    )]
    PartialFill {
        symbol: String,
        fill: Box<HedgeFill>,
        gap_pct: Decimal,
    },
}

impl ExecutionError {
    pub(crate) fn unavailable(symbol: &str, reason: impl ToString) -> Self {
        ExecutionError::DataUnavailable {
            symbol: symbol.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True when an unhedged leg may remain on a venue.
    pub fn needs_manual_action(&self) -> bool {
        matches!(
            self,
            ExecutionError::LegFailure {
                compensation: Compensation::Failed(_),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BalanceError {
    #[error("Balance query failed for {symbol}: {source}")]
    QueryFailed {
        symbol: String,
        #[source]
        source: VenueError,
    },

    #[error("Corrective order failed for {symbol}: {source}")]
    CorrectionFailed {
        symbol: String,
        #[source]
        source: VenueError,
    },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("{0} is already active")]
    AlreadyActive(String),

    #[error("{symbol} is not tradable on both venues: {reason}")]
    UnknownSymbol { symbol: String, reason: String },

    #[error(transparent)]
    Balance(#[from] BalanceError),
}
