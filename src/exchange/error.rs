//! Venue error types.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VenueError {
    #[error("Market not available: {0}")]
    MarketUnavailable(String),

    #[error("Missing {field} for {pair}")]
    MissingField { pair: String, field: &'static str },

    #[error("Order rejected: {0}")]
    OrderRejected(String),

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

pub type VenueResult<T> = Result<T, VenueError>;
