//! # Redflag Hedge
//!
//! Cross-venue premium hedging: a long spot position on a local-currency
//! venue, offset by a short perpetual on a stable-coin derivative venue.
//! Positions are built while the premium is low and unwound in stages as it
//! rises.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Venue abstraction and the paper venue
//! - `strategy`: Premium, two-leg execution, balancing and the hedge cycle
//! - `risk`: Position ledger, stage timers, failure quarantine, in-progress guards
//! - `persistence`: SQLite journal for timers, failure counters and executions
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
