//! In-memory ledger of each symbol's logical hedge position.
//!
//! The ledger is bookkeeping only: the venues remain the source of truth
//! for held quantities. Values change only through successful executions
//! or explicit seeding from existing balances, and never go negative.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Logical hedge position for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Logical position value in USD
    pub value_usd: Decimal,
    /// Spot coins held on the local venue
    pub spot_quantity: Decimal,
    /// Short contracts held on the derivative venue
    pub derivative_contracts: Decimal,
    /// Derivative price at the most recent open
    pub entry_price: Decimal,
    /// USD value of the spot leg at the last update
    pub long_value_usd: Decimal,
    /// USD value of the short leg at the last update
    pub short_value_usd: Decimal,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn empty(symbol: &str) -> Self {
        let now = Utc::now();
        Self {
            symbol: symbol.to_string(),
            value_usd: Decimal::ZERO,
            spot_quantity: Decimal::ZERO,
            derivative_contracts: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            long_value_usd: Decimal::ZERO,
            short_value_usd: Decimal::ZERO,
            opened_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.value_usd > Decimal::ZERO
    }
}

/// Quantities filled by a successful open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenFill {
    pub value_usd: Decimal,
    pub spot_quantity: Decimal,
    pub contracts: Decimal,
    pub price: Decimal,
}

/// Quantities released by a successful close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloseFill {
    pub value_usd: Decimal,
    pub spot_quantity: Decimal,
    pub contracts: Decimal,
}

#[derive(Debug, Default)]
pub struct PositionManager {
    positions: HashMap<String, Position>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol with an empty position. Keeps an existing entry.
    pub fn add_symbol(&mut self, symbol: &str) {
        self.positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::empty(symbol));
    }

    /// Replace the position with one seeded from venue balances.
    pub fn seed(&mut self, position: Position) {
        info!(
            symbol = %position.symbol,
            value_usd = %position.value_usd,
            spot = %position.spot_quantity,
            contracts = %position.derivative_contracts,
            "Seeded position from venue balances"
        );
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Logical value in USD, zero for unknown symbols.
    pub fn value_of(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.value_usd)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn record_open(&mut self, symbol: &str, fill: OpenFill) {
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::empty(symbol));

        if !position.is_open() {
            position.opened_at = Utc::now();
        }
        position.value_usd += fill.value_usd;
        position.spot_quantity += fill.spot_quantity;
        position.derivative_contracts += fill.contracts;
        position.entry_price = fill.price;
        position.long_value_usd += fill.value_usd;
        position.short_value_usd += fill.value_usd;
        position.updated_at = Utc::now();

        debug!(
            %symbol,
            added_usd = %fill.value_usd,
            value_usd = %position.value_usd,
            "Position increased"
        );
    }

    /// Reduce the position. Every field is clamped at zero.
    pub fn record_close(&mut self, symbol: &str, fill: CloseFill) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };

        position.value_usd = (position.value_usd - fill.value_usd).max(Decimal::ZERO);
        position.spot_quantity = (position.spot_quantity - fill.spot_quantity).max(Decimal::ZERO);
        position.derivative_contracts =
            (position.derivative_contracts - fill.contracts).max(Decimal::ZERO);
        position.long_value_usd = (position.long_value_usd - fill.value_usd).max(Decimal::ZERO);
        position.short_value_usd = (position.short_value_usd - fill.value_usd).max(Decimal::ZERO);
        position.updated_at = Utc::now();

        debug!(
            %symbol,
            removed_usd = %fill.value_usd,
            value_usd = %position.value_usd,
            "Position reduced"
        );
    }

    pub fn remove(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    /// Next build increment: `min(increment, max - value)`, never negative.
    pub fn increment_for(&self, symbol: &str, max_usd: Decimal, increment_usd: Decimal) -> Decimal {
        let room = (max_usd - self.value_of(symbol)).max(Decimal::ZERO);
        increment_usd.min(room)
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn total_value(&self) -> Decimal {
        self.positions.values().map(|p| p.value_usd).sum()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open(value: Decimal) -> OpenFill {
        OpenFill {
            value_usd: value,
            spot_quantity: dec!(140),
            contracts: dec!(14),
            price: dec!(0.7),
        }
    }

    #[test]
    fn test_open_then_partial_close() {
        let mut ledger = PositionManager::new();
        ledger.add_symbol("XRP");
        ledger.record_open("XRP", open(dec!(100)));
        ledger.record_open("XRP", open(dec!(100)));
        assert_eq!(ledger.value_of("XRP"), dec!(200));
        assert_eq!(ledger.get("XRP").unwrap().derivative_contracts, dec!(28));

        ledger.record_close(
            "XRP",
            CloseFill {
                value_usd: dec!(20),
                spot_quantity: dec!(28),
                contracts: dec!(3),
            },
        );
        let position = ledger.get("XRP").unwrap();
        assert_eq!(position.value_usd, dec!(180));
        assert_eq!(position.spot_quantity, dec!(252));
        assert_eq!(position.derivative_contracts, dec!(25));
    }

    #[test]
    fn test_close_never_negative() {
        let mut ledger = PositionManager::new();
        ledger.record_open("XRP", open(dec!(50)));
        ledger.record_close(
            "XRP",
            CloseFill {
                value_usd: dec!(80),
                spot_quantity: dec!(1000),
                contracts: dec!(100),
            },
        );
        let position = ledger.get("XRP").unwrap();
        assert_eq!(position.value_usd, Decimal::ZERO);
        assert_eq!(position.spot_quantity, Decimal::ZERO);
        assert!(!position.is_open());
    }

    #[test]
    fn test_increment_for() {
        let mut ledger = PositionManager::new();
        ledger.add_symbol("XRP");
        assert_eq!(ledger.increment_for("XRP", dec!(1500), dec!(100)), dec!(100));

        ledger.record_open("XRP", open(dec!(1450)));
        assert_eq!(ledger.increment_for("XRP", dec!(1500), dec!(100)), dec!(50));

        ledger.record_open("XRP", open(dec!(100)));
        assert_eq!(ledger.increment_for("XRP", dec!(1500), dec!(100)), Decimal::ZERO);
    }

    #[test]
    fn test_add_symbol_keeps_seed() {
        let mut ledger = PositionManager::new();
        let mut seeded = Position::empty("ETH");
        seeded.value_usd = dec!(300);
        ledger.seed(seeded);
        ledger.add_symbol("ETH");
        assert_eq!(ledger.value_of("ETH"), dec!(300));
        assert_eq!(ledger.symbols(), vec!["ETH".to_string()]);
        assert_eq!(ledger.total_value(), dec!(300));
    }
}
