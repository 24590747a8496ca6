//! Venue-neutral value types exchanged with adapters.

use super::error::{VenueError, VenueResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Best prices and 24h statistics. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    #[serde(default)]
    pub last: Option<Decimal>,
    #[serde(default)]
    pub bid: Option<Decimal>,
    #[serde(default)]
    pub ask: Option<Decimal>,
    #[serde(default)]
    pub high: Option<Decimal>,
    #[serde(default)]
    pub low: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<Decimal>,
}

impl Ticker {
    /// Ticker with only best bid and ask set; `last` is the midpoint.
    pub fn from_quote(bid: Decimal, ask: Decimal) -> Self {
        Self {
            last: Some((bid + ask) / Decimal::TWO),
            bid: Some(bid),
            ask: Some(ask),
            ..Default::default()
        }
    }

    pub fn require_ask(&self, pair: &str) -> VenueResult<Decimal> {
        require(self.ask, pair, "ask")
    }

    pub fn require_bid(&self, pair: &str) -> VenueResult<Decimal> {
        require(self.bid, pair, "bid")
    }

    pub fn require_last(&self, pair: &str) -> VenueResult<Decimal> {
        require(self.last, pair, "last")
    }

    /// Midpoint of bid and ask.
    pub fn require_mid(&self, pair: &str) -> VenueResult<Decimal> {
        let bid = self.require_bid(pair)?;
        let ask = self.require_ask(pair)?;
        Ok((bid + ask) / Decimal::TWO)
    }
}

fn require(value: Option<Decimal>, pair: &str, field: &'static str) -> VenueResult<Decimal> {
    match value {
        Some(v) if v > Decimal::ZERO => Ok(v),
        _ => Err(VenueError::MissingField {
            pair: pair.to_string(),
            field,
        }),
    }
}

/// Asset balance on a venue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn free_only(free: Decimal) -> Self {
        Self {
            free,
            used: Decimal::ZERO,
            total: free,
        }
    }
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Extra order flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderOptions {
    /// Only reduce an existing derivative position, never flip it
    pub reduce_only: bool,
}

impl OrderOptions {
    pub fn reduce_only() -> Self {
        Self { reduce_only: true }
    }
}

/// Order status as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Acknowledgement of a market order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub id: String,
    /// Filled amount in the unit the order was placed in
    pub filled: Decimal,
    pub status: OrderStatus,
}

impl OrderAck {
    /// Whether the venue accepted the order.
    pub fn is_accepted(&self) -> bool {
        !matches!(self.status, OrderStatus::Canceled | OrderStatus::Rejected)
            || self.filled > Decimal::ZERO
    }

    /// Filled amount, falling back to the requested amount when the venue
    /// does not report fills for market orders.
    pub fn filled_or(&self, requested: Decimal) -> Decimal {
        if self.filled > Decimal::ZERO {
            self.filled
        } else {
            requested
        }
    }
}

/// Side of a derivative position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

/// Open derivative position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    /// Derivative pair, e.g. `XRP/USDT:USDT`
    pub symbol: String,
    pub side: PositionSide,
    /// Number of contracts (always positive)
    pub contracts: Decimal,
    /// USD notional, if reported
    pub notional: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

/// Derivative market parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketInfo {
    /// Underlying units per contract
    pub contract_size: Decimal,
}

/// Builds the pair names the core uses on each venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketPairs {
    local_currency: String,
    stable_coin: String,
}

impl MarketPairs {
    pub fn new(local_currency: impl Into<String>, stable_coin: impl Into<String>) -> Self {
        Self {
            local_currency: local_currency.into(),
            stable_coin: stable_coin.into(),
        }
    }

    pub fn local_currency(&self) -> &str {
        &self.local_currency
    }

    pub fn stable_coin(&self) -> &str {
        &self.stable_coin
    }

    /// Spot pair on the local venue, e.g. `XRP/KRW`.
    pub fn local_pair(&self, symbol: &str) -> String {
        format!("{}/{}", symbol, self.local_currency)
    }

    /// Stable coin quoted in local currency, e.g. `USDT/KRW`.
    pub fn stable_pair(&self) -> String {
        format!("{}/{}", self.stable_coin, self.local_currency)
    }

    /// Linear perpetual on the derivative venue, e.g. `XRP/USDT:USDT`.
    pub fn derivative_pair(&self, symbol: &str) -> String {
        format!("{}/{}:{}", symbol, self.stable_coin, self.stable_coin)
    }
}

impl Default for MarketPairs {
    fn default() -> Self {
        Self::new("KRW", "USDT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_naming() {
        let pairs = MarketPairs::default();
        assert_eq!(pairs.local_pair("XRP"), "XRP/KRW");
        assert_eq!(pairs.stable_pair(), "USDT/KRW");
        assert_eq!(pairs.derivative_pair("XRP"), "XRP/USDT:USDT");
    }

    #[test]
    fn test_missing_ticker_fields() {
        let ticker = Ticker {
            last: Some(dec!(100)),
            ..Default::default()
        };
        assert!(ticker.require_last("X/KRW").is_ok());
        assert_eq!(
            ticker.require_ask("X/KRW"),
            Err(VenueError::MissingField {
                pair: "X/KRW".to_string(),
                field: "ask"
            })
        );
    }

    #[test]
    fn test_zero_price_counts_as_missing() {
        let ticker = Ticker::from_quote(dec!(0), dec!(10));
        assert!(ticker.require_bid("X").is_err());
        assert_eq!(ticker.require_ask("X").unwrap(), dec!(10));
    }

    #[test]
    fn test_rejected_ack_not_accepted() {
        let ack = OrderAck {
            id: "1".into(),
            filled: Decimal::ZERO,
            status: OrderStatus::Rejected,
        };
        assert!(!ack.is_accepted());
        assert_eq!(ack.filled_or(dec!(3)), dec!(3));
    }
}
