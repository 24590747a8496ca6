//! Cross-venue premium.
//!
//! premium = ((local ask / stable-coin ask) / derivative bid - 1) * 100
//!
//! Asks are used on the local venue and the bid on the derivative venue:
//! those are the prices a hedge open actually executes at.

use super::error::PremiumError;
use crate::exchange::{MarketPairs, VenueAdapter, VenueError};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

/// Prices behind a premium reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PremiumQuote {
    pub premium_pct: Decimal,
    pub local_ask: Decimal,
    pub stable_ask: Decimal,
    pub derivative_bid: Decimal,
}

impl PremiumQuote {
    /// Local ask converted to stable-coin units.
    pub fn local_ask_in_stable(&self) -> Decimal {
        self.local_ask / self.stable_ask
    }
}

/// Premium from raw prices. All inputs must be positive.
pub fn premium_pct(local_ask: Decimal, stable_ask: Decimal, derivative_bid: Decimal) -> Option<Decimal> {
    if local_ask <= Decimal::ZERO || stable_ask <= Decimal::ZERO || derivative_bid <= Decimal::ZERO {
        return None;
    }
    Some((local_ask / stable_ask / derivative_bid - Decimal::ONE) * Decimal::ONE_HUNDRED)
}

pub struct PremiumCalculator {
    local: Arc<dyn VenueAdapter>,
    derivative: Arc<dyn VenueAdapter>,
    pairs: MarketPairs,
}

impl PremiumCalculator {
    pub fn new(local: Arc<dyn VenueAdapter>, derivative: Arc<dyn VenueAdapter>, pairs: MarketPairs) -> Self {
        Self {
            local,
            derivative,
            pairs,
        }
    }

    pub async fn calculate(&self, symbol: &str) -> Result<Decimal, PremiumError> {
        Ok(self.quote(symbol).await?.premium_pct)
    }

    /// Fetch the three quotes and compute the premium.
    pub async fn quote(&self, symbol: &str) -> Result<PremiumQuote, PremiumError> {
        let unavailable = |source: VenueError| PremiumError::Unavailable {
            symbol: symbol.to_string(),
            source,
        };

        let local_pair = self.pairs.local_pair(symbol);
        let stable_pair = self.pairs.stable_pair();
        let derivative_pair = self.pairs.derivative_pair(symbol);

        let (local, stable, derivative) = tokio::join!(
            self.local.get_ticker(&local_pair),
            self.local.get_ticker(&stable_pair),
            self.derivative.get_ticker(&derivative_pair),
        );

        let local_ask = local.and_then(|t| t.require_ask(&local_pair)).map_err(unavailable)?;
        let stable_ask = stable.and_then(|t| t.require_ask(&stable_pair)).map_err(unavailable)?;
        let derivative_bid = derivative
            .and_then(|t| t.require_bid(&derivative_pair))
            .map_err(unavailable)?;

        // require_* already rejects non-positive prices
        let premium_pct = premium_pct(local_ask, stable_ask, derivative_bid).ok_or_else(|| {
            unavailable(VenueError::MissingField {
                pair: derivative_pair.clone(),
                field: "bid",
            })
        })?;

        debug!(%symbol, %premium_pct, %local_ask, %stable_ask, %derivative_bid, "Premium calculated");

        Ok(PremiumQuote {
            premium_pct,
            local_ask,
            stable_ask,
            derivative_bid,
        })
    }
}
