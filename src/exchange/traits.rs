//! Venue capability trait consumed by the hedging core.
//!
//! Each venue (local spot exchange, derivative exchange, paper venue)
//! implements [`VenueAdapter`]; the implementation is picked at startup and
//! shared as `Arc<dyn VenueAdapter>`. The core never speaks a wire protocol
//! itself.

use super::error::{VenueError, VenueResult};
use super::types::{Balance, MarketInfo, OrderAck, OrderOptions, OrderSide, Ticker, VenuePosition};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Market data, balances, positions and order placement for one venue.
///
/// Amount units for [`create_market_order`](VenueAdapter::create_market_order):
/// spot pairs take coin units, derivative pairs take whole contracts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    /// Lowercase venue name, used for minimum order lookups and logs.
    fn name(&self) -> &str;

    async fn get_ticker(&self, pair: &str) -> VenueResult<Ticker>;

    async fn get_balance(&self, asset: &str) -> VenueResult<Balance>;

    async fn create_market_order(
        &self,
        pair: &str,
        side: OrderSide,
        amount: Decimal,
        options: OrderOptions,
    ) -> VenueResult<OrderAck>;

    /// Open derivative positions. Spot venues return an empty list.
    async fn get_positions(&self) -> VenueResult<Vec<VenuePosition>>;

    /// Derivative market specs keyed by pair. Spot venues return an empty map.
    async fn get_markets(&self) -> VenueResult<HashMap<String, MarketInfo>>;
}

/// Contract size of a derivative pair.
pub async fn contract_size(venue: &dyn VenueAdapter, pair: &str) -> VenueResult<Decimal> {
    let markets = venue.get_markets().await?;
    match markets.get(pair) {
        Some(info) if info.contract_size > Decimal::ZERO => Ok(info.contract_size),
        Some(_) => Err(VenueError::MissingField {
            pair: pair.to_string(),
            field: "contract_size",
        }),
        None => Err(VenueError::MarketUnavailable(pair.to_string())),
    }
}

/// Short position held on `pair`, if any.
pub async fn short_position(
    venue: &dyn VenueAdapter,
    pair: &str,
) -> VenueResult<Option<VenuePosition>> {
    let positions = venue.get_positions().await?;
    Ok(positions
        .into_iter()
        .find(|p| p.symbol == pair && p.side == super::types::PositionSide::Short))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::types::PositionSide;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_contract_size_lookup() {
        let mut venue = MockVenueAdapter::new();
        venue.expect_get_markets().returning(|| {
            Ok(HashMap::from([(
                "XRP/USDT:USDT".to_string(),
                MarketInfo {
                    contract_size: dec!(10),
                },
            )]))
        });

        assert_eq!(contract_size(&venue, "XRP/USDT:USDT").await, Ok(dec!(10)));
        assert_eq!(
            contract_size(&venue, "ETH/USDT:USDT").await,
            Err(VenueError::MarketUnavailable("ETH/USDT:USDT".to_string()))
        );
    }

    #[tokio::test]
    async fn test_short_position_ignores_longs_and_other_pairs() {
        let mut venue = MockVenueAdapter::new();
        venue.expect_get_positions().returning(|| {
            Ok(vec![
                VenuePosition {
                    symbol: "XRP/USDT:USDT".into(),
                    side: PositionSide::Long,
                    contracts: dec!(5),
                    notional: None,
                    mark_price: None,
                },
                VenuePosition {
                    symbol: "XRPUP/USDT:USDT".into(),
                    side: PositionSide::Short,
                    contracts: dec!(7),
                    notional: None,
                    mark_price: None,
                },
            ])
        });

        assert_eq!(short_position(&venue, "XRP/USDT:USDT").await, Ok(None));
    }
}
