//! Cross-venue position balance detection and correction.
//!
//! Held quantities are always read from the venues, never from the ledger.
//! The derivative leg moves in whole contracts while the spot leg is
//! continuous, so each open or close can leave a small gap; this module
//! measures it and trades it away before it compounds.
//!
//! Thresholds: gap% at or below `balanced_gap_pct` is balanced, at or above
//! `rebalance_gap_pct` triggers a correction. The band in between is left
//! alone to avoid oscillating.

use super::error::BalanceError;
use crate::config::{BalanceConfig, ExecutionConfig, VenueConfig};
use crate::exchange::{
    contract_size, short_position, MarketPairs, OrderOptions, OrderSide, VenueAdapter, VenueError,
};
use crate::risk::{AlertKind, AlertSeverity, HedgeAlert};
use crate::utils::{
    contracts_covering, contracts_within, round_to_precision, safe_div, truncate_to_precision,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot of both legs as held on the venues.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionBalance {
    pub symbol: String,
    /// Coins held on the local venue
    pub spot_quantity: Decimal,
    /// Short contracts times contract size
    pub derivative_quantity: Decimal,
    pub spot_value_usd: Decimal,
    pub derivative_value_usd: Decimal,
    /// Absolute quantity gap in coins
    pub gap: Decimal,
    /// Gap as a percentage of the larger leg
    pub gap_pct: Decimal,
    pub is_balanced: bool,
    pub needs_rebalancing: bool,
    pub contract_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PositionBalance {
    fn from_quantities(
        symbol: &str,
        spot_quantity: Decimal,
        derivative_quantity: Decimal,
        contract_size: Decimal,
        values: (Decimal, Decimal),
        config: &BalanceConfig,
    ) -> Self {
        let gap = (spot_quantity - derivative_quantity).abs();
        let larger = spot_quantity.max(derivative_quantity);
        let gap_pct = safe_div(gap, larger) * Decimal::ONE_HUNDRED;
        Self {
            symbol: symbol.to_string(),
            spot_quantity,
            derivative_quantity,
            spot_value_usd: values.0,
            derivative_value_usd: values.1,
            gap,
            gap_pct,
            is_balanced: gap_pct <= config.balanced_gap_pct,
            needs_rebalancing: gap_pct >= config.rebalance_gap_pct,
            contract_size,
            timestamp: Utc::now(),
        }
    }

    pub fn spot_heavier(&self) -> bool {
        self.spot_quantity > self.derivative_quantity
    }

    /// Neither leg holds anything.
    pub fn is_flat(&self) -> bool {
        self.spot_quantity.is_zero() && self.derivative_quantity.is_zero()
    }
}

/// Corrective trade chosen by the balancer.
#[derive(Debug, Clone, PartialEq)]
pub enum RebalanceAction {
    None,
    /// Gap too small to trade
    Dust { gap: Decimal },
    BuySpot { quantity: Decimal },
    SellSpot { quantity: Decimal },
    AddShort { contracts: Decimal },
    ReduceShort { contracts: Decimal },
    /// Short the whole contracts that fit, sell the sub-contract remainder
    AddShortAndSellSpot { contracts: Decimal, quantity: Decimal },
    /// Cover whole contracts past the gap, sell the spot they overshoot by
    ReduceShortAndSellSpot { contracts: Decimal, quantity: Decimal },
}

impl RebalanceAction {
    pub fn is_trade(&self) -> bool {
        !matches!(self, RebalanceAction::None | RebalanceAction::Dust { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceResult {
    pub before: PositionBalance,
    pub action: RebalanceAction,
    /// Re-check after a corrective trade
    pub after: Option<PositionBalance>,
    /// Gap % left after a post-close correction, when it was alerted on
    pub residual_gap_pct: Option<Decimal>,
}

impl RebalanceResult {
    fn untouched(before: PositionBalance, action: RebalanceAction) -> Self {
        Self {
            before,
            action,
            after: None,
            residual_gap_pct: None,
        }
    }

    /// Latest known balance.
    pub fn current(&self) -> &PositionBalance {
        self.after.as_ref().unwrap_or(&self.before)
    }

    /// Change in matched coins (the smaller leg) made by the correction.
    pub fn hedged_change(&self) -> Decimal {
        let matched = |b: &PositionBalance| b.spot_quantity.min(b.derivative_quantity);
        matched(self.current()) - matched(&self.before)
    }
}

struct CorrectiveOrder<'a> {
    venue: &'a dyn VenueAdapter,
    pair: String,
    side: OrderSide,
    amount: Decimal,
    options: OrderOptions,
}

pub struct PositionBalancer {
    local: Arc<dyn VenueAdapter>,
    derivative: Arc<dyn VenueAdapter>,
    pairs: MarketPairs,
    config: BalanceConfig,
    settlement_wait: Duration,
    spot_decimals: u32,
}

impl PositionBalancer {
    pub fn new(
        local: Arc<dyn VenueAdapter>,
        derivative: Arc<dyn VenueAdapter>,
        config: BalanceConfig,
        execution: &ExecutionConfig,
        venues: &VenueConfig,
    ) -> Self {
        Self {
            local,
            derivative,
            pairs: MarketPairs::new(&venues.local_currency, &venues.stable_coin),
            config,
            settlement_wait: Duration::from_millis(execution.settlement_wait_ms),
            spot_decimals: execution.spot_decimals,
        }
    }

    /// Read both legs from the venues and compute the gap.
    pub async fn check(&self, symbol: &str) -> Result<PositionBalance, BalanceError> {
        let query_failed = |source: VenueError| BalanceError::QueryFailed {
            symbol: symbol.to_string(),
            source,
        };
        let derivative_pair = self.pairs.derivative_pair(symbol);

        let (spot_balance, short, contract_size) = tokio::join!(
            self.local.get_balance(symbol),
            short_position(self.derivative.as_ref(), &derivative_pair),
            contract_size(self.derivative.as_ref(), &derivative_pair),
        );
        let spot_quantity = spot_balance.map_err(query_failed)?.free;
        let short = short.map_err(query_failed)?;
        let contract_size = contract_size.map_err(query_failed)?;

        let derivative_quantity = short
            .as_ref()
            .map(|p| p.contracts * contract_size)
            .unwrap_or(Decimal::ZERO);

        let spot_value_usd = self.spot_value(symbol, spot_quantity).await;
        let derivative_value_usd = match short.as_ref() {
            Some(p) => match (p.notional, p.mark_price) {
                (Some(notional), _) => notional.abs(),
                (None, Some(mark)) => derivative_quantity * mark,
                (None, None) => self.derivative_value(&derivative_pair, derivative_quantity).await,
            },
            None => Decimal::ZERO,
        };

        let balance = PositionBalance::from_quantities(
            symbol,
            spot_quantity,
            derivative_quantity,
            contract_size,
            (spot_value_usd, derivative_value_usd),
            &self.config,
        );

        debug!(
            %symbol,
            spot = %balance.spot_quantity,
            derivative = %balance.derivative_quantity,
            gap = %balance.gap,
            gap_pct = %balance.gap_pct,
            balanced = balance.is_balanced,
            "Position balance checked"
        );
        Ok(balance)
    }

    /// Check every symbol, returning each result.
    pub async fn check_all(&self, symbols: &[String]) -> Vec<(String, Result<PositionBalance, BalanceError>)> {
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let result = self.check(symbol).await;
            if let Err(e) = &result {
                warn!(%symbol, error = %e, "Balance check failed");
            }
            results.push((symbol.clone(), result));
        }
        results
    }

    /// Trade the gap away when it reaches the rebalance threshold.
    ///
    /// When spot is heavier the whole contracts that fit in the gap are
    /// shorted and the sub-contract remainder is sold on spot, so the short
    /// never overshoots. When the short is heavier the gap is bought on spot.
    pub async fn rebalance(&self, symbol: &str) -> Result<RebalanceResult, BalanceError> {
        let before = self.check(symbol).await?;
        if !before.needs_rebalancing {
            return Ok(RebalanceResult::untouched(before, RebalanceAction::None));
        }

        let action = if before.spot_heavier() {
            let contracts = contracts_within(before.gap, before.contract_size);
            let remainder = truncate_to_precision(
                before.gap - contracts * before.contract_size,
                self.spot_decimals,
            );
            let trim = remainder >= self.config.dust_quantity;
            match (contracts.is_zero(), trim) {
                (true, false) => RebalanceAction::Dust { gap: before.gap },
                (true, true) => RebalanceAction::SellSpot { quantity: remainder },
                (false, false) => RebalanceAction::AddShort { contracts },
                (false, true) => RebalanceAction::AddShortAndSellSpot {
                    contracts,
                    quantity: remainder,
                },
            }
        } else {
            let quantity = round_to_precision(before.gap, self.spot_decimals);
            if quantity < self.config.dust_quantity {
                RebalanceAction::Dust { gap: before.gap }
            } else {
                RebalanceAction::BuySpot { quantity }
            }
        };

        self.apply(symbol, before, action).await
    }

    /// Post-close correction: wait for settlement, re-check, close the
    /// excess on the heavier leg if still imbalanced, then verify once more.
    /// A residual gap is reported, not treated as failure.
    ///
    /// Excess short is covered in whole contracts rounded up; the spot those
    /// contracts overshoot by is sold in the same correction.
    pub async fn after_close(&self, symbol: &str) -> Result<RebalanceResult, BalanceError> {
        self.settle().await;

        let before = self.check(symbol).await?;
        if before.is_balanced {
            debug!(%symbol, gap_pct = %before.gap_pct, "Balanced after close");
            return Ok(RebalanceResult::untouched(before, RebalanceAction::None));
        }

        let action = if before.spot_heavier() {
            let quantity = truncate_to_precision(before.gap, self.spot_decimals);
            if quantity < self.config.dust_quantity {
                RebalanceAction::Dust { gap: before.gap }
            } else {
                RebalanceAction::SellSpot { quantity }
            }
        } else {
            let contracts = contracts_covering(before.gap, before.contract_size);
            let overshoot = truncate_to_precision(
                contracts * before.contract_size - before.gap,
                self.spot_decimals,
            );
            if before.gap < self.config.dust_quantity || contracts.is_zero() {
                RebalanceAction::Dust { gap: before.gap }
            } else if overshoot >= self.config.dust_quantity {
                RebalanceAction::ReduceShortAndSellSpot {
                    contracts,
                    quantity: overshoot,
                }
            } else {
                RebalanceAction::ReduceShort { contracts }
            }
        };

        let traded = action.is_trade();
        if traded {
            info!(%symbol, gap = %before.gap, gap_pct = %before.gap_pct, ?action, "Closing excess after close");
        }
        let mut result = self.apply(symbol, before, action).await?;

        if traded {
            if let Some(after) = &result.after {
                if !after.is_balanced {
                    result.residual_gap_pct = Some(after.gap_pct);
                    HedgeAlert::new(
                        AlertKind::ResidualImbalance {
                            symbol: symbol.to_string(),
                            gap_pct: after.gap_pct,
                        },
                        AlertSeverity::Warning,
                        format!("{} still {}% imbalanced after close correction", symbol, after.gap_pct),
                        "Review on next cycle",
                    )
                    .emit();
                }
            }
        }
        Ok(result)
    }

    async fn apply(
        &self,
        symbol: &str,
        before: PositionBalance,
        action: RebalanceAction,
    ) -> Result<RebalanceResult, BalanceError> {
        let orders = match &action {
            RebalanceAction::None => return Ok(RebalanceResult::untouched(before, action)),
            RebalanceAction::Dust { gap } => {
                debug!(%symbol, %gap, "Gap below dust floor, skipping");
                return Ok(RebalanceResult::untouched(before, action));
            }
            RebalanceAction::BuySpot { quantity } => vec![self.spot_order(symbol, OrderSide::Buy, *quantity)],
            RebalanceAction::SellSpot { quantity } => vec![self.spot_order(symbol, OrderSide::Sell, *quantity)],
            RebalanceAction::AddShort { contracts } => vec![self.short_order(symbol, OrderSide::Sell, *contracts)],
            RebalanceAction::ReduceShort { contracts } => {
                vec![self.short_order(symbol, OrderSide::Buy, *contracts)]
            }
            RebalanceAction::AddShortAndSellSpot { contracts, quantity } => vec![
                self.short_order(symbol, OrderSide::Sell, *contracts),
                self.spot_order(symbol, OrderSide::Sell, *quantity),
            ],
            RebalanceAction::ReduceShortAndSellSpot { contracts, quantity } => vec![
                self.short_order(symbol, OrderSide::Buy, *contracts),
                self.spot_order(symbol, OrderSide::Sell, *quantity),
            ],
        };

        for order in orders {
            let ack = order
                .venue
                .create_market_order(&order.pair, order.side, order.amount, order.options)
                .await
                .map_err(|source| BalanceError::CorrectionFailed {
                    symbol: symbol.to_string(),
                    source,
                })?;

            info!(
                %symbol,
                venue = order.venue.name(),
                pair = %order.pair,
                side = %order.side,
                amount = %order.amount,
                order_id = %ack.id,
                gap_before = %before.gap,
                "Corrective order filled"
            );
        }

        self.settle().await;
        let after = self.check(symbol).await?;
        info!(%symbol, gap_pct_before = %before.gap_pct, gap_pct_after = %after.gap_pct, "Rebalanced");

        Ok(RebalanceResult {
            before,
            action,
            after: Some(after),
            residual_gap_pct: None,
        })
    }

    fn spot_order(&self, symbol: &str, side: OrderSide, quantity: Decimal) -> CorrectiveOrder<'_> {
        CorrectiveOrder {
            venue: self.local.as_ref(),
            pair: self.pairs.local_pair(symbol),
            side,
            amount: quantity,
            options: OrderOptions::default(),
        }
    }

    /// Selling adds short; buying covers it reduce-only.
    fn short_order(&self, symbol: &str, side: OrderSide, contracts: Decimal) -> CorrectiveOrder<'_> {
        let options = match side {
            OrderSide::Sell => OrderOptions::default(),
            OrderSide::Buy => OrderOptions::reduce_only(),
        };
        CorrectiveOrder {
            venue: self.derivative.as_ref(),
            pair: self.pairs.derivative_pair(symbol),
            side,
            amount: contracts,
            options,
        }
    }

    async fn settle(&self) {
        if !self.settlement_wait.is_zero() {
            tokio::time::sleep(self.settlement_wait).await;
        }
    }

    /// Spot leg in USD at the local bid converted at the stable-coin ask.
    async fn spot_value(&self, symbol: &str, quantity: Decimal) -> Decimal {
        if quantity.is_zero() {
            return Decimal::ZERO;
        }
        let local_pair = self.pairs.local_pair(symbol);
        let stable_pair = self.pairs.stable_pair();
        let (local, stable) = tokio::join!(
            self.local.get_ticker(&local_pair),
            self.local.get_ticker(&stable_pair),
        );
        let bid = local.and_then(|t| t.require_bid(&local_pair));
        let stable_ask = stable.and_then(|t| t.require_ask(&stable_pair));
        match (bid, stable_ask) {
            (Ok(bid), Ok(stable_ask)) => quantity * bid / stable_ask,
            (Err(e), _) | (_, Err(e)) => {
                debug!(%symbol, error = %e, "Spot valuation unavailable");
                Decimal::ZERO
            }
        }
    }

    async fn derivative_value(&self, pair: &str, quantity: Decimal) -> Decimal {
        match self
            .derivative
            .get_ticker(pair)
            .await
            .and_then(|t| t.require_last(pair))
        {
            Ok(last) => quantity * last,
            Err(e) => {
                debug!(%pair, error = %e, "Derivative valuation unavailable");
                Decimal::ZERO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockVenue;
    use rust_decimal_macros::dec;

    const SPOT: &str = "XRP/KRW";
    const PERP: &str = "XRP/USDT:USDT";

    async fn venues(spot: Decimal, short_contracts: Decimal, contract_size: Decimal) -> (Arc<MockVenue>, Arc<MockVenue>) {
        let local = MockVenue::new("paper").with_fee_rate(Decimal::ZERO);
        local.set_quote(SPOT, dec!(1300), dec!(1301)).await;
        local.set_quote("USDT/KRW", dec!(1299), dec!(1300)).await;
        local.set_balance("KRW", dec!(100000000)).await;
        local.set_balance("XRP", spot).await;

        let derivative = MockVenue::new("paper").with_fee_rate(Decimal::ZERO);
        derivative.set_quote(PERP, dec!(0.99), dec!(1.01)).await;
        derivative.set_market(PERP, contract_size).await;
        derivative.set_balance("USDT", dec!(10000)).await;
        derivative.set_short_contracts(PERP, short_contracts).await;

        (Arc::new(local), Arc::new(derivative))
    }

    fn balancer(local: Arc<MockVenue>, derivative: Arc<MockVenue>) -> PositionBalancer {
        balancer_with_decimals(local, derivative, ExecutionConfig::default().spot_decimals)
    }

    fn balancer_with_decimals(
        local: Arc<MockVenue>,
        derivative: Arc<MockVenue>,
        spot_decimals: u32,
    ) -> PositionBalancer {
        let execution = ExecutionConfig {
            settlement_wait_ms: 0,
            spot_decimals,
            ..Default::default()
        };
        PositionBalancer::new(
            local,
            derivative,
            BalanceConfig::default(),
            &execution,
            &VenueConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_gap_example() {
        // 100 coins spot vs 8 contracts of 10 = 80 coins short
        let (local, derivative) = venues(dec!(100), dec!(8), dec!(10)).await;
        let balancer = balancer(local, derivative.clone());

        let balance = balancer.check("XRP").await.unwrap();
        assert_eq!(balance.gap, dec!(20));
        assert_eq!(balance.gap_pct, dec!(20));
        assert!(!balance.is_balanced);
        assert!(balance.needs_rebalancing);
        assert_eq!(balance.spot_value_usd, dec!(100));
        assert_eq!(balance.derivative_value_usd, dec!(80));

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::AddShort { contracts: dec!(2) });
        assert_eq!(derivative.short_contracts(PERP).await, dec!(10));
        let after = result.after.unwrap();
        assert_eq!(after.derivative_quantity, dec!(100));
        assert!(after.is_balanced);
    }

    #[tokio::test]
    async fn test_rebalance_brings_gap_within_balanced_band() {
        let cases = [
            // (spot, short contracts, contract size)
            (dec!(100), dec!(97), dec!(1)),
            (dec!(1005), dec!(95), dec!(10)),
            (dec!(480), dec!(50), dec!(10)),
            (dec!(250.5), dec!(2600), dec!(0.1)),
        ];

        for (spot, contracts, cs) in cases {
            let (local, derivative) = venues(spot, contracts, cs).await;
            let balancer = balancer(local, derivative);
            let before = balancer.check("XRP").await.unwrap();
            assert!(before.gap_pct >= dec!(2), "case {spot}/{contracts}/{cs}");

            let result = balancer.rebalance("XRP").await.unwrap();
            let after = result.after.expect("corrective trade");
            assert!(after.gap_pct <= dec!(1), "case {spot}/{contracts}/{cs}: {}", after.gap_pct);
        }
    }

    #[tokio::test]
    async fn test_derivative_heavier_buys_spot() {
        let (local, derivative) = venues(dec!(90), dec!(10), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative);

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::BuySpot { quantity: dec!(10) });
        assert_eq!(local.balance_of("XRP").await, dec!(100));
    }

    #[tokio::test]
    async fn test_dead_zone_is_left_alone() {
        // 1.5% gap: not balanced, not rebalanced
        let (local, derivative) = venues(dec!(100), dec!(985), dec!(0.1)).await;
        let balancer = balancer(local.clone(), derivative.clone());

        let result = balancer.rebalance("XRP").await.unwrap();
        assert!(!result.before.is_balanced);
        assert!(!result.before.needs_rebalancing);
        assert_eq!(result.action, RebalanceAction::None);
        assert!(local.fills().await.is_empty());
        assert!(derivative.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_sub_contract_gap_is_sold_on_spot() {
        // 3 coin gap with 10 coin contracts: no whole contract fits
        let (local, derivative) = venues(dec!(83), dec!(8), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative.clone());

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::SellSpot { quantity: dec!(3) });
        assert!(derivative.fills().await.is_empty());
        assert_eq!(local.balance_of("XRP").await, dec!(80));
        assert!(result.current().is_balanced);
    }

    #[tokio::test]
    async fn test_spot_heavy_gap_never_overshoots_short() {
        // 5 coin gap against 10 coin contracts would flip to a 5% short-heavy
        // gap if rounded up to a whole contract
        let (local, derivative) = venues(dec!(105), dec!(10), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative.clone());

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::SellSpot { quantity: dec!(5) });
        assert_eq!(derivative.short_contracts(PERP).await, dec!(10));
        let after = result.after.unwrap();
        assert!(after.gap_pct <= dec!(1), "gap {}", after.gap_pct);

        // 55 coin gap: 5 contracts plus 5 coins sold
        let (local, derivative) = venues(dec!(1055), dec!(100), dec!(10)).await;
        let balancer = self::balancer(local.clone(), derivative.clone());

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(
            result.action,
            RebalanceAction::AddShortAndSellSpot {
                contracts: dec!(5),
                quantity: dec!(5)
            }
        );
        assert_eq!(derivative.short_contracts(PERP).await, dec!(105));
        assert_eq!(local.balance_of("XRP").await, dec!(1050));
        assert!(result.current().is_balanced);
        assert_eq!(result.hedged_change(), dec!(50));
    }

    #[tokio::test]
    async fn test_gap_below_dust_floor_is_skipped() {
        let (local, derivative) = venues(dec!(0.00005), dec!(0), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative.clone());

        let result = balancer.rebalance("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::Dust { gap: dec!(0.00005) });
        assert!(local.fills().await.is_empty());
        assert!(derivative.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_after_close_sells_excess_spot() {
        let (local, derivative) = venues(dec!(34), dec!(3), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative);

        let result = balancer.after_close("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::SellSpot { quantity: dec!(4) });
        assert_eq!(local.balance_of("XRP").await, dec!(30));
        assert!(result.current().is_balanced);
    }

    #[tokio::test]
    async fn test_after_close_reduces_excess_short() {
        let (local, derivative) = venues(dec!(0), dec!(2), dec!(10)).await;
        let balancer = balancer(local, derivative.clone());

        let result = balancer.after_close("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::ReduceShort { contracts: dec!(2) });
        assert_eq!(derivative.short_contracts(PERP).await, Decimal::ZERO);
        assert!(result.current().is_flat());
    }

    #[tokio::test]
    async fn test_after_close_covers_whole_contracts_and_sells_overshoot() {
        // 30 coins short against 25 spot: covering one contract leaves 20
        // short, so the 5 extra spot coins go too
        let (local, derivative) = venues(dec!(25), dec!(3), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative.clone());

        let result = balancer.after_close("XRP").await.unwrap();
        assert_eq!(
            result.action,
            RebalanceAction::ReduceShortAndSellSpot {
                contracts: dec!(1),
                quantity: dec!(5)
            }
        );
        assert_eq!(derivative.short_contracts(PERP).await, dec!(2));
        assert_eq!(local.balance_of("XRP").await, dec!(20));
        assert!(result.current().is_balanced);
        assert_eq!(result.residual_gap_pct, None);
    }

    #[tokio::test]
    async fn test_after_close_reports_residual_gap() {
        // Whole-coin spot precision: 5.6 coin excess can only sell 5
        let (local, derivative) = venues(dec!(25.6), dec!(2), dec!(10)).await;
        let balancer = balancer_with_decimals(local.clone(), derivative, 0);

        let result = balancer.after_close("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::SellSpot { quantity: dec!(5) });
        assert_eq!(local.balance_of("XRP").await, dec!(20.6));

        let after = result.after.as_ref().unwrap();
        assert!(!after.is_balanced);
        assert_eq!(result.residual_gap_pct, Some(after.gap_pct));
        assert!(after.gap_pct > dec!(2));
    }

    #[tokio::test]
    async fn test_after_close_balanced_does_nothing() {
        let (local, derivative) = venues(dec!(100), dec!(10), dec!(10)).await;
        let balancer = balancer(local.clone(), derivative);

        let result = balancer.after_close("XRP").await.unwrap();
        assert_eq!(result.action, RebalanceAction::None);
        assert!(local.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_issues_no_trade() {
        let (local, derivative) = venues(dec!(100), dec!(8), dec!(10)).await;
        derivative.set_positions_unavailable(true).await;
        let balancer = balancer(local.clone(), derivative.clone());

        assert!(matches!(
            balancer.rebalance("XRP").await,
            Err(BalanceError::QueryFailed { .. })
        ));
        assert!(local.fills().await.is_empty());
        assert!(derivative.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_check_all_reports_each_symbol() {
        let (local, derivative) = venues(dec!(100), dec!(10), dec!(10)).await;
        let balancer = balancer(local, derivative);

        let results = balancer
            .check_all(&["XRP".to_string(), "ETH".to_string()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].1.as_ref().unwrap().is_balanced);
        // ETH has no derivative market
        assert!(results[1].1.is_err());
    }
}
