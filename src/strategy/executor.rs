//! Coordinated two-leg order execution.
//!
//! Every open or close is a spot order on the local venue and a derivative
//! order on the derivative venue, dispatched together and awaited together.
//! The derivative leg is quantized to whole contracts first and the spot
//! quantity is derived from that contract count, so both legs carry the same
//! coin quantity. When exactly one leg fills, a compensating order unwinds it.
//! When both legs fill but disagree by more than the fill tolerance, the
//! open is reported as a partial fill carrying what actually traded.

use super::error::{Compensation, ExecutionError, LegOutcome};
use crate::config::{BalanceConfig, ExecutionConfig, VenueConfig};
use crate::exchange::{
    contract_size, short_position, MarketPairs, OrderOptions, OrderSide, VenueAdapter,
};
use crate::risk::{AlertKind, AlertSeverity, CloseFill, HedgeAlert, OpenFill};
use crate::utils::{contracts_for, round_to_precision, safe_div, truncate_to_precision};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Open or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HedgeDirection {
    Open,
    Close,
}

impl HedgeDirection {
    fn spot_side(self) -> OrderSide {
        match self {
            HedgeDirection::Open => OrderSide::Buy,
            HedgeDirection::Close => OrderSide::Sell,
        }
    }

    fn derivative_side(self) -> OrderSide {
        match self {
            HedgeDirection::Open => OrderSide::Sell,
            HedgeDirection::Close => OrderSide::Buy,
        }
    }
}

/// A completed two-leg execution.
#[derive(Debug, Clone, PartialEq)]
pub struct HedgeFill {
    pub symbol: String,
    pub direction: HedgeDirection,
    /// Coins traded on the local venue
    pub spot_quantity: Decimal,
    /// Contracts traded on the derivative venue
    pub contracts: Decimal,
    pub contract_size: Decimal,
    /// Logical USD value added or removed. An open carries the requested
    /// notional; a close carries the coins actually closed at `price`.
    pub notional_usd: Decimal,
    /// Derivative price used for sizing
    pub price: Decimal,
    pub spot_order_id: Option<String>,
    pub derivative_order_id: Option<String>,
}

impl HedgeFill {
    pub fn as_open(&self) -> OpenFill {
        OpenFill {
            value_usd: self.notional_usd,
            spot_quantity: self.spot_quantity,
            contracts: self.contracts,
            price: self.price,
        }
    }

    pub fn as_close(&self) -> CloseFill {
        CloseFill {
            value_usd: self.notional_usd,
            spot_quantity: self.spot_quantity,
            contracts: self.contracts,
        }
    }
}

#[derive(Debug, Clone)]
struct LegOrder {
    pair: String,
    side: OrderSide,
    amount: Decimal,
    options: OrderOptions,
}

/// Handles coordinated order execution across both venues.
pub struct OrderExecutor {
    local: Arc<dyn VenueAdapter>,
    derivative: Arc<dyn VenueAdapter>,
    pairs: MarketPairs,
    leg_timeout: Duration,
    spot_decimals: u32,
    local_min_order_usd: Decimal,
    derivative_min_order_usd: Decimal,
    /// Largest leg disagreement (% of the larger leg) accepted on an open
    fill_tolerance_pct: Decimal,
}

impl OrderExecutor {
    /// Create a new order executor.
    pub fn new(
        local: Arc<dyn VenueAdapter>,
        derivative: Arc<dyn VenueAdapter>,
        config: &ExecutionConfig,
        venues: &VenueConfig,
    ) -> Self {
        let local_min_order_usd = venues.min_order_for(local.name());
        let derivative_min_order_usd = venues.min_order_for(derivative.name());
        Self {
            local,
            derivative,
            pairs: MarketPairs::new(&venues.local_currency, &venues.stable_coin),
            leg_timeout: Duration::from_secs(config.leg_timeout_secs),
            spot_decimals: config.spot_decimals,
            local_min_order_usd,
            derivative_min_order_usd,
            fill_tolerance_pct: BalanceConfig::default().rebalance_gap_pct,
        }
    }

    /// Override the leg disagreement accepted before an open counts as a
    /// partial fill.
    pub fn with_fill_tolerance_pct(mut self, pct: Decimal) -> Self {
        self.fill_tolerance_pct = pct;
        self
    }

    /// Override the per-leg timeout.
    pub fn with_leg_timeout(mut self, timeout: Duration) -> Self {
        self.leg_timeout = timeout;
        self
    }

    pub fn pairs(&self) -> &MarketPairs {
        &self.pairs
    }

    /// Open `notional_usd` of hedge: spot buy plus derivative short.
    pub async fn open(&self, symbol: &str, notional_usd: Decimal) -> Result<HedgeFill, ExecutionError> {
        if notional_usd <= Decimal::ZERO {
            return Err(ExecutionError::InvalidRequest {
                symbol: symbol.to_string(),
                reason: format!("non-positive notional {notional_usd}"),
            });
        }

        let local_pair = self.pairs.local_pair(symbol);
        let stable_pair = self.pairs.stable_pair();
        let derivative_pair = self.pairs.derivative_pair(symbol);

        let (local_ticker, stable_ticker, derivative_ticker) = tokio::join!(
            self.local.get_ticker(&local_pair),
            self.local.get_ticker(&stable_pair),
            self.derivative.get_ticker(&derivative_pair),
        );
        let local_ask = local_ticker
            .and_then(|t| t.require_ask(&local_pair))
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;
        let stable_ask = stable_ticker
            .and_then(|t| t.require_ask(&stable_pair))
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;
        let derivative_bid = derivative_ticker
            .and_then(|t| t.require_bid(&derivative_pair))
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;
        let contract_size = contract_size(self.derivative.as_ref(), &derivative_pair)
            .await
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;

        let approx_quantity = notional_usd / derivative_bid;
        let contracts = contracts_for(approx_quantity, contract_size);
        let coin_quantity = contracts * contract_size;
        let spot_quantity = round_to_precision(coin_quantity, self.spot_decimals);

        let spot_cost_local = spot_quantity * local_ask;
        let spot_notional_usd = spot_cost_local / stable_ask;
        let derivative_notional_usd = coin_quantity * derivative_bid;

        self.check_minimum(self.local.name(), spot_notional_usd, self.local_min_order_usd)?;
        self.check_minimum(
            self.derivative.name(),
            derivative_notional_usd,
            self.derivative_min_order_usd,
        )?;
        self.check_balance(self.local.as_ref(), self.pairs.local_currency(), spot_cost_local)
            .await?;
        self.check_balance(
            self.derivative.as_ref(),
            self.pairs.stable_coin(),
            derivative_notional_usd,
        )
        .await?;

        info!(
            %symbol,
            %notional_usd,
            %contracts,
            %contract_size,
            %spot_quantity,
            %derivative_bid,
            "Opening hedge"
        );

        let spot = LegOrder {
            pair: local_pair,
            side: HedgeDirection::Open.spot_side(),
            amount: spot_quantity,
            options: OrderOptions::default(),
        };
        let derivative = LegOrder {
            pair: derivative_pair,
            side: HedgeDirection::Open.derivative_side(),
            amount: contracts,
            options: OrderOptions::default(),
        };

        self.execute(
            symbol,
            HedgeDirection::Open,
            Some(spot),
            Some(derivative),
            contract_size,
            notional_usd,
            derivative_bid,
        )
        .await
    }

    /// Close `percent` of a position currently worth `current_value_usd`:
    /// spot sell plus reduce-only derivative buy.
    ///
    /// Partial closes are sized at the derivative mid price and never exceed
    /// what is held. A 100% close uses the full held balances.
    pub async fn close(
        &self,
        symbol: &str,
        percent: Decimal,
        current_value_usd: Decimal,
    ) -> Result<HedgeFill, ExecutionError> {
        if percent <= Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
            return Err(ExecutionError::InvalidRequest {
                symbol: symbol.to_string(),
                reason: format!("close percentage {percent} outside (0, 100]"),
            });
        }

        let local_pair = self.pairs.local_pair(symbol);
        let derivative_pair = self.pairs.derivative_pair(symbol);

        let mid = self
            .derivative
            .get_ticker(&derivative_pair)
            .await
            .and_then(|t| t.require_mid(&derivative_pair))
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;
        let contract_size = contract_size(self.derivative.as_ref(), &derivative_pair)
            .await
            .map_err(|e| ExecutionError::unavailable(symbol, e))?;

        let (spot_balance, short) = tokio::join!(
            self.local.get_balance(symbol),
            short_position(self.derivative.as_ref(), &derivative_pair),
        );
        let held_spot = spot_balance
            .map_err(|e| ExecutionError::unavailable(symbol, e))?
            .free;
        let held_contracts = short
            .map_err(|e| ExecutionError::unavailable(symbol, e))?
            .map(|p| p.contracts)
            .unwrap_or(Decimal::ZERO);

        let full = percent == Decimal::ONE_HUNDRED;
        let (close_usd, spot_quantity, contracts) = if full {
            (
                current_value_usd,
                truncate_to_precision(held_spot, self.spot_decimals),
                held_contracts,
            )
        } else {
            let close_usd = current_value_usd * percent / Decimal::ONE_HUNDRED;
            let ideal_quantity = close_usd / mid;
            let contracts = contracts_for(ideal_quantity, contract_size).min(held_contracts);
            let spot_quantity =
                truncate_to_precision((contracts * contract_size).min(held_spot), self.spot_decimals);
            (close_usd, spot_quantity, contracts)
        };

        if spot_quantity.is_zero() && contracts.is_zero() {
            return Err(ExecutionError::InvalidRequest {
                symbol: symbol.to_string(),
                reason: "nothing held to close".into(),
            });
        }

        info!(
            %symbol,
            %percent,
            %close_usd,
            %spot_quantity,
            %contracts,
            %held_spot,
            %held_contracts,
            "Closing hedge"
        );

        let spot = (!spot_quantity.is_zero()).then(|| LegOrder {
            pair: local_pair,
            side: HedgeDirection::Close.spot_side(),
            amount: spot_quantity,
            options: OrderOptions::default(),
        });
        let derivative = (!contracts.is_zero()).then(|| LegOrder {
            pair: derivative_pair,
            side: HedgeDirection::Close.derivative_side(),
            amount: contracts,
            options: OrderOptions::reduce_only(),
        });

        self.execute(
            symbol,
            HedgeDirection::Close,
            spot,
            derivative,
            contract_size,
            close_usd,
            mid,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        symbol: &str,
        direction: HedgeDirection,
        spot: Option<LegOrder>,
        derivative: Option<LegOrder>,
        contract_size: Decimal,
        notional_usd: Decimal,
        price: Decimal,
    ) -> Result<HedgeFill, ExecutionError> {
        let (spot_outcome, derivative_outcome) = tokio::join!(
            self.run_leg(self.local.as_ref(), spot.as_ref()),
            self.run_leg(self.derivative.as_ref(), derivative.as_ref()),
        );

        match (&spot_outcome, &derivative_outcome) {
            (spot_ok, derivative_ok) if spot_ok.succeeded() && derivative_ok.succeeded() => {
                let spot_quantity = spot_outcome.filled_quantity();
                let contracts = derivative_outcome.filled_quantity();
                let derivative_quantity = contracts * contract_size;
                let mut fill = HedgeFill {
                    symbol: symbol.to_string(),
                    direction,
                    spot_quantity,
                    contracts,
                    contract_size,
                    notional_usd,
                    price,
                    spot_order_id: spot_outcome.order_id(),
                    derivative_order_id: derivative_outcome.order_id(),
                };

                match direction {
                    HedgeDirection::Open => {
                        let gap = (spot_quantity - derivative_quantity).abs();
                        let gap_pct =
                            safe_div(gap, spot_quantity.max(derivative_quantity)) * Decimal::ONE_HUNDRED;
                        if gap_pct > self.fill_tolerance_pct {
                            fill.notional_usd = spot_quantity.min(derivative_quantity) * price;
                            warn!(
                                %symbol,
                                %spot_quantity,
                                %derivative_quantity,
                                %gap_pct,
                                matched_usd = %fill.notional_usd,
                                "Legs filled unevenly"
                            );
                            return Err(ExecutionError::PartialFill {
                                symbol: symbol.to_string(),
                                fill: Box::new(fill),
                                gap_pct,
                            });
                        }
                    }
                    // The post-close correction trims the heavier leg to the
                    // lighter, so the larger closed quantity is what leaves
                    HedgeDirection::Close => {
                        fill.notional_usd = spot_quantity.max(derivative_quantity) * price;
                    }
                }

                info!(
                    %symbol,
                    ?direction,
                    %spot_quantity,
                    %contracts,
                    notional_usd = %fill.notional_usd,
                    "Both legs filled"
                );
                Ok(fill)
            }
            (LegOutcome::Filled { quantity, .. }, _) => {
                error!(%symbol, ?direction, derivative = %derivative_outcome, "Derivative leg failed, unwinding spot leg");
                let compensation = self
                    .compensate(
                        symbol,
                        self.local.as_ref(),
                        LegOrder {
                            pair: self.pairs.local_pair(symbol),
                            side: direction.spot_side().opposite(),
                            amount: *quantity,
                            options: OrderOptions::default(),
                        },
                    )
                    .await;
                Err(ExecutionError::LegFailure {
                    symbol: symbol.to_string(),
                    spot: spot_outcome,
                    derivative: derivative_outcome,
                    compensation,
                })
            }
            (_, LegOutcome::Filled { quantity, .. }) => {
                error!(%symbol, ?direction, spot = %spot_outcome, "Spot leg failed, unwinding derivative leg");
                let options = match direction {
                    HedgeDirection::Open => OrderOptions::reduce_only(),
                    HedgeDirection::Close => OrderOptions::default(),
                };
                let compensation = self
                    .compensate(
                        symbol,
                        self.derivative.as_ref(),
                        LegOrder {
                            pair: self.pairs.derivative_pair(symbol),
                            side: direction.derivative_side().opposite(),
                            amount: *quantity,
                            options,
                        },
                    )
                    .await;
                Err(ExecutionError::LegFailure {
                    symbol: symbol.to_string(),
                    spot: spot_outcome,
                    derivative: derivative_outcome,
                    compensation,
                })
            }
            _ => {
                error!(%symbol, ?direction, spot = %spot_outcome, derivative = %derivative_outcome, "Both legs failed");
                Err(ExecutionError::LegFailure {
                    symbol: symbol.to_string(),
                    spot: spot_outcome,
                    derivative: derivative_outcome,
                    compensation: Compensation::NotNeeded,
                })
            }
        }
    }

    async fn run_leg(&self, venue: &dyn VenueAdapter, order: Option<&LegOrder>) -> LegOutcome {
        let Some(order) = order else {
            return LegOutcome::Skipped;
        };

        let placed = tokio::time::timeout(
            self.leg_timeout,
            venue.create_market_order(&order.pair, order.side, order.amount, order.options),
        )
        .await;

        match placed {
            Ok(Ok(ack)) if ack.is_accepted() => LegOutcome::Filled {
                quantity: ack.filled_or(order.amount),
                order_id: ack.id,
            },
            Ok(Ok(ack)) => LegOutcome::Failed(format!("order {} status {:?}", ack.id, ack.status)),
            Ok(Err(e)) => LegOutcome::Failed(e.to_string()),
            Err(_) => {
                warn!(
                    venue = venue.name(),
                    pair = %order.pair,
                    timeout_ms = self.leg_timeout.as_millis() as u64,
                    "Order leg timed out"
                );
                LegOutcome::TimedOut
            }
        }
    }

    /// Unwind a filled leg. Never retried; a failure raises a critical alert.
    async fn compensate(&self, symbol: &str, venue: &dyn VenueAdapter, order: LegOrder) -> Compensation {
        let placed = tokio::time::timeout(
            self.leg_timeout,
            venue.create_market_order(&order.pair, order.side, order.amount, order.options),
        )
        .await;

        let reason = match placed {
            Ok(Ok(ack)) if ack.is_accepted() => {
                warn!(
                    %symbol,
                    venue = venue.name(),
                    pair = %order.pair,
                    side = %order.side,
                    amount = %order.amount,
                    order_id = %ack.id,
                    "Compensating order filled"
                );
                return Compensation::Completed { order_id: ack.id };
            }
            Ok(Ok(ack)) => format!("order {} status {:?}", ack.id, ack.status),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out".to_string(),
        };

        HedgeAlert::new(
            AlertKind::CompensationFailed {
                symbol: symbol.to_string(),
                venue: venue.name().to_string(),
                pair: order.pair.clone(),
                side: order.side.to_string(),
                quantity: order.amount,
                reason: reason.clone(),
            },
            AlertSeverity::Critical,
            format!(
                "Compensating {} of {} {} on {} failed: {}",
                order.side,
                order.amount,
                order.pair,
                venue.name(),
                reason
            ),
            format!("Manually {} {} {} on {}", order.side, order.amount, order.pair, venue.name()),
        )
        .emit();

        Compensation::Failed(reason)
    }

    fn check_minimum(&self, venue: &str, notional_usd: Decimal, minimum_usd: Decimal) -> Result<(), ExecutionError> {
        if notional_usd < minimum_usd {
            warn!(%venue, %notional_usd, %minimum_usd, "Order below venue minimum");
            return Err(ExecutionError::BelowMinimum {
                venue: venue.to_string(),
                notional_usd,
                minimum_usd,
            });
        }
        Ok(())
    }

    /// Fails only on a confirmed shortfall; an unavailable balance proceeds.
    async fn check_balance(
        &self,
        venue: &dyn VenueAdapter,
        asset: &str,
        required: Decimal,
    ) -> Result<(), ExecutionError> {
        match venue.get_balance(asset).await {
            Ok(balance) if balance.free >= required => Ok(()),
            Ok(balance) => Err(ExecutionError::InsufficientBalance {
                venue: venue.name().to_string(),
                asset: asset.to_string(),
                required,
                available: balance.free,
            }),
            Err(e) => {
                warn!(venue = venue.name(), %asset, error = %e, "Balance check unavailable, proceeding");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{
        Balance, MockVenue, MockVenueAdapter, OrderAck, OrderStatus, Ticker, VenueError,
    };
    use mockall::predicate::eq;
    use rust_decimal_macros::dec;

    const SPOT: &str = "XRP/KRW";
    const PERP: &str = "XRP/USDT:USDT";

    async fn venues() -> (Arc<MockVenue>, Arc<MockVenue>) {
        let local = MockVenue::new("paper").with_fee_rate(Decimal::ZERO);
        local.set_quote(SPOT, dec!(999), dec!(1000)).await;
        local.set_quote("USDT/KRW", dec!(1299), dec!(1300)).await;
        local.set_balance("KRW", dec!(10000000)).await;

        let derivative = MockVenue::new("paper").with_fee_rate(Decimal::ZERO);
        derivative.set_quote(PERP, dec!(0.70), dec!(0.72)).await;
        derivative.set_market(PERP, dec!(10)).await;
        derivative.set_balance("USDT", dec!(10000)).await;

        (Arc::new(local), Arc::new(derivative))
    }

    fn executor(local: Arc<MockVenue>, derivative: Arc<MockVenue>) -> OrderExecutor {
        OrderExecutor::new(local, derivative, &ExecutionConfig::default(), &VenueConfig::default())
            .with_leg_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_open_drives_both_legs_from_contract_count() {
        let (local, derivative) = venues().await;
        let exec = executor(local.clone(), derivative.clone());

        // 100 / 0.70 = 142.857 coins = 14.29 contracts -> 14 -> 140 coins
        let fill = exec.open("XRP", dec!(100)).await.unwrap();
        assert_eq!(fill.contracts, dec!(14));
        assert_eq!(fill.spot_quantity, dec!(140));
        assert_eq!(fill.notional_usd, dec!(100));

        assert_eq!(local.balance_of("XRP").await, dec!(140));
        assert_eq!(derivative.short_contracts(PERP).await, dec!(14));
    }

    #[tokio::test]
    async fn test_derivative_timeout_compensates_spot_once() {
        let (local, derivative) = venues().await;
        derivative.delay_orders(PERP, Duration::from_millis(500)).await;
        let exec = executor(local.clone(), derivative.clone());

        let err = exec.open("XRP", dec!(100)).await.unwrap_err();
        match &err {
            ExecutionError::LegFailure {
                spot,
                derivative,
                compensation,
                ..
            } => {
                assert!(spot.is_filled());
                assert_eq!(*derivative, LegOutcome::TimedOut);
                assert!(matches!(compensation, Compensation::Completed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.needs_manual_action());

        let fills = local.fills().await;
        let sells: Vec<_> = fills.iter().filter(|f| f.side == OrderSide::Sell).collect();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].amount, dec!(140));
        assert_eq!(local.balance_of("XRP").await, Decimal::ZERO);
        assert!(derivative.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_spot_rejection_covers_short() {
        let (local, derivative) = venues().await;
        local.reject_next_orders(SPOT, 1).await;
        let exec = executor(local.clone(), derivative.clone());

        let err = exec.open("XRP", dec!(100)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::LegFailure {
                compensation: Compensation::Completed { .. },
                ..
            }
        ));

        let fills = derivative.fills().await;
        assert_eq!(fills.len(), 2);
        assert_eq!(fills[1].side, OrderSide::Buy);
        assert!(fills[1].reduce_only);
        assert_eq!(derivative.short_contracts(PERP).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_both_legs_failing_needs_no_compensation() {
        let (local, derivative) = venues().await;
        local.reject_next_orders(SPOT, 1).await;
        derivative.reject_next_orders(PERP, 1).await;
        let exec = executor(local.clone(), derivative.clone());

        let err = exec.open("XRP", dec!(100)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::LegFailure {
                compensation: Compensation::NotNeeded,
                ..
            }
        ));
        assert!(local.fills().await.is_empty());
        assert!(derivative.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_below_minimum_and_insufficient_balance() {
        let (local, derivative) = venues().await;
        let mut venue_config = VenueConfig::default();
        venue_config.min_order_usd.insert("paper".into(), dec!(50));
        let exec = OrderExecutor::new(
            local.clone(),
            derivative.clone(),
            &ExecutionConfig::default(),
            &venue_config,
        );
        // 1 contract = 10 coins = 7 USD
        assert!(matches!(
            exec.open("XRP", dec!(5)).await,
            Err(ExecutionError::BelowMinimum { .. })
        ));

        local.set_balance("KRW", dec!(1000)).await;
        let exec = executor(local.clone(), derivative.clone());
        assert!(matches!(
            exec.open("XRP", dec!(100)).await,
            Err(ExecutionError::InsufficientBalance { .. })
        ));
        assert!(local.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_balance_query_failure_proceeds() {
        let (local, derivative) = venues().await;
        local.set_balance_unavailable(true).await;
        let exec = executor(local.clone(), derivative.clone());
        assert!(exec.open("XRP", dec!(100)).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_price_is_data_unavailable() {
        let (local, derivative) = venues().await;
        derivative
            .set_ticker(
                PERP,
                Ticker {
                    ask: Some(dec!(0.72)),
                    ..Default::default()
                },
            )
            .await;
        let exec = executor(local.clone(), derivative.clone());
        assert!(matches!(
            exec.open("XRP", dec!(100)).await,
            Err(ExecutionError::DataUnavailable { .. })
        ));
        assert!(local.fills().await.is_empty());
    }

    #[tokio::test]
    async fn test_partial_close_sized_at_mid() {
        let (local, derivative) = venues().await;
        let exec = executor(local.clone(), derivative.clone());
        exec.open("XRP", dec!(100)).await.unwrap();
        exec.open("XRP", dec!(100)).await.unwrap();

        // 10% of 200 USD = 20 USD at mid 0.71 = 28.17 coins -> 3 contracts
        let fill = exec.close("XRP", dec!(10), dec!(200)).await.unwrap();
        assert_eq!(fill.contracts, dec!(3));
        assert_eq!(fill.spot_quantity, dec!(30));
        // Valued at what closed: 30 coins at mid
        assert_eq!(fill.notional_usd, dec!(21.3));
        assert_eq!(local.balance_of("XRP").await, dec!(250));
        assert_eq!(derivative.short_contracts(PERP).await, dec!(25));
    }

    #[tokio::test]
    async fn test_full_close_uses_actual_balances() {
        let (local, derivative) = venues().await;
        let exec = executor(local.clone(), derivative.clone());
        exec.open("XRP", dec!(100)).await.unwrap();
        // Drift the spot balance away from the ledger
        local.set_balance("XRP", dec!(140.37)).await;

        let fill = exec.close("XRP", dec!(100), dec!(100)).await.unwrap();
        assert_eq!(fill.spot_quantity, dec!(140.37));
        assert_eq!(fill.contracts, dec!(14));
        assert_eq!(local.balance_of("XRP").await, Decimal::ZERO);
        assert_eq!(derivative.short_contracts(PERP).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_close_rejects_bad_percentage() {
        let (local, derivative) = venues().await;
        let exec = executor(local, derivative);
        for pct in [dec!(0), dec!(-5), dec!(100.01)] {
            assert!(matches!(
                exec.close("XRP", pct, dec!(100)).await,
                Err(ExecutionError::InvalidRequest { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_close_compensation_reshorts() {
        let (local, derivative) = venues().await;
        let exec = executor(local.clone(), derivative.clone());
        exec.open("XRP", dec!(100)).await.unwrap();
        local.reject_next_orders(SPOT, 1).await;

        let err = exec.close("XRP", dec!(100), dec!(100)).await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::LegFailure {
                compensation: Compensation::Completed { .. },
                ..
            }
        ));
        assert_eq!(derivative.short_contracts(PERP).await, dec!(14));
        assert_eq!(local.balance_of("XRP").await, dec!(140));
    }

    #[tokio::test]
    async fn test_failed_compensation_needs_manual_action() {
        let mut local = MockVenueAdapter::new();
        local.expect_name().return_const("paper".to_string());
        local
            .expect_get_ticker()
            .with(eq(SPOT))
            .returning(|_| Ok(Ticker::from_quote(dec!(999), dec!(1000))));
        local
            .expect_get_ticker()
            .with(eq("USDT/KRW"))
            .returning(|_| Ok(Ticker::from_quote(dec!(1299), dec!(1300))));
        local
            .expect_get_balance()
            .returning(|_| Ok(Balance::free_only(dec!(10000000))));
        local
            .expect_create_market_order()
            .withf(|_, side, _, _| *side == OrderSide::Buy)
            .times(1)
            .returning(|_, _, amount, _| {
                Ok(OrderAck {
                    id: "spot-1".into(),
                    filled: amount,
                    status: OrderStatus::Filled,
                })
            });
        local
            .expect_create_market_order()
            .withf(|_, side, _, _| *side == OrderSide::Sell)
            .times(1)
            .returning(|_, _, _, _| Err(VenueError::Transport("connection reset".into())));

        let (_, derivative) = venues().await;
        derivative.reject_next_orders(PERP, 1).await;

        let exec = OrderExecutor::new(
            Arc::new(local),
            derivative,
            &ExecutionConfig::default(),
            &VenueConfig::default(),
        )
        .with_leg_timeout(Duration::from_millis(50));

        let err = exec.open("XRP", dec!(100)).await.unwrap_err();
        assert!(err.needs_manual_action());
    }

    /// Local venue that acknowledges spot buys with `filled` coins.
    fn short_filling_local(filled: Decimal) -> MockVenueAdapter {
        let mut local = MockVenueAdapter::new();
        local.expect_name().return_const("paper".to_string());
        local
            .expect_get_ticker()
            .with(eq(SPOT))
            .returning(|_| Ok(Ticker::from_quote(dec!(999), dec!(1000))));
        local
            .expect_get_ticker()
            .with(eq("USDT/KRW"))
            .returning(|_| Ok(Ticker::from_quote(dec!(1299), dec!(1300))));
        local
            .expect_get_balance()
            .returning(|_| Ok(Balance::free_only(dec!(10000000))));
        local
            .expect_create_market_order()
            .times(1)
            .returning(move |_, _, _, _| {
                Ok(OrderAck {
                    id: "spot-1".into(),
                    filled,
                    status: OrderStatus::PartiallyFilled,
                })
            });
        local
    }

    #[tokio::test]
    async fn test_uneven_open_reports_what_filled() {
        let (_, derivative) = venues().await;
        let exec = OrderExecutor::new(
            Arc::new(short_filling_local(dec!(40))),
            derivative.clone(),
            &ExecutionConfig::default(),
            &VenueConfig::default(),
        )
        .with_leg_timeout(Duration::from_millis(50));

        let err = exec.open("XRP", dec!(100)).await.unwrap_err();
        match &err {
            ExecutionError::PartialFill { fill, gap_pct, .. } => {
                assert_eq!(fill.spot_quantity, dec!(40));
                assert_eq!(fill.contracts, dec!(14));
                // 40 matched coins at the 0.70 derivative bid
                assert_eq!(fill.notional_usd, dec!(28));
                assert!(*gap_pct > dec!(70));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.needs_manual_action());
        // No compensation: both legs stay for the balancer to even out
        assert_eq!(derivative.short_contracts(PERP).await, dec!(14));
        assert_eq!(derivative.fills().await.len(), 1);
    }

    #[tokio::test]
    async fn test_open_within_fill_tolerance_succeeds() {
        let (_, derivative) = venues().await;
        let exec = OrderExecutor::new(
            Arc::new(short_filling_local(dec!(138))),
            derivative,
            &ExecutionConfig::default(),
            &VenueConfig::default(),
        );

        // 138 of 140 coins: 1.4% apart
        let fill = exec.open("XRP", dec!(100)).await.unwrap();
        assert_eq!(fill.spot_quantity, dec!(138));
        assert_eq!(fill.notional_usd, dec!(100));
    }
}
