//! Periodic hedge cycle.
//!
//! For every active symbol: compute the premium, then either grow the hedge
//! (premium at or below the build threshold and room under the maximum) or
//! evaluate staged profit-taking on the held position. Failed executions
//! count towards quarantine; a fully closed symbol leaves the active set.
//! An open whose legs fill unevenly is evened out by the balancer at once.
//! State is journaled after every executed operation.

use super::balancer::{PositionBalancer, RebalanceResult};
use super::error::{ExecutionError, OrchestratorError};
use super::executor::{HedgeFill, OrderExecutor};
use super::premium::PremiumCalculator;
use crate::config::{Config, HedgeConfig, ProfitStage};
use crate::exchange::{MarketPairs, VenueAdapter};
use crate::persistence::{ExecutionRecord, StateStore};
use crate::risk::{
    AlertKind, AlertSeverity, FailureTracker, HedgeAlert, InProgressSet, OpenFill, OperationKind,
    Position, PositionManager, StageTrigger, TimerManager,
};
use crate::utils::safe_div;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Why a symbol was not acted on this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    InProgress,
    Quarantined,
    PremiumUnavailable,
    BelowMinimumTrade,
}

/// What one `process_symbol` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolOutcome {
    Skipped(SkipReason),
    /// Premium read, nothing to do
    Held { premium: Decimal },
    Built { premium: Decimal, notional_usd: Decimal },
    ProfitTaken {
        premium: Decimal,
        stage: ProfitStage,
        closed_usd: Decimal,
    },
    /// Position fully closed and symbol removed
    Closed { premium: Decimal },
    Failed { premium: Decimal, error: ExecutionError },
}

pub struct HedgeOrchestrator {
    hedge: HedgeConfig,
    seed_tolerance_pct: Decimal,
    premium: PremiumCalculator,
    executor: OrderExecutor,
    balancer: PositionBalancer,
    positions: PositionManager,
    timers: TimerManager,
    failures: FailureTracker,
    in_progress: InProgressSet,
    active: Vec<String>,
    store: Option<StateStore>,
}

impl HedgeOrchestrator {
    pub fn new(config: &Config, local: Arc<dyn VenueAdapter>, derivative: Arc<dyn VenueAdapter>) -> Self {
        let pairs = MarketPairs::new(&config.venues.local_currency, &config.venues.stable_coin);
        Self {
            hedge: config.hedge.clone(),
            seed_tolerance_pct: config.balance.seed_tolerance_pct,
            premium: PremiumCalculator::new(Arc::clone(&local), Arc::clone(&derivative), pairs),
            executor: OrderExecutor::new(
                Arc::clone(&local),
                Arc::clone(&derivative),
                &config.execution,
                &config.venues,
            )
            .with_fill_tolerance_pct(config.balance.rebalance_gap_pct),
            balancer: PositionBalancer::new(
                local,
                derivative,
                config.balance.clone(),
                &config.execution,
                &config.venues,
            ),
            positions: PositionManager::new(),
            timers: TimerManager::new(&config.profit),
            failures: FailureTracker::new(config.execution.max_failed_attempts),
            in_progress: InProgressSet::new(),
            active: Vec::new(),
            store: None,
        }
    }

    /// Attach a journal and restore timers and failure counters from it.
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        match store.load_timers() {
            Ok(timers) => {
                for (symbol, threshold, armed_at) in timers {
                    self.timers.set_timer(&symbol, threshold, Some(armed_at));
                }
            }
            Err(e) => warn!(error = %e, "Could not restore stage timers"),
        }
        match store.load_failures() {
            Ok(counts) => self.failures.restore(counts),
            Err(e) => warn!(error = %e, "Could not restore failure counters"),
        }
        self.store = Some(store);
        self
    }

    /// Override the per-leg order timeout.
    pub fn with_leg_timeout(mut self, timeout: Duration) -> Self {
        self.executor = self.executor.with_leg_timeout(timeout);
        self
    }

    pub fn active_symbols(&self) -> &[String] {
        &self.active
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn in_progress(&self) -> &InProgressSet {
        &self.in_progress
    }

    pub fn balancer(&self) -> &PositionBalancer {
        &self.balancer
    }

    /// Validate a symbol on both venues, seed its position from what the
    /// venues already hold and start tracking it.
    pub async fn add_symbol(&mut self, symbol: &str) -> Result<(), OrchestratorError> {
        let symbol = symbol.trim().to_uppercase();
        if self.active.contains(&symbol) {
            return Err(OrchestratorError::AlreadyActive(symbol));
        }

        let quote = self
            .premium
            .quote(&symbol)
            .await
            .map_err(|e| OrchestratorError::UnknownSymbol {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })?;
        let balance = self.balancer.check(&symbol).await?;
        info!(%symbol, premium = %quote.premium_pct, "Pairs verified on both venues");

        self.positions.add_symbol(&symbol);
        if !balance.is_flat() {
            let spot_value = balance.spot_value_usd;
            let derivative_value = balance.derivative_value_usd;
            let larger = spot_value.max(derivative_value);
            let disagreement_pct = if larger.is_zero() {
                Decimal::ZERO
            } else {
                (spot_value - derivative_value).abs() / larger * Decimal::ONE_HUNDRED
            };

            let value_usd = if disagreement_pct > self.seed_tolerance_pct {
                HedgeAlert::new(
                    AlertKind::SeedDiscrepancy {
                        symbol: symbol.clone(),
                        spot_value_usd: spot_value,
                        derivative_value_usd: derivative_value,
                    },
                    AlertSeverity::Warning,
                    format!(
                        "{} legs disagree by {}% (spot {} USD, derivative {} USD); seeding the smaller",
                        symbol,
                        disagreement_pct.round_dp(2),
                        spot_value.round_dp(2),
                        derivative_value.round_dp(2)
                    ),
                    "Rebalance or close the unmatched leg",
                )
                .emit();
                spot_value.min(derivative_value)
            } else {
                spot_value
            };

            let mut position = Position::empty(&symbol);
            position.value_usd = value_usd;
            position.spot_quantity = balance.spot_quantity;
            position.derivative_contracts = if balance.contract_size.is_zero() {
                Decimal::ZERO
            } else {
                balance.derivative_quantity / balance.contract_size
            };
            position.long_value_usd = spot_value;
            position.short_value_usd = derivative_value;
            self.positions.seed(position);
        }

        self.timers.initialize_symbol(&symbol);
        self.failures.register(&symbol);
        self.active.push(symbol.clone());
        info!(%symbol, value_usd = %self.positions.value_of(&symbol), "Symbol added");
        Ok(())
    }

    pub async fn process_symbol(&mut self, symbol: &str) -> SymbolOutcome {
        self.process_symbol_at(symbol, Utc::now()).await
    }

    /// One decision for `symbol`, with profit-taking timers evaluated at `now`.
    pub async fn process_symbol_at(&mut self, symbol: &str, now: DateTime<Utc>) -> SymbolOutcome {
        if self.in_progress.is_busy(symbol) {
            warn!(%symbol, "Operation already in progress");
            return SymbolOutcome::Skipped(SkipReason::InProgress);
        }
        if self.failures.is_quarantined(symbol) {
            warn!(
                %symbol,
                failures = self.failures.count(symbol),
                "Skipped after repeated failures; manual reset required"
            );
            return SymbolOutcome::Skipped(SkipReason::Quarantined);
        }

        let premium = match self.premium.calculate(symbol).await {
            Ok(premium) => premium,
            Err(e) => {
                warn!(%symbol, error = %e, "Premium unavailable, skipping this cycle");
                return SymbolOutcome::Skipped(SkipReason::PremiumUnavailable);
            }
        };

        info!("{}", self.status_line(symbol, premium));
        let value = self.positions.value_of(symbol);

        if premium <= self.hedge.build_premium_pct && value < self.hedge.max_position_usd {
            return self.build(symbol, premium).await;
        }

        if value > Decimal::ZERO {
            if let Some(trigger) = self.timers.check_profit_taking_at(symbol, premium, now) {
                return self.take_profit(symbol, premium, value, trigger).await;
            }
        }
        SymbolOutcome::Held { premium }
    }

    /// Process a snapshot of the active symbols in turn. Returns false once
    /// no symbols remain.
    pub async fn run_cycle(&mut self) -> bool {
        let symbols = self.active.clone();
        for symbol in &symbols {
            let outcome = self.process_symbol(symbol).await;
            debug!(%symbol, ?outcome, "Symbol processed");
        }
        self.persist();
        !self.active.is_empty()
    }

    /// One-line summary of premium and position.
    pub fn status_line(&self, symbol: &str, premium: Decimal) -> String {
        format!(
            "{} premium {}% | position {} / {} USD | failures {}/{}",
            symbol,
            premium.round_dp(2),
            self.positions.value_of(symbol).round_dp(2),
            self.hedge.max_position_usd,
            self.failures.count(symbol),
            self.failures.max_failures()
        )
    }

    /// Clear a quarantine (manual operator action).
    pub fn reset_failures(&mut self, symbol: &str) -> u32 {
        let previous = self.failures.reset(symbol);
        self.persist();
        previous
    }

    async fn build(&mut self, symbol: &str, premium: Decimal) -> SymbolOutcome {
        let increment = self.positions.increment_for(
            symbol,
            self.hedge.max_position_usd,
            self.hedge.position_increment_usd,
        );
        if increment < self.hedge.min_trade_usd {
            info!(%symbol, %increment, minimum = %self.hedge.min_trade_usd, "Increment too small, skipping build");
            return SymbolOutcome::Skipped(SkipReason::BelowMinimumTrade);
        }

        let Some(_guard) = self.in_progress.try_acquire(symbol, OperationKind::Open) else {
            return SymbolOutcome::Skipped(SkipReason::InProgress);
        };

        match self.executor.open(symbol, increment).await {
            Ok(fill) => {
                self.positions.record_open(symbol, fill.as_open());
                self.failures.record_success(symbol);
                self.journal(symbol, "open", Some(&fill), increment, None);
                self.persist();
                info!(
                    %symbol,
                    %premium,
                    added_usd = %increment,
                    value_usd = %self.positions.value_of(symbol),
                    "Position built"
                );
                SymbolOutcome::Built {
                    premium,
                    notional_usd: increment,
                }
            }
            Err(e) => {
                self.journal(symbol, "open", None, increment, Some(e.to_string()));
                if let ExecutionError::PartialFill { fill, .. } = &e {
                    self.positions.record_open(symbol, fill.as_open());
                    self.even_out(symbol, fill).await;
                }
                self.record_failure(symbol, &e);
                self.persist();
                SymbolOutcome::Failed { premium, error: e }
            }
        }
    }

    /// Rebalance after an uneven open and book whatever the correction
    /// matched.
    async fn even_out(&mut self, symbol: &str, fill: &HedgeFill) {
        let Some(guard) = self.in_progress.try_acquire(symbol, OperationKind::Rebalance) else {
            return;
        };
        info!(%symbol, operation = %guard.kind(), spot = %fill.spot_quantity, contracts = %fill.contracts, "Evening out uneven fill");

        match self.balancer.rebalance(symbol).await {
            Ok(result) => {
                if let Some(added) = matched_open(&result, fill.price) {
                    self.positions.record_open(symbol, added);
                }
                info!(
                    %symbol,
                    action = ?result.action,
                    gap_pct = %result.current().gap_pct,
                    value_usd = %self.positions.value_of(symbol),
                    "Uneven fill corrected"
                );
            }
            Err(e) => {
                error!(%symbol, error = %e, "Could not even out uneven fill");
            }
        }
    }

    async fn take_profit(
        &mut self,
        symbol: &str,
        premium: Decimal,
        value: Decimal,
        trigger: StageTrigger,
    ) -> SymbolOutcome {
        let Some(_guard) = self.in_progress.try_acquire(symbol, OperationKind::Close) else {
            self.timers.rollback(symbol, &trigger);
            self.persist();
            return SymbolOutcome::Skipped(SkipReason::InProgress);
        };

        let percent = if trigger.closes_fully() {
            Decimal::ONE_HUNDRED
        } else {
            trigger.stage.close_pct
        };

        let fill = match self.executor.close(symbol, percent, value).await {
            Ok(fill) => fill,
            Err(e) => {
                self.timers.rollback(symbol, &trigger);
                self.journal(symbol, "close", None, value * percent / Decimal::ONE_HUNDRED, Some(e.to_string()));
                error!(%symbol, threshold = %trigger.stage.threshold_pct, %percent, error = %e, "Profit-taking close failed, will retry");
                self.record_failure(symbol, &e);
                self.persist();
                return SymbolOutcome::Failed { premium, error: e };
            }
        };

        self.failures.record_success(symbol);
        self.journal(symbol, "close", Some(&fill), fill.notional_usd, None);

        if let Err(e) = self.balancer.after_close(symbol).await {
            warn!(%symbol, error = %e, "Post-close balance check failed");
        }

        if percent == Decimal::ONE_HUNDRED {
            info!(%symbol, %premium, "Position fully closed");
            self.cleanup_symbol(symbol);
            self.persist();
            return SymbolOutcome::Closed { premium };
        }

        self.positions.record_close(symbol, fill.as_close());
        self.persist();
        info!(
            %symbol,
            %premium,
            threshold = %trigger.stage.threshold_pct,
            close_pct = %percent,
            closed_usd = %fill.notional_usd,
            value_usd = %self.positions.value_of(symbol),
            "Profit taken"
        );
        SymbolOutcome::ProfitTaken {
            premium,
            stage: trigger.stage,
            closed_usd: fill.notional_usd,
        }
    }

    fn record_failure(&mut self, symbol: &str, error: &ExecutionError) {
        if matches!(error, ExecutionError::DataUnavailable { .. }) {
            warn!(%symbol, %error, "Market data unavailable, not counted as failure");
            return;
        }
        if let Some(alert) = self.failures.record_failure(symbol) {
            alert.emit();
        }
    }

    fn cleanup_symbol(&mut self, symbol: &str) {
        self.active.retain(|s| s != symbol);
        self.positions.remove(symbol);
        self.timers.remove_symbol(symbol);
        self.failures.remove(symbol);
        if let Some(store) = &self.store {
            if let Err(e) = store.forget_symbol(symbol) {
                warn!(%symbol, error = %e, "Could not remove symbol from journal");
            }
        }
        info!(%symbol, remaining = self.active.len(), "Symbol removed");
    }

    fn journal(
        &self,
        symbol: &str,
        action: &str,
        fill: Option<&HedgeFill>,
        notional_usd: Decimal,
        detail: Option<String>,
    ) {
        let Some(store) = &self.store else {
            return;
        };
        let record = ExecutionRecord {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            action: action.to_string(),
            notional_usd,
            spot_quantity: fill.map(|f| f.spot_quantity).unwrap_or(Decimal::ZERO),
            contracts: fill.map(|f| f.contracts).unwrap_or(Decimal::ZERO),
            success: fill.is_some(),
            detail,
        };
        if let Err(e) = store.record_execution(&record) {
            warn!(%symbol, error = %e, "Could not journal execution");
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let positions: Vec<Position> = self.positions.positions().cloned().collect();
        let saved = store
            .save_timers(&self.timers.armed_timers())
            .and_then(|_| store.save_failures(&self.failures.snapshot()))
            .and_then(|_| store.save_positions(&positions));
        if let Err(e) = saved {
            error!(error = %e, "Failed to persist hedge state");
        }
    }
}

/// Ledger entry for the coins a correction newly matched on both legs.
fn matched_open(result: &RebalanceResult, price: Decimal) -> Option<OpenFill> {
    let matched = result.hedged_change();
    if matched <= Decimal::ZERO {
        return None;
    }
    let after = result.current();
    Some(OpenFill {
        value_usd: matched * price,
        spot_quantity: after.spot_quantity - result.before.spot_quantity,
        contracts: safe_div(
            after.derivative_quantity - result.before.derivative_quantity,
            after.contract_size,
        ),
        price,
    })
}
