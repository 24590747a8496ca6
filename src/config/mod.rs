//! Configuration management for the premium hedge bot.
//!
//! Loads settings from environment variables and config files. Each
//! component receives its own section by value; there is no global settings
//! object.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Position sizing and build trigger
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Staged profit-taking
    #[serde(default)]
    pub profit: ProfitConfig,
    /// Two-leg execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Cross-venue balance thresholds
    #[serde(default)]
    pub balance: BalanceConfig,
    /// Venue naming and minimum order sizes
    #[serde(default)]
    pub venues: VenueConfig,
    /// Main loop, logging and state journal
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Maximum logical position per symbol in USD
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: Decimal,
    /// Position growth step in USD
    #[serde(default = "default_position_increment_usd")]
    pub position_increment_usd: Decimal,
    /// Build while premium is at or below this percentage
    #[serde(default = "default_build_premium_pct")]
    pub build_premium_pct: Decimal,
    /// Increments below this notional are skipped
    #[serde(default = "default_min_trade_usd")]
    pub min_trade_usd: Decimal,
}

/// A (premium threshold, close percentage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfitStage {
    /// Premium percentage at which the stage qualifies
    pub threshold_pct: Decimal,
    /// Percentage of the current position to close
    pub close_pct: Decimal,
}

impl ProfitStage {
    pub fn new(threshold_pct: Decimal, close_pct: Decimal) -> Self {
        Self {
            threshold_pct,
            close_pct,
        }
    }

    /// Stages at or above 100% premium bypass the cooldown.
    pub fn is_emergency(&self) -> bool {
        self.threshold_pct >= Decimal::ONE_HUNDRED
    }

    pub fn closes_fully(&self) -> bool {
        self.close_pct >= Decimal::ONE_HUNDRED || self.is_emergency()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitConfig {
    /// Profit-taking stages, ascending by threshold
    #[serde(default = "default_profit_stages")]
    pub stages: Vec<ProfitStage>,
    /// Minimum minutes between two firings of the same stage
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-leg timeout in seconds
    #[serde(default = "default_leg_timeout_secs")]
    pub leg_timeout_secs: u64,
    /// Decimal places accepted by the local venue for coin quantities
    #[serde(default = "default_spot_decimals")]
    pub spot_decimals: u32,
    /// Wait before re-reading balances after a close
    #[serde(default = "default_settlement_wait_ms")]
    pub settlement_wait_ms: u64,
    /// Consecutive failures before a symbol is quarantined
    #[serde(default = "default_max_failed_attempts")]
    pub max_failed_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Gap percentage at or below which the legs count as balanced
    #[serde(default = "default_balanced_gap_pct")]
    pub balanced_gap_pct: Decimal,
    /// Gap percentage at or above which a correction is issued
    #[serde(default = "default_rebalance_gap_pct")]
    pub rebalance_gap_pct: Decimal,
    /// Coin quantity below which corrections are skipped
    #[serde(default = "default_dust_quantity")]
    pub dust_quantity: Decimal,
    /// Allowed disagreement between leg valuations when seeding, in percent
    #[serde(default = "default_seed_tolerance_pct")]
    pub seed_tolerance_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Quote currency of the local spot venue
    #[serde(default = "default_local_currency")]
    pub local_currency: String,
    /// Stable coin quoting the derivative venue
    #[serde(default = "default_stable_coin")]
    pub stable_coin: String,
    /// Local spot venue name
    #[serde(default = "default_local_venue")]
    pub local_venue: String,
    /// Derivative venue name
    #[serde(default = "default_derivative_venue")]
    pub derivative_venue: String,
    /// Minimum order notional in USD, keyed by lowercase venue name
    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Seconds between cycles
    #[serde(default = "default_loop_interval_secs")]
    pub loop_interval_secs: u64,
    /// Directory for rolling log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// SQLite journal for timers and failure counters (disabled when unset)
    #[serde(default)]
    pub state_db: Option<String>,
}

// Default value functions
fn default_max_position_usd() -> Decimal {
    Decimal::new(1500, 0)
}

fn default_position_increment_usd() -> Decimal {
    Decimal::new(100, 0)
}

fn default_build_premium_pct() -> Decimal {
    Decimal::ZERO
}

fn default_min_trade_usd() -> Decimal {
    Decimal::new(10, 0)
}

fn default_profit_stages() -> Vec<ProfitStage> {
    [(3, 1), (10, 10), (30, 30), (50, 50), (100, 100)]
        .into_iter()
        .map(|(t, c)| ProfitStage::new(Decimal::from(t), Decimal::from(c)))
        .collect()
}

fn default_cooldown_minutes() -> u32 {
    30
}

fn default_leg_timeout_secs() -> u64 {
    30
}

fn default_spot_decimals() -> u32 {
    8
}

fn default_settlement_wait_ms() -> u64 {
    2000
}

fn default_max_failed_attempts() -> u32 {
    3
}

fn default_balanced_gap_pct() -> Decimal {
    Decimal::ONE
}

fn default_rebalance_gap_pct() -> Decimal {
    Decimal::TWO
}

fn default_dust_quantity() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_seed_tolerance_pct() -> Decimal {
    Decimal::new(5, 0)
}

fn default_local_currency() -> String {
    "KRW".to_string()
}

fn default_stable_coin() -> String {
    "USDT".to_string()
}

fn default_local_venue() -> String {
    "paper".to_string()
}

fn default_derivative_venue() -> String {
    "paper".to_string()
}

fn default_min_order_usd() -> HashMap<String, Decimal> {
    HashMap::from([
        ("upbit".to_string(), Decimal::new(5, 0)),   // 5,000 KRW
        ("bithumb".to_string(), Decimal::new(1, 0)), // 1,000 KRW
        ("gateio".to_string(), Decimal::new(10, 0)),
        ("paper".to_string(), Decimal::new(1, 0)),
    ])
}

fn default_loop_interval_secs() -> u64 {
    60
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("RFH")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.hedge.max_position_usd > Decimal::ZERO,
            "max_position_usd must be positive"
        );

        anyhow::ensure!(
            self.hedge.position_increment_usd > Decimal::ZERO,
            "position_increment_usd must be positive"
        );

        anyhow::ensure!(!self.profit.stages.is_empty(), "at least one profit stage is required");

        for stage in &self.profit.stages {
            anyhow::ensure!(
                stage.close_pct > Decimal::ZERO && stage.close_pct <= Decimal::ONE_HUNDRED,
                "close_pct must be in (0, 100], got {}",
                stage.close_pct
            );
        }

        anyhow::ensure!(
            self.profit
                .stages
                .windows(2)
                .all(|w| w[0].threshold_pct < w[1].threshold_pct),
            "profit stages must be strictly ascending by threshold"
        );

        anyhow::ensure!(
            self.balance.balanced_gap_pct < self.balance.rebalance_gap_pct,
            "balanced_gap_pct must be below rebalance_gap_pct"
        );

        anyhow::ensure!(
            self.execution.leg_timeout_secs > 0,
            "leg_timeout_secs must be positive"
        );

        anyhow::ensure!(
            self.execution.max_failed_attempts >= 1,
            "max_failed_attempts must be at least 1"
        );

        Ok(())
    }
}

impl VenueConfig {
    /// Minimum order notional for a venue; zero when unknown.
    pub fn min_order_for(&self, venue: &str) -> Decimal {
        self.min_order_usd
            .get(&venue.to_lowercase())
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hedge: HedgeConfig::default(),
            profit: ProfitConfig::default(),
            execution: ExecutionConfig::default(),
            balance: BalanceConfig::default(),
            venues: VenueConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            max_position_usd: default_max_position_usd(),
            position_increment_usd: default_position_increment_usd(),
            build_premium_pct: default_build_premium_pct(),
            min_trade_usd: default_min_trade_usd(),
        }
    }
}

impl Default for ProfitConfig {
    fn default() -> Self {
        Self {
            stages: default_profit_stages(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_timeout_secs: default_leg_timeout_secs(),
            spot_decimals: default_spot_decimals(),
            settlement_wait_ms: default_settlement_wait_ms(),
            max_failed_attempts: default_max_failed_attempts(),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            balanced_gap_pct: default_balanced_gap_pct(),
            rebalance_gap_pct: default_rebalance_gap_pct(),
            dust_quantity: default_dust_quantity(),
            seed_tolerance_pct: default_seed_tolerance_pct(),
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            local_currency: default_local_currency(),
            stable_coin: default_stable_coin(),
            local_venue: default_local_venue(),
            derivative_venue: default_derivative_venue(),
            min_order_usd: default_min_order_usd(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: default_loop_interval_secs(),
            log_dir: default_log_dir(),
            state_db: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unordered_stages_rejected() {
        let mut config = Config::default();
        config.profit.stages = vec![
            ProfitStage::new(dec!(10), dec!(10)),
            ProfitStage::new(dec!(5), dec!(10)),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_gap_thresholds_rejected() {
        let mut config = Config::default();
        config.balance.balanced_gap_pct = dec!(3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_order_lookup_is_case_insensitive() {
        let venues = VenueConfig::default();
        assert_eq!(venues.min_order_for("GateIO"), dec!(10));
        assert_eq!(venues.min_order_for("unknown"), Decimal::ZERO);
    }

    #[test]
    fn test_emergency_stage() {
        assert!(ProfitStage::new(dec!(100), dec!(100)).is_emergency());
        assert!(ProfitStage::new(dec!(120), dec!(50)).closes_fully());
        assert!(!ProfitStage::new(dec!(50), dec!(40)).closes_fully());
    }

    #[test]
    fn test_load_reads_prefixed_nested_env_vars() {
        std::env::set_var("RFH_HEDGE__MAX_POSITION_USD", "777");
        std::env::set_var("RFH_RUNTIME__STATE_DB", "data/env_state.db");
        let loaded = Config::load();
        std::env::remove_var("RFH_HEDGE__MAX_POSITION_USD");
        std::env::remove_var("RFH_RUNTIME__STATE_DB");

        let config = loaded.unwrap();
        assert_eq!(config.hedge.max_position_usd, dec!(777));
        assert_eq!(config.runtime.state_db.as_deref(), Some("data/env_state.db"));
        assert_eq!(config.hedge.position_increment_usd, dec!(100));
    }
}
