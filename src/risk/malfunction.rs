//! Hedge malfunction alerts and per-symbol failure quarantine.
//!
//! Alerts are emitted as structured JSON on the `hedge_alert` target so log
//! tooling can pick up cases that need a human: an unhedged leg left behind
//! by a failed compensation, a quarantined symbol, or a residual imbalance.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

/// Kinds of hedge malfunction.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// A compensating order failed; one leg is unhedged
    CompensationFailed {
        symbol: String,
        venue: String,
        pair: String,
        side: String,
        quantity: Decimal,
        reason: String,
    },
    /// Consecutive execution failures reached the limit
    SymbolQuarantined {
        symbol: String,
        consecutive_failures: u32,
    },
    /// A gap remained after post-close correction
    ResidualImbalance { symbol: String, gap_pct: Decimal },
    /// Leg valuations disagreed when seeding an existing position
    SeedDiscrepancy {
        symbol: String,
        spot_value_usd: Decimal,
        derivative_value_usd: Decimal,
    },
}

impl AlertKind {
    pub fn symbol(&self) -> &str {
        match self {
            AlertKind::CompensationFailed { symbol, .. }
            | AlertKind::SymbolQuarantined { symbol, .. }
            | AlertKind::ResidualImbalance { symbol, .. }
            | AlertKind::SeedDiscrepancy { symbol, .. } => symbol,
        }
    }
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// A structured hedge alert.
#[derive(Debug, Clone, Serialize)]
pub struct HedgeAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub requires_manual_action: bool,
    pub suggested_action: String,
}

impl HedgeAlert {
    pub fn new(
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        suggested_action: impl Into<String>,
    ) -> Self {
        let timestamp = Utc::now();
        let alert_id = format!(
            "hedge-{}-{}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );
        Self {
            alert_id,
            timestamp,
            requires_manual_action: severity == AlertSeverity::Critical,
            kind,
            severity,
            message: message.into(),
            suggested_action: suggested_action.into(),
        }
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        let symbol = self.kind.symbol();

        match self.severity {
            AlertSeverity::Info => info!(target: "hedge_alert", %symbol, "HEDGE_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "hedge_alert", %symbol, "HEDGE_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "hedge_alert", %symbol, "HEDGE_ALERT: {}", json),
            AlertSeverity::Critical => {
                error!(target: "hedge_alert", %symbol, critical = true, "HEDGE_ALERT: {}", json)
            }
        }
    }
}

/// Consecutive execution failures per symbol.
///
/// A symbol whose count reaches `max_failures` is quarantined: the
/// orchestrator skips it until [`reset`](Self::reset) is called.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    max_failures: u32,
    counts: HashMap<String, u32>,
}

impl FailureTracker {
    pub fn new(max_failures: u32) -> Self {
        Self {
            max_failures: max_failures.max(1),
            counts: HashMap::new(),
        }
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    /// Start tracking a symbol, keeping any restored count.
    pub fn register(&mut self, symbol: &str) {
        self.counts.entry(symbol.to_string()).or_insert(0);
    }

    /// Record a failed execution. Returns an alert when this failure puts the
    /// symbol into quarantine.
    pub fn record_failure(&mut self, symbol: &str) -> Option<HedgeAlert> {
        let count = self.counts.entry(symbol.to_string()).or_insert(0);
        *count += 1;

        warn!(
            %symbol,
            consecutive_failures = *count,
            max = self.max_failures,
            "Execution failed"
        );

        if *count == self.max_failures {
            return Some(HedgeAlert::new(
                AlertKind::SymbolQuarantined {
                    symbol: symbol.to_string(),
                    consecutive_failures: *count,
                },
                AlertSeverity::Critical,
                format!(
                    "{} consecutive execution failures for {}; automatic processing stopped",
                    count, symbol
                ),
                format!("Inspect both venues, then reset failures for {}", symbol),
            ));
        }
        None
    }

    /// Record a successful execution (resets the counter).
    pub fn record_success(&mut self, symbol: &str) {
        if let Some(count) = self.counts.get_mut(symbol) {
            if *count > 0 {
                debug!(%symbol, previous_failures = *count, "Execution succeeded, resetting failure counter");
            }
            *count = 0;
        }
    }

    pub fn count(&self, symbol: &str) -> u32 {
        self.counts.get(symbol).copied().unwrap_or(0)
    }

    pub fn is_quarantined(&self, symbol: &str) -> bool {
        self.count(symbol) >= self.max_failures
    }

    /// Manual reset. Returns the previous count.
    pub fn reset(&mut self, symbol: &str) -> u32 {
        let previous = self.counts.insert(symbol.to_string(), 0).unwrap_or(0);
        info!(%symbol, previous_failures = previous, "Failure counter reset");
        previous
    }

    pub fn remove(&mut self, symbol: &str) {
        self.counts.remove(symbol);
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.counts.clone()
    }

    /// Restore counts from a journal.
    pub fn restore(&mut self, counts: HashMap<String, u32>) {
        self.counts.extend(counts);
    }
}
