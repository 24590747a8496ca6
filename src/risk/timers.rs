//! Staged profit-taking with per-stage cooldowns.
//!
//! Each (symbol, stage) pair is either unset or armed at a timestamp. A
//! stage reached for the first time arms and fires; reached again, it fires
//! only once the cooldown has elapsed since the last arm. Stages at or
//! above 100% premium fire on every call and close the whole position.

use crate::config::{ProfitConfig, ProfitStage};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// A stage that fired.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageTrigger {
    pub stage: ProfitStage,
    /// Arm time before this trigger; restore it if the close fails
    pub previous_arm: Option<DateTime<Utc>>,
}

impl StageTrigger {
    pub fn closes_fully(&self) -> bool {
        self.stage.closes_fully()
    }
}

/// Cooldown status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    Unset,
    CoolingDown { remaining: Duration },
    Ready,
}

#[derive(Debug, Clone)]
pub struct TimerManager {
    stages: Vec<ProfitStage>,
    cooldown: Duration,
    /// symbol -> stage threshold -> last arm
    timers: HashMap<String, BTreeMap<Decimal, Option<DateTime<Utc>>>>,
}

impl TimerManager {
    /// Create a timer manager. Stages are sorted ascending by threshold.
    pub fn new(config: &ProfitConfig) -> Self {
        let mut stages = config.stages.clone();
        stages.sort_by(|a, b| a.threshold_pct.cmp(&b.threshold_pct));
        Self {
            stages,
            cooldown: Duration::minutes(i64::from(config.cooldown_minutes)),
            timers: HashMap::new(),
        }
    }

    pub fn stages(&self) -> &[ProfitStage] {
        &self.stages
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// One unset timer per stage below 100%.
    pub fn initialize_symbol(&mut self, symbol: &str) {
        let entry = self.timers.entry(symbol.to_string()).or_default();
        for stage in self.stages.iter().filter(|s| !s.is_emergency()) {
            entry.entry(stage.threshold_pct).or_insert(None);
        }
        debug!(%symbol, stages = entry.len(), "Timers initialized");
    }

    pub fn remove_symbol(&mut self, symbol: &str) {
        if self.timers.remove(symbol).is_some() {
            debug!(%symbol, "Timers removed");
        }
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.timers.contains_key(symbol)
    }

    pub fn check_profit_taking(&mut self, symbol: &str, premium: Decimal) -> Option<StageTrigger> {
        self.check_profit_taking_at(symbol, premium, Utc::now())
    }

    /// Lowest qualifying stage whose cooldown has cleared at `now`, arming
    /// its timer. Higher stages are not evaluated once one fires.
    pub fn check_profit_taking_at(
        &mut self,
        symbol: &str,
        premium: Decimal,
        now: DateTime<Utc>,
    ) -> Option<StageTrigger> {
        let cooldown = self.cooldown;
        let timers = self.timers.entry(symbol.to_string()).or_default();

        for stage in &self.stages {
            if premium < stage.threshold_pct {
                break;
            }

            if stage.is_emergency() {
                info!(%symbol, %premium, threshold = %stage.threshold_pct, "Emergency stage reached, closing fully");
                return Some(StageTrigger {
                    stage: *stage,
                    previous_arm: None,
                });
            }

            let slot = timers.entry(stage.threshold_pct).or_insert(None);
            let armed_at = *slot;
            match armed_at {
                Some(armed) if now - armed < cooldown => {
                    debug!(
                        %symbol,
                        threshold = %stage.threshold_pct,
                        remaining_secs = (cooldown - (now - armed)).num_seconds(),
                        "Stage cooling down"
                    );
                    continue;
                }
                previous => {
                    *slot = Some(now);
                    info!(
                        %symbol,
                        %premium,
                        threshold = %stage.threshold_pct,
                        close_pct = %stage.close_pct,
                        "Profit stage fired"
                    );
                    return Some(StageTrigger {
                        stage: *stage,
                        previous_arm: previous,
                    });
                }
            }
        }
        None
    }

    /// Clear a stage's timer, returning the previous arm.
    pub fn reset_timer(&mut self, symbol: &str, threshold: Decimal) -> Option<DateTime<Utc>> {
        self.timers
            .get_mut(symbol)
            .and_then(|t| t.get_mut(&threshold))
            .and_then(|slot| slot.take())
    }

    pub fn set_timer(&mut self, symbol: &str, threshold: Decimal, armed: Option<DateTime<Utc>>) {
        self.timers
            .entry(symbol.to_string())
            .or_default()
            .insert(threshold, armed);
    }

    /// Restore a fired trigger's previous arm after a failed close.
    pub fn rollback(&mut self, symbol: &str, trigger: &StageTrigger) {
        if trigger.stage.is_emergency() {
            return;
        }
        self.set_timer(symbol, trigger.stage.threshold_pct, trigger.previous_arm);
        debug!(%symbol, threshold = %trigger.stage.threshold_pct, "Stage timer rolled back");
    }

    pub fn timer_status(&self, symbol: &str) -> Vec<(ProfitStage, TimerStatus)> {
        self.timer_status_at(symbol, Utc::now())
    }

    pub fn timer_status_at(&self, symbol: &str, now: DateTime<Utc>) -> Vec<(ProfitStage, TimerStatus)> {
        let timers = self.timers.get(symbol);
        self.stages
            .iter()
            .filter(|s| !s.is_emergency())
            .map(|stage| {
                let armed = timers.and_then(|t| t.get(&stage.threshold_pct)).copied().flatten();
                let status = match armed {
                    None => TimerStatus::Unset,
                    Some(at) if now - at < self.cooldown => TimerStatus::CoolingDown {
                        remaining: self.cooldown - (now - at),
                    },
                    Some(_) => TimerStatus::Ready,
                };
                (*stage, status)
            })
            .collect()
    }

    /// Armed timers as (symbol, threshold, armed at).
    pub fn armed_timers(&self) -> Vec<(String, Decimal, DateTime<Utc>)> {
        let mut armed: Vec<_> = self
            .timers
            .iter()
            .flat_map(|(symbol, stages)| {
                stages
                    .iter()
                    .filter_map(move |(threshold, at)| at.map(|at| (symbol.clone(), *threshold, at)))
            })
            .collect();
        armed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        armed
    }
}
