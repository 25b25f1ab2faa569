//! Adaptation Controller - Single owner of the active variant
//!
//! Consumes day-close summaries and trade outcomes, detects no-signal
//! streaks, and drives the gated switch protocol: pick a candidate, have
//! the engine backtest it off the scoring path, then either promote it
//! atomically or blacklist it for a cooldown so the loop cannot thrash
//! between the same two variants. Outcomes are attributed to the variant
//! that generated the originating signal, which is not necessarily the
//! one active when the trade closes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::backtest::BacktestMetrics;
use crate::config::{AdaptationConfig, SelectionMode};
use crate::error::{EngineError, EngineResult};
use crate::strategy::{PerformanceWindow, StrategyRegistry, VariantState, WeightVector};
use crate::types::TradeResult;

/// Exclusive adaptation bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationState {
    pub active_variant_id: String,
    pub streak_days: u32,
    /// Rejected candidates and when their cooldown lifts
    pub blacklist: BTreeMap<String, DateTime<Utc>>,
    pub last_switch_at: Option<DateTime<Utc>>,
}

/// Audit record emitted on every promotion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSwitchEvent {
    pub old_variant: String,
    pub new_variant: String,
    pub reason: String,
    pub backtest_win_rate: f64,
    pub switched_at: DateTime<Utc>,
}

/// Answer to a performance/status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub state: AdaptationState,
    pub windows: BTreeMap<String, PerformanceWindow>,
}

pub struct AdaptationController {
    cfg: AdaptationConfig,
    registry: StrategyRegistry,
    state: AdaptationState,
    /// Cursor into the sorted variant ids for round-robin selection
    rr_cursor: usize,
}

impl AdaptationController {
    pub fn new(
        cfg: AdaptationConfig,
        mut registry: StrategyRegistry,
        initial_active: Option<&str>,
    ) -> EngineResult<Self> {
        let active_id = match initial_active {
            Some(id) => {
                if !registry.contains(id) {
                    return Err(EngineError::UnknownVariant(id.to_string()));
                }
                id.to_string()
            }
            None => registry
                .variant_ids()
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EngineError::ConfigValidation("registry has no variants".into())
                })?,
        };
        registry.set_state(&active_id, VariantState::Active)?;
        Ok(Self {
            cfg,
            registry,
            state: AdaptationState {
                active_variant_id: active_id,
                streak_days: 0,
                blacklist: BTreeMap::new(),
                last_switch_at: None,
            },
            rr_cursor: 0,
        })
    }

    pub fn active_variant_id(&self) -> &str {
        &self.state.active_variant_id
    }

    /// Atomic snapshot of the active weight vector
    pub fn active_vector(&self) -> Arc<WeightVector> {
        self.registry
            .vector(&self.state.active_variant_id)
            .expect("active variant always registered")
    }

    /// Vector for any registered variant (secondary re-checks score with
    /// the originating variant, not whatever is active by then)
    pub fn vector(&self, variant_id: &str) -> EngineResult<Arc<WeightVector>> {
        self.registry.vector(variant_id)
    }

    pub fn contains(&self, variant_id: &str) -> bool {
        self.registry.contains(variant_id)
    }

    /// Attribute a realized outcome to the variant that produced the
    /// signal. Unknown variants (removed by a reconfigure) are dropped
    /// with a log line rather than failing the caller.
    pub fn record_outcome(&mut self, variant_id: &str, result: TradeResult) {
        match self.registry.performance_mut(variant_id) {
            Ok(window) => {
                window.record(result);
                tracing::debug!(
                    variant = variant_id,
                    %result,
                    win_rate = window.win_rate(),
                    "outcome recorded"
                );
            }
            Err(_) => {
                tracing::warn!(variant = variant_id, "outcome for unregistered variant dropped");
            }
        }
    }

    /// Close out a trading day. Returns the candidate to backtest when the
    /// no-signal streak reaches the trigger, otherwise None.
    pub fn on_day_close(
        &mut self,
        had_qualifying_signal: bool,
        now: DateTime<Utc>,
    ) -> Option<String> {
        self.purge_blacklist(now);

        if had_qualifying_signal {
            self.state.streak_days = 0;
            if let Ok(window) = self
                .registry
                .performance_mut(&self.state.active_variant_id.clone())
            {
                window.consecutive_no_signal_days = 0;
            }
            return None;
        }

        self.state.streak_days += 1;
        if let Ok(window) = self
            .registry
            .performance_mut(&self.state.active_variant_id.clone())
        {
            window.consecutive_no_signal_days = self.state.streak_days;
        }
        tracing::info!(
            variant = %self.state.active_variant_id,
            streak = self.state.streak_days,
            "no qualifying signals today"
        );

        if self.state.streak_days < self.cfg.no_signal_threshold_days {
            return None;
        }
        self.select_candidate(now)
    }

    /// Pick the next candidate per the configured selection mode, skipping
    /// the active variant and anything still cooling down.
    fn select_candidate(&mut self, now: DateTime<Utc>) -> Option<String> {
        let ids = self.registry.variant_ids();
        let eligible: Vec<&String> = ids
            .iter()
            .filter(|id| **id != self.state.active_variant_id)
            .filter(|id| !self.state.blacklist.contains_key(*id))
            .collect();
        if eligible.is_empty() {
            tracing::warn!("no eligible candidate variants; adaptation idle");
            return None;
        }

        let chosen = match self.cfg.selection {
            SelectionMode::RoundRobin => {
                let pick = eligible[self.rr_cursor % eligible.len()].clone();
                self.rr_cursor = self.rr_cursor.wrapping_add(1);
                pick
            }
            SelectionMode::WinRate => eligible
                .iter()
                .max_by(|a, b| {
                    let wa = self
                        .registry
                        .performance(a)
                        .map(|w| w.win_rate())
                        .unwrap_or(0.0);
                    let wb = self
                        .registry
                        .performance(b)
                        .map(|w| w.win_rate())
                        .unwrap_or(0.0);
                    // Tie-break by variant_id: prefer the lexicographically
                    // smaller id, so reverse the id ordering under max_by.
                    wa.partial_cmp(&wb)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| b.cmp(a))
                })
                .map(|id| (*id).clone())
                .expect("eligible checked non-empty"),
        };

        let _ = self.registry.set_state(&chosen, VariantState::Candidate);
        tracing::info!(candidate = %chosen, at = %now, "candidate selected for backtest");
        Some(chosen)
    }

    /// Apply a finished backtest. Promotes, blacklists, or defers; the
    /// active vector only ever changes inside this single-writer call.
    pub fn apply_backtest_verdict(
        &mut self,
        candidate_id: &str,
        metrics: &BacktestMetrics,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<VariantSwitchEvent>> {
        if !self.registry.contains(candidate_id) {
            return Err(EngineError::UnknownVariant(candidate_id.to_string()));
        }
        if metrics.total_trades < self.cfg.min_backtest_trades {
            // Too small a sample to judge; leave the candidate eligible
            self.registry
                .set_state(candidate_id, VariantState::Retired)?;
            return Err(EngineError::AdaptationDeferred(format!(
                "backtest produced {} trades, need {}",
                metrics.total_trades, self.cfg.min_backtest_trades
            )));
        }

        if metrics.win_rate >= self.cfg.min_win_rate {
            let old = std::mem::replace(
                &mut self.state.active_variant_id,
                candidate_id.to_string(),
            );
            self.registry.set_state(&old, VariantState::Retired)?;
            self.registry.set_state(candidate_id, VariantState::Active)?;
            self.state.streak_days = 0;
            self.state.last_switch_at = Some(now);
            let event = VariantSwitchEvent {
                old_variant: old,
                new_variant: candidate_id.to_string(),
                reason: "no_signal_streak".to_string(),
                backtest_win_rate: metrics.win_rate,
                switched_at: now,
            };
            tracing::info!(
                old = %event.old_variant,
                new = %event.new_variant,
                win_rate = event.backtest_win_rate,
                "variant switched"
            );
            Ok(Some(event))
        } else {
            let until = now + Duration::days(self.cfg.blacklist_cooldown_days);
            self.state
                .blacklist
                .insert(candidate_id.to_string(), until);
            self.registry
                .set_state(candidate_id, VariantState::Blacklisted)?;
            tracing::info!(
                candidate = candidate_id,
                win_rate = metrics.win_rate,
                required = self.cfg.min_win_rate,
                cooldown_until = %until,
                "candidate rejected and blacklisted"
            );
            Ok(None)
        }
    }

    fn purge_blacklist(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .state
            .blacklist
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.state.blacklist.remove(&id);
            let _ = self.registry.set_state(&id, VariantState::Retired);
            tracing::debug!(variant = %id, "blacklist cooldown expired");
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            state: self.state.clone(),
            windows: self.registry.performance_snapshot(),
        }
    }

    /// Replace the whole variant set. The active variant survives when the
    /// new set still contains it, otherwise the first variant takes over.
    pub fn replace_registry(&mut self, registry: StrategyRegistry) -> EngineResult<()> {
        let keep_active = registry.contains(&self.state.active_variant_id);
        self.registry = registry;
        if !keep_active {
            let first = self
                .registry
                .variant_ids()
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EngineError::ConfigValidation("replacement registry is empty".into())
                })?;
            tracing::info!(
                old = %self.state.active_variant_id,
                new = %first,
                "active variant removed by reconfigure; falling back"
            );
            self.state.active_variant_id = first;
        }
        self.registry
            .set_state(&self.state.active_variant_id.clone(), VariantState::Active)?;
        // Cooldowns only apply to ids that still exist
        let ids = self.registry.variant_ids();
        self.state.blacklist.retain(|id, _| ids.contains(id));
        for id in self.state.blacklist.keys() {
            let _ = self.registry.set_state(id, VariantState::Blacklisted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::strategy::StrategyRegistry;
    use chrono::TimeZone;

    fn controller(selection: SelectionMode) -> AdaptationController {
        let mut cfg = EngineConfig::default().adaptation;
        cfg.selection = selection;
        let registry = StrategyRegistry::new(StrategyRegistry::default_variants()).unwrap();
        AdaptationController::new(cfg, registry, Some("balanced")).unwrap()
    }

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, n, 22, 0, 0).unwrap()
    }

    fn metrics(total: usize, win_rate: f64) -> BacktestMetrics {
        let wins = (total as f64 * win_rate).round() as usize;
        BacktestMetrics {
            total_trades: total,
            wins,
            losses: total - wins,
            win_rate,
            ..Default::default()
        }
    }

    #[test]
    fn test_streak_triggers_after_threshold_days() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        assert!(ctl.on_day_close(false, day(1)).is_none());
        assert!(ctl.on_day_close(false, day(2)).is_none());
        let candidate = ctl.on_day_close(false, day(3));
        assert!(candidate.is_some());
        assert_ne!(candidate.unwrap(), "balanced");
    }

    #[test]
    fn test_signal_day_resets_streak() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        ctl.on_day_close(false, day(1));
        ctl.on_day_close(false, day(2));
        ctl.on_day_close(true, day(3));
        assert!(ctl.on_day_close(false, day(4)).is_none());
        assert_eq!(ctl.snapshot().state.streak_days, 1);
    }

    #[test]
    fn test_promotion_is_atomic_and_resets_streak() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        for n in 1..=3 {
            ctl.on_day_close(false, day(n));
        }
        let candidate = ctl.snapshot();
        assert_eq!(candidate.state.streak_days, 3);

        let event = ctl
            .apply_backtest_verdict("mean_reverter", &metrics(20, 0.65), day(3))
            .unwrap()
            .unwrap();
        assert_eq!(event.old_variant, "balanced");
        assert_eq!(event.new_variant, "mean_reverter");
        assert_eq!(ctl.active_variant_id(), "mean_reverter");
        assert_eq!(ctl.snapshot().state.streak_days, 0);
        assert_eq!(ctl.active_vector().variant_id(), "mean_reverter");
    }

    #[test]
    fn test_rejection_blacklists_candidate() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        for n in 1..=3 {
            ctl.on_day_close(false, day(n));
        }
        let result = ctl
            .apply_backtest_verdict("mean_reverter", &metrics(20, 0.45), day(3))
            .unwrap();
        assert!(result.is_none());
        assert_eq!(ctl.active_variant_id(), "balanced");
        assert!(ctl.snapshot().state.blacklist.contains_key("mean_reverter"));

        // Next trigger must skip the blacklisted variant
        let next = ctl.on_day_close(false, day(4)).unwrap();
        assert_eq!(next, "trend_rider");
    }

    #[test]
    fn test_blacklist_cooldown_expires() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        for n in 1..=3 {
            ctl.on_day_close(false, day(n));
        }
        ctl.apply_backtest_verdict("mean_reverter", &metrics(20, 0.10), day(3))
            .unwrap();
        // Cooldown is 7 days; on day 11 the variant is selectable again
        let later = day(11);
        ctl.on_day_close(false, later);
        assert!(!ctl.snapshot().state.blacklist.contains_key("mean_reverter"));
    }

    #[test]
    fn test_small_sample_defers_without_blacklist() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        for n in 1..=3 {
            ctl.on_day_close(false, day(n));
        }
        let err = ctl
            .apply_backtest_verdict("mean_reverter", &metrics(2, 1.0), day(3))
            .unwrap_err();
        assert!(matches!(err, EngineError::AdaptationDeferred(_)));
        assert_eq!(ctl.active_variant_id(), "balanced");
        assert!(ctl.snapshot().state.blacklist.is_empty());
    }

    #[test]
    fn test_win_rate_selection_prefers_best_history() {
        let mut ctl = controller(SelectionMode::WinRate);
        ctl.record_outcome("trend_rider", TradeResult::Win);
        ctl.record_outcome("trend_rider", TradeResult::Win);
        ctl.record_outcome("mean_reverter", TradeResult::Win);
        ctl.record_outcome("mean_reverter", TradeResult::Loss);
        ctl.on_day_close(false, day(1));
        ctl.on_day_close(false, day(2));
        let pick = ctl.on_day_close(false, day(3)).unwrap();
        assert_eq!(pick, "trend_rider");
    }

    #[test]
    fn test_win_rate_selection_ties_break_by_id() {
        let mut ctl = controller(SelectionMode::WinRate);
        ctl.record_outcome("trend_rider", TradeResult::Win);
        ctl.record_outcome("mean_reverter", TradeResult::Win);
        ctl.on_day_close(false, day(1));
        ctl.on_day_close(false, day(2));
        let pick = ctl.on_day_close(false, day(3)).unwrap();
        // Equal win rates tie-break to the lexicographically first id
        assert_eq!(pick, "mean_reverter");
    }

    #[test]
    fn test_outcome_attribution_to_originating_variant() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        // Switch away from balanced, then report an outcome for it
        for n in 1..=3 {
            ctl.on_day_close(false, day(n));
        }
        ctl.apply_backtest_verdict("mean_reverter", &metrics(20, 0.70), day(3))
            .unwrap();
        ctl.record_outcome("balanced", TradeResult::Win);
        let snapshot = ctl.snapshot();
        assert_eq!(snapshot.windows["balanced"].wins, 1);
        assert_eq!(snapshot.windows["mean_reverter"].trades, 0);
    }

    #[test]
    fn test_replace_registry_keeps_active_when_present() {
        let mut ctl = controller(SelectionMode::RoundRobin);
        let replacement =
            StrategyRegistry::new(StrategyRegistry::default_variants()).unwrap();
        ctl.replace_registry(replacement).unwrap();
        assert_eq!(ctl.active_variant_id(), "balanced");
    }
}
