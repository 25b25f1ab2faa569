//! Signal Composer - Trade parameters under risk policy
//!
//! Turns a qualifying composite score into concrete entry/stop/target and
//! a position size. The take-profit is placed at the configured
//! reward/risk floor; the size is the account risk budget divided by the
//! stop distance, hard-capped per trade. Anything that cannot satisfy the
//! policy is rejected here and counted as attempted, never emitted.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{RiskConfig, StopMode};
use crate::error::{EngineError, EngineResult};
use crate::types::{CompositeScore, Direction, Signal, SignalStatus};

pub struct SignalComposer {
    cfg: RiskConfig,
}

impl SignalComposer {
    pub fn new(cfg: RiskConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.cfg
    }

    /// Compose a primary signal for a qualifying composite.
    pub fn compose(
        &self,
        composite: &CompositeScore,
        entry: f64,
        atr: Option<f64>,
        now: DateTime<Utc>,
    ) -> EngineResult<Signal> {
        self.compose_linked(composite, entry, atr, now, None)
    }

    /// Compose a secondary signal confirming an earlier primary.
    pub fn compose_secondary(
        &self,
        composite: &CompositeScore,
        entry: f64,
        atr: Option<f64>,
        now: DateTime<Utc>,
        primary_id: Uuid,
    ) -> EngineResult<Signal> {
        self.compose_linked(composite, entry, atr, now, Some(primary_id))
    }

    fn compose_linked(
        &self,
        composite: &CompositeScore,
        entry: f64,
        atr: Option<f64>,
        now: DateTime<Utc>,
        secondary_of: Option<Uuid>,
    ) -> EngineResult<Signal> {
        if !(entry > 0.0) || !entry.is_finite() {
            return Err(EngineError::SignalRejected(format!(
                "entry price {entry} is not positive"
            )));
        }

        let stop_distance = match self.cfg.stop_mode {
            StopMode::FixedPips => self.cfg.stop_pips * composite.instrument.pip_size(),
            StopMode::AtrMultiple => match atr {
                Some(atr) => atr * self.cfg.atr_multiple,
                None => {
                    return Err(EngineError::SignalRejected(
                        "ATR stop policy but no ATR available".into(),
                    ))
                }
            },
        };
        if !(stop_distance > 0.0) {
            return Err(EngineError::SignalRejected(format!(
                "non-positive stop distance {stop_distance}"
            )));
        }

        let reward_distance = stop_distance * self.cfg.min_risk_reward;
        let (stop_loss, take_profit) = match composite.direction {
            Direction::Long => (entry - stop_distance, entry + reward_distance),
            Direction::Short => (entry + stop_distance, entry - reward_distance),
        };
        if stop_loss <= 0.0 || take_profit <= 0.0 {
            return Err(EngineError::SignalRejected(format!(
                "stop {stop_loss} / target {take_profit} crossed zero"
            )));
        }

        let stop_fraction = stop_distance / entry;
        let position_size_pct = (self.cfg.account_risk_pct / stop_fraction)
            .min(self.cfg.max_risk_per_trade);
        if !(position_size_pct > 0.0) {
            return Err(EngineError::SignalRejected(format!(
                "non-positive position size {position_size_pct}"
            )));
        }

        Ok(Signal {
            id: Uuid::new_v4(),
            instrument: composite.instrument,
            timeframe: composite.timeframe,
            direction: composite.direction,
            entry,
            stop_loss,
            take_profit,
            risk_reward_ratio: self.cfg.min_risk_reward,
            position_size_pct,
            composite_score: composite.value,
            created_at: now,
            status: SignalStatus::Pending,
            linked_variant_id: composite.variant_id.clone(),
            secondary_of,
        })
    }
}
