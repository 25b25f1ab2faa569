//! Backtester - Bounded replay used to gate variant promotion
//!
//! Replays a trailing candle window per instrument with a candidate
//! weight vector, composing hypothetical trades wherever the composite
//! qualifies and resolving them first-touch against subsequent bars.
//! Results are expressed in R multiples (risk units): a win banks the
//! configured reward/risk floor, a loss costs one unit. The replay is a
//! pure function of its inputs, so a verdict is reproducible from the
//! same snapshot.

use serde::{Deserialize, Serialize};

use crate::composer::SignalComposer;
use crate::indicators::IndicatorBank;
use crate::scorer::ConfluenceScorer;
use crate::strategy::WeightVector;
use crate::types::{Candle, Direction, Instrument, Timeframe, TradeResult};

/// Simulated trade record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub composite: f64,
    pub result: TradeResult,
    /// PnL in R units
    pub pnl_r: f64,
}

/// Aggregate replay metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_rate: f64,
    /// Gross win R over gross loss R
    pub profit_factor: f64,
    /// Worst peak-to-trough drop of the R equity curve
    pub max_drawdown_r: f64,
    /// Mean R per trade
    pub expectancy_r: f64,
}

pub struct Backtester<'a> {
    bank: &'a IndicatorBank,
    scorer: &'a ConfluenceScorer,
    composer: &'a SignalComposer,
    /// Bars a simulated trade may run before horizon expiry
    horizon: usize,
}

impl<'a> Backtester<'a> {
    pub fn new(
        bank: &'a IndicatorBank,
        scorer: &'a ConfluenceScorer,
        composer: &'a SignalComposer,
        horizon: usize,
    ) -> Self {
        Self {
            bank,
            scorer,
            composer,
            horizon,
        }
    }

    /// Replay one or more candle streams with the candidate vector.
    pub fn run(
        &self,
        candidate: &WeightVector,
        streams: &[Vec<Candle>],
    ) -> (BacktestMetrics, Vec<BacktestTrade>) {
        let mut trades = Vec::new();
        for candles in streams {
            self.replay_stream(candidate, candles, &mut trades);
        }
        (Self::metrics(&trades), trades)
    }

    fn replay_stream(
        &self,
        candidate: &WeightVector,
        candles: &[Candle],
        trades: &mut Vec<BacktestTrade>,
    ) {
        let lookback = self.bank.min_lookback();
        if candles.len() <= lookback {
            return;
        }
        let mut i = lookback - 1;
        while i < candles.len() - 1 {
            let window = &candles[..=i];
            let entry_candle = &candles[i];
            let readings = match self.bank.compute(window) {
                Ok(r) => r,
                Err(_) => {
                    i += 1;
                    continue;
                }
            };
            let composite = match self.scorer.compose(
                entry_candle.instrument,
                entry_candle.timeframe,
                entry_candle.open_time,
                &readings,
                candidate,
            ) {
                Some(c) if self.scorer.qualifies(&c) => c,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let atr = self.bank.atr(window);
            let signal = match self.composer.compose(
                &composite,
                entry_candle.close,
                atr,
                entry_candle.open_time,
            ) {
                Ok(s) => s,
                Err(_) => {
                    i += 1;
                    continue;
                }
            };

            let Some((result, exit_idx)) = self.resolve(candles, i, &signal) else {
                // Not enough forward bars left for a verdict
                break;
            };
            let pnl_r = match result {
                TradeResult::Win => signal.risk_reward_ratio,
                TradeResult::Loss => -1.0,
            };
            trades.push(BacktestTrade {
                instrument: signal.instrument,
                timeframe: signal.timeframe,
                direction: signal.direction,
                entry: signal.entry,
                stop_loss: signal.stop_loss,
                take_profit: signal.take_profit,
                composite: composite.value,
                result,
                pnl_r,
            });
            // One position at a time: resume after the exit bar
            i = exit_idx + 1;
        }
    }

    /// First-touch resolution over the forward bars. A bar reaching both
    /// levels counts as a loss; the horizon expiring resolves by the sign
    /// of the net move.
    fn resolve(
        &self,
        candles: &[Candle],
        entry_idx: usize,
        signal: &crate::types::Signal,
    ) -> Option<(TradeResult, usize)> {
        let last_idx = (entry_idx + self.horizon).min(candles.len() - 1);
        if last_idx <= entry_idx {
            return None;
        }
        for (j, bar) in candles
            .iter()
            .enumerate()
            .take(last_idx + 1)
            .skip(entry_idx + 1)
        {
            let (hit_stop, hit_target) = match signal.direction {
                Direction::Long => (bar.low <= signal.stop_loss, bar.high >= signal.take_profit),
                Direction::Short => (bar.high >= signal.stop_loss, bar.low <= signal.take_profit),
            };
            if hit_stop {
                return Some((TradeResult::Loss, j));
            }
            if hit_target {
                return Some((TradeResult::Win, j));
            }
        }
        let exit = &candles[last_idx];
        let moved = (exit.close - signal.entry) * signal.direction.sign();
        let result = if moved > 0.0 {
            TradeResult::Win
        } else {
            TradeResult::Loss
        };
        Some((result, last_idx))
    }

    fn metrics(trades: &[BacktestTrade]) -> BacktestMetrics {
        if trades.is_empty() {
            return BacktestMetrics::default();
        }
        let wins = trades.iter().filter(|t| t.result == TradeResult::Win).count();
        let losses = trades.len() - wins;
        let gross_win: f64 = trades.iter().filter(|t| t.pnl_r > 0.0).map(|t| t.pnl_r).sum();
        let gross_loss: f64 = trades
            .iter()
            .filter(|t| t.pnl_r < 0.0)
            .map(|t| t.pnl_r.abs())
            .sum();
        let profit_factor = if gross_loss > 0.0 {
            gross_win / gross_loss
        } else if gross_win > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let total_r: f64 = trades.iter().map(|t| t.pnl_r).sum();
        let mut equity = 0.0_f64;
        let mut peak = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for trade in trades {
            equity += trade.pnl_r;
            peak = peak.max(equity);
            max_drawdown = max_drawdown.max(peak - equity);
        }

        BacktestMetrics {
            total_trades: trades.len(),
            wins,
            losses,
            win_rate: wins as f64 / trades.len() as f64,
            profit_factor,
            max_drawdown_r: max_drawdown,
            expectancy_r: total_r / trades.len() as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::indicators::test_support::candles_from_closes;
    use crate::strategy::StrategyRegistry;

    struct Fixture {
        bank: IndicatorBank,
        scorer: ConfluenceScorer,
        composer: SignalComposer,
    }

    fn fixture(threshold: f64) -> Fixture {
        let mut cfg = EngineConfig::default();
        cfg.confluence.threshold = threshold;
        Fixture {
            bank: IndicatorBank::new(cfg.indicators),
            scorer: ConfluenceScorer::new(&cfg.confluence),
            composer: SignalComposer::new(cfg.risk),
        }
    }

    #[test]
    fn test_empty_stream_no_trades() {
        let f = fixture(0.70);
        let backtester = Backtester::new(&f.bank, &f.scorer, &f.composer, 48);
        let candidate = StrategyRegistry::default_variants().remove(0);
        let (metrics, trades) = backtester.run(&candidate, &[Vec::new()]);
        assert_eq!(metrics.total_trades, 0);
        assert!(trades.is_empty());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let f = fixture(0.10);
        let backtester = Backtester::new(&f.bank, &f.scorer, &f.composer, 12);
        let candidate = StrategyRegistry::default_variants().remove(0);
        let closes: Vec<f64> = (0..200)
            .map(|i| 1.10 + 0.01 * ((i as f64) * 0.15).sin())
            .collect();
        let stream = candles_from_closes(&closes);
        let (m1, t1) = backtester.run(&candidate, &[stream.clone()]);
        let (m2, t2) = backtester.run(&candidate, &[stream]);
        assert_eq!(m1.total_trades, m2.total_trades);
        assert_eq!(m1.win_rate, m2.win_rate);
        assert_eq!(t1.len(), t2.len());
    }

    #[test]
    fn test_metrics_consistency() {
        let f = fixture(0.10);
        let backtester = Backtester::new(&f.bank, &f.scorer, &f.composer, 12);
        let candidate = StrategyRegistry::default_variants().remove(0);
        let closes: Vec<f64> = (0..300)
            .map(|i| 1.10 + 0.012 * ((i as f64) * 0.11).sin())
            .collect();
        let (metrics, trades) = backtester.run(&candidate, &[candles_from_closes(&closes)]);
        assert_eq!(metrics.total_trades, trades.len());
        assert_eq!(metrics.wins + metrics.losses, metrics.total_trades);
        if metrics.total_trades > 0 {
            assert!((0.0..=1.0).contains(&metrics.win_rate));
            let expected_rate = metrics.wins as f64 / metrics.total_trades as f64;
            assert!((metrics.win_rate - expected_rate).abs() < 1e-12);
        }
    }

    #[test]
    fn test_trades_do_not_overlap() {
        let f = fixture(0.10);
        let backtester = Backtester::new(&f.bank, &f.scorer, &f.composer, 6);
        let candidate = StrategyRegistry::default_variants().remove(0);
        let closes: Vec<f64> = (0..300)
            .map(|i| 1.10 + 0.012 * ((i as f64) * 0.11).sin())
            .collect();
        let stream = candles_from_closes(&closes);
        let (metrics, _) = backtester.run(&candidate, &[stream]);
        // Each trade consumes its entry bar plus at least one exit bar
        let lookback = f.bank.min_lookback();
        assert!(metrics.total_trades <= (300 - lookback) / 2 + 1);
    }
}
