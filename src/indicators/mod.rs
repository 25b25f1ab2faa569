//! Indicator Bank - Normalized directional scores from a candle window
//!
//! Computes one score per technical indicator from a rolling window:
//! - RSI (Wilder's smoothing)
//! - MACD (EMA signal line, histogram normalized by its rolling max)
//! - Bollinger Bands (mean-reversion score)
//! - Support/Resistance proximity
//! - Fibonacci retracement proximity
//! - Volume surge confirmation
//!
//! Every function is pure in the window: the same candles always produce
//! the same readings. Scores carry direction in their sign (positive
//! bullish) and strength in their magnitude, all within [-1, 1]. A window
//! shorter than the combined minimum lookback yields DataInsufficient and
//! the candle is skipped outright; there is no partial scoring.

pub mod levels;

use crate::config::IndicatorConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, IndicatorKind, IndicatorReading};

pub struct IndicatorBank {
    cfg: IndicatorConfig,
}

impl IndicatorBank {
    pub fn new(cfg: IndicatorConfig) -> Self {
        Self { cfg }
    }

    pub fn min_lookback(&self) -> usize {
        self.cfg.min_lookback()
    }

    /// Compute all configured indicator readings for the window.
    pub fn compute(&self, window: &[Candle]) -> EngineResult<Vec<IndicatorReading>> {
        let need = self.min_lookback();
        if window.len() < need {
            tracing::debug!(have = window.len(), need, "window too short for scoring");
            return Err(EngineError::DataInsufficient {
                have: window.len(),
                need,
            });
        }
        let last = window.last().expect("window checked non-empty");
        let computed_at = last.open_time;

        let (rsi_score, rsi_raw) = self.score_rsi(window);
        let (macd_score, macd_raw) = self.score_macd(window);
        let (bb_score, bb_raw) = self.score_bollinger(window);
        let (sr_score, sr_raw) =
            levels::support_resistance_score(window, self.cfg.sr_lookback);
        let (fib_score, fib_raw) =
            levels::fibonacci_score(window, self.cfg.fib_lookback, self.cfg.fib_tolerance);
        let (vol_score, vol_raw) = self.score_volume(window);

        let readings = vec![
            IndicatorReading {
                indicator: IndicatorKind::Rsi,
                score: rsi_score,
                raw_value: rsi_raw,
                computed_at,
            },
            IndicatorReading {
                indicator: IndicatorKind::Macd,
                score: macd_score,
                raw_value: macd_raw,
                computed_at,
            },
            IndicatorReading {
                indicator: IndicatorKind::Bollinger,
                score: bb_score,
                raw_value: bb_raw,
                computed_at,
            },
            IndicatorReading {
                indicator: IndicatorKind::SupportResistance,
                score: sr_score,
                raw_value: sr_raw,
                computed_at,
            },
            IndicatorReading {
                indicator: IndicatorKind::Fibonacci,
                score: fib_score,
                raw_value: fib_raw,
                computed_at,
            },
            IndicatorReading {
                indicator: IndicatorKind::Volume,
                score: vol_score,
                raw_value: vol_raw,
                computed_at,
            },
        ];

        debug_assert!(readings.iter().all(|r| r.score.abs() <= 1.0 + 1e-12));
        Ok(readings)
    }

    /// RSI over the window using Wilder's smoothing, then the confluence
    /// normalization: bullish below 30, bearish above 70, flat between.
    fn score_rsi(&self, window: &[Candle]) -> (f64, f64) {
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let rsi = wilder_rsi(&closes, self.cfg.rsi_period);
        (normalize_rsi(rsi), rsi)
    }

    /// MACD histogram signed by the line/signal spread, scaled by the
    /// rolling max |histogram| so instruments with different price scales
    /// land on the same [-1, 1] axis.
    fn score_macd(&self, window: &[Candle]) -> (f64, f64) {
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let hist = macd_histogram_series(
            &closes,
            self.cfg.macd_fast,
            self.cfg.macd_slow,
            self.cfg.macd_signal,
        );
        let last_hist = match hist.last() {
            Some(h) => *h,
            None => return (0.0, 0.0),
        };
        let norm_window = hist.len().saturating_sub(self.cfg.macd_norm_lookback);
        let max_abs = hist[norm_window..]
            .iter()
            .fold(0.0_f64, |acc, h| acc.max(h.abs()));
        if max_abs <= 0.0 {
            return (0.0, last_hist);
        }
        let score = (last_hist.signum() * (last_hist.abs() / max_abs)).clamp(-1.0, 1.0);
        (score, last_hist)
    }

    /// Mean-reversion score: price at the upper band scores -1, at the
    /// lower band +1, at the midline 0. Raw value is the %B position.
    fn score_bollinger(&self, window: &[Candle]) -> (f64, f64) {
        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let period = self.cfg.bb_period;
        let tail = &closes[closes.len() - period..];
        let mid = mean(tail);
        let sigma = std_dev(tail, mid);
        let upper = mid + self.cfg.bb_mult * sigma;
        let lower = mid - self.cfg.bb_mult * sigma;
        let close = *closes.last().expect("window checked non-empty");
        if upper <= mid {
            // Flat series, bands collapsed
            return (0.0, 0.5);
        }
        let score = (-(close - mid) / (upper - mid)).clamp(-1.0, 1.0);
        let percent_b = (close - lower) / (upper - lower);
        (score, percent_b)
    }

    /// Volume surge relative to its moving average, signed by the
    /// concurrent candle body. Below-average volume is absence of
    /// confirmation, not a contrary signal, so it scores 0.
    fn score_volume(&self, window: &[Candle]) -> (f64, f64) {
        let period = self.cfg.volume_period;
        let last = window.last().expect("window checked non-empty");
        let prior = &window[window.len() - 1 - period..window.len() - 1];
        let ma = mean(&prior.iter().map(|c| c.volume).collect::<Vec<_>>());
        if ma <= 0.0 {
            return (0.0, 0.0);
        }
        let relative = ((last.volume - ma) / ma).clamp(-1.0, 1.0);
        let body = last.close - last.open;
        let score = if body == 0.0 {
            0.0
        } else {
            body.signum() * relative.max(0.0)
        };
        (score, relative)
    }

    /// Average true range over the configured period, for the ATR stop
    /// policy. None when the window cannot cover the period.
    pub fn atr(&self, window: &[Candle]) -> Option<f64> {
        let period = self.cfg.atr_period;
        if window.len() < period + 1 {
            return None;
        }
        let tail = &window[window.len() - period - 1..];
        let mut sum = 0.0;
        for pair in tail.windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let tr = (cur.high - cur.low)
                .max((cur.high - prev.close).abs())
                .max((cur.low - prev.close).abs());
            sum += tr;
        }
        Some(sum / period as f64)
    }
}

/// RSI extremes map linearly onto [-1, 1]: RSI 0 is maximal bullish
/// exhaustion (+1), RSI 100 maximal bearish (-1), the 30-70 band is flat.
pub fn normalize_rsi(rsi: f64) -> f64 {
    if rsi < 30.0 {
        ((30.0 - rsi) / 30.0).clamp(0.0, 1.0)
    } else if rsi > 70.0 {
        (-(rsi - 70.0) / 30.0).clamp(-1.0, 0.0)
    } else {
        0.0
    }
}

/// RSI with Wilder's smoothing seeded from the first `period` deltas.
fn wilder_rsi(closes: &[f64], period: usize) -> f64 {
    debug_assert!(closes.len() > period);
    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;
    for pair in closes[..=period].windows(2) {
        let delta = pair[1] - pair[0];
        if delta >= 0.0 {
            gain_sum += delta;
        } else {
            loss_sum -= delta;
        }
    }
    let mut avg_gain = gain_sum / period as f64;
    let mut avg_loss = loss_sum / period as f64;

    for pair in closes[period..].windows(2) {
        let delta = pair[1] - pair[0];
        let (gain, loss) = if delta >= 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// MACD histogram series (macd line minus its EMA signal line), aligned to
/// the tail of the input.
fn macd_histogram_series(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Vec<f64> {
    let ema_fast = ema_series(closes, fast);
    let ema_slow = ema_series(closes, slow);
    if ema_slow.is_empty() {
        return Vec::new();
    }
    // Both series are tail-aligned with the input; intersect them.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_slow
        .iter()
        .enumerate()
        .map(|(i, s)| ema_fast[i + offset] - s)
        .collect();
    let signal_line = ema_series(&macd_line, signal);
    if signal_line.is_empty() {
        return Vec::new();
    }
    let offset = macd_line.len() - signal_line.len();
    signal_line
        .iter()
        .enumerate()
        .map(|(i, s)| macd_line[i + offset] - s)
        .collect()
}

/// EMA series seeded with the SMA of the first `period` values; the
/// result is tail-aligned (first element corresponds to input index
/// `period - 1`). Empty when the input is shorter than the period.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < period || period == 0 {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema = mean(&values[..period]);
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(ema);
    for v in &values[period..] {
        ema = v * k + ema * (1.0 - k);
        out.push(ema);
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::{Candle, Instrument, Timeframe};
    use chrono::{Duration, TimeZone, Utc};

    /// Build an hourly candle series from close prices; volume defaults
    /// flat at 1000 unless overridden.
    pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i == 0 { close } else { closes[i - 1] };
                Candle {
                    open_time: base + Duration::hours(i as i64),
                    instrument: Instrument::EurUsd,
                    timeframe: Timeframe::Hour1,
                    open,
                    high: open.max(close) * 1.0005,
                    low: open.min(close) * 0.9995,
                    close,
                    volume: 1000.0,
                }
            })
            .collect()
    }

    /// A gently oscillating series long enough for every indicator.
    pub fn oscillating_series(len: usize) -> Vec<Candle> {
        let closes: Vec<f64> = (0..len)
            .map(|i| 1.10 + 0.004 * ((i as f64) * 0.35).sin())
            .collect();
        candles_from_closes(&closes)
    }
}
