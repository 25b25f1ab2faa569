//! Swing-level analysis: support/resistance and Fibonacci retracement
//!
//! Both scores read the same swing structure: the extreme high and low of
//! a trailing window. Support/resistance measures proximity to either
//! extreme; Fibonacci measures proximity to the 38.2/50/61.8% retracement
//! levels of the most recent swing, signed toward the expected bounce.

use crate::types::Candle;

const FIB_RATIOS: [f64; 3] = [0.382, 0.5, 0.618];

/// Proximity to the nearest of {window low, window high}. Near support
/// scores bullish, near resistance bearish; strength decays linearly with
/// distance across the lookback range.
pub fn support_resistance_score(window: &[Candle], lookback: usize) -> (f64, f64) {
    let tail = trailing(window, lookback);
    let close = match tail.last() {
        Some(c) => c.close,
        None => return (0.0, 0.0),
    };
    let support = tail.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let resistance = tail.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let range = resistance - support;
    if range <= 0.0 {
        return (0.0, close);
    }

    let dist_support = (close - support).abs();
    let dist_resistance = (close - resistance).abs();
    // Equidistant resolves to support: hesitation reads bullish here only
    // because the level below is as close as the one above.
    let (sign, nearest, dist) = if dist_support <= dist_resistance {
        (1.0, support, dist_support)
    } else {
        (-1.0, resistance, dist_resistance)
    };
    let strength = (1.0 - dist / range).clamp(0.0, 1.0);
    (sign * strength, nearest)
}

/// Proximity to the nearest Fibonacci retracement level of the trailing
/// swing. The swing direction comes from the order of its extremes: a low
/// printed before the high reads as an up-swing, so a pullback into the
/// retracement band scores bullish (bounce with the trend), and inversely
/// for a down-swing. `tolerance` is the fraction of the swing range within
/// which a level counts as "being approached".
pub fn fibonacci_score(window: &[Candle], lookback: usize, tolerance: f64) -> (f64, f64) {
    let tail = trailing(window, lookback);
    let close = match tail.last() {
        Some(c) => c.close,
        None => return (0.0, 0.0),
    };

    let mut swing_high = f64::NEG_INFINITY;
    let mut swing_high_idx = 0usize;
    let mut swing_low = f64::INFINITY;
    let mut swing_low_idx = 0usize;
    for (i, candle) in tail.iter().enumerate() {
        if candle.high > swing_high {
            swing_high = candle.high;
            swing_high_idx = i;
        }
        if candle.low < swing_low {
            swing_low = candle.low;
            swing_low_idx = i;
        }
    }
    let range = swing_high - swing_low;
    if range <= 0.0 {
        return (0.0, close);
    }

    let up_swing = swing_low_idx < swing_high_idx;
    let mut nearest_level = 0.0;
    let mut nearest_dist = f64::INFINITY;
    for ratio in FIB_RATIOS {
        let level = if up_swing {
            swing_high - ratio * range
        } else {
            swing_low + ratio * range
        };
        let dist = (close - level).abs();
        if dist < nearest_dist {
            nearest_dist = dist;
            nearest_level = level;
        }
    }

    let band = tolerance * range;
    if band <= 0.0 {
        return (0.0, nearest_level);
    }
    let strength = (1.0 - nearest_dist / band).clamp(0.0, 1.0);
    let sign = if up_swing { 1.0 } else { -1.0 };
    (sign * strength, nearest_level)
}

fn trailing(window: &[Candle], lookback: usize) -> &[Candle] {
    let skip = window.len().saturating_sub(lookback);
    &window[skip..]
}
