//! Confluence Scorer - Weighted composite of the indicator bank
//!
//! Combines per-indicator scores into one composite via the active weight
//! vector. A candle only qualifies for signal composition when |composite|
//! clears the confluence threshold (inclusive). The scorer is fail-closed:
//! if the vector names an indicator with no reading, the candle is
//! disqualified rather than scored partially.

use chrono::{DateTime, Utc};

use crate::config::ConfluenceConfig;
use crate::strategy::WeightVector;
use crate::types::{CompositeScore, Direction, IndicatorReading, Instrument, Timeframe};

pub struct ConfluenceScorer {
    threshold: f64,
}

impl ConfluenceScorer {
    pub fn new(cfg: &ConfluenceConfig) -> Self {
        Self {
            threshold: cfg.threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compose the weighted score for one candle. Returns None when any
    /// indicator the vector weights is missing from the readings, or when
    /// the composite is exactly zero (no direction to trade).
    pub fn compose(
        &self,
        instrument: Instrument,
        timeframe: Timeframe,
        ts: DateTime<Utc>,
        readings: &[IndicatorReading],
        vector: &WeightVector,
    ) -> Option<CompositeScore> {
        let mut composite = 0.0;
        for (kind, weight) in vector.indicators() {
            let reading = readings.iter().find(|r| r.indicator == kind)?;
            composite += weight * reading.score;
        }
        // |Σ w·s| <= Σ w·|s| <= Σ w = 1
        debug_assert!(composite.abs() <= 1.0 + 1e-9);

        let direction = Direction::from_score(composite)?;
        Some(CompositeScore {
            instrument,
            timeframe,
            ts,
            value: composite,
            direction,
            variant_id: vector.variant_id().to_string(),
        })
    }

    /// Inclusive threshold check
    pub fn qualifies(&self, composite: &CompositeScore) -> bool {
        composite.value.abs() >= self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IndicatorKind;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn reading(kind: IndicatorKind, score: f64) -> IndicatorReading {
        IndicatorReading {
            indicator: kind,
            score,
            raw_value: 0.0,
            computed_at: Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap(),
        }
    }

    fn balanced_vector() -> WeightVector {
        let weights: BTreeMap<IndicatorKind, f64> = [
            (IndicatorKind::Rsi, 0.15),
            (IndicatorKind::Macd, 0.20),
            (IndicatorKind::Bollinger, 0.15),
            (IndicatorKind::SupportResistance, 0.25),
            (IndicatorKind::Fibonacci, 0.15),
            (IndicatorKind::Volume, 0.10),
        ]
        .into_iter()
        .collect();
        WeightVector::new("balanced", weights).unwrap()
    }

    fn scorer() -> ConfluenceScorer {
        ConfluenceScorer::new(&ConfluenceConfig { threshold: 0.70 })
    }

    #[test]
    fn test_worked_example_unanimous_but_below_floor() {
        // RSI 25 -> 0.1667, MACD 0.5, BB 0.3, S/R 0.8, Fib 0.4, Vol 0.6:
        // every indicator bullish, yet the weighted sum stays conservative.
        let readings = vec![
            reading(IndicatorKind::Rsi, 5.0 / 30.0),
            reading(IndicatorKind::Macd, 0.5),
            reading(IndicatorKind::Bollinger, 0.3),
            reading(IndicatorKind::SupportResistance, 0.8),
            reading(IndicatorKind::Fibonacci, 0.4),
            reading(IndicatorKind::Volume, 0.6),
        ];
        let scorer = scorer();
        let ts = readings[0].computed_at;
        let composite = scorer
            .compose(
                Instrument::EurUsd,
                Timeframe::Hour1,
                ts,
                &readings,
                &balanced_vector(),
            )
            .unwrap();
        assert!((composite.value - 0.490).abs() < 1e-3, "got {}", composite.value);
        assert_eq!(composite.direction, Direction::Long);
        assert!(!scorer.qualifies(&composite));
    }

    #[test]
    fn test_composite_is_linear_in_scores() {
        let scores = [0.9, -0.4, 0.2, 0.7, -0.1, 0.5];
        let readings: Vec<_> = IndicatorKind::ALL
            .iter()
            .zip(scores)
            .map(|(k, s)| reading(*k, s))
            .collect();
        let vector = balanced_vector();
        let expected: f64 = vector
            .indicators()
            .map(|(k, w)| w * scores[IndicatorKind::ALL.iter().position(|x| *x == k).unwrap()])
            .sum();
        let ts = readings[0].computed_at;
        let composite = scorer()
            .compose(Instrument::EurUsd, Timeframe::Hour1, ts, &readings, &vector)
            .unwrap();
        assert!((composite.value - expected).abs() < 1e-12);
        assert!(composite.value.abs() <= 1.0);
    }

    #[test]
    fn test_missing_reading_fails_closed() {
        let readings: Vec<_> = IndicatorKind::ALL[..5]
            .iter()
            .map(|k| reading(*k, 0.9))
            .collect();
        let ts = readings[0].computed_at;
        let result = scorer().compose(
            Instrument::EurUsd,
            Timeframe::Hour1,
            ts,
            &readings,
            &balanced_vector(),
        );
        assert!(result.is_none(), "missing volume reading must disqualify");
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // One-indicator vector makes the composite equal the score
        let weights: BTreeMap<IndicatorKind, f64> =
            [(IndicatorKind::Rsi, 1.0)].into_iter().collect();
        let vector = WeightVector::new("solo", weights).unwrap();
        let readings = vec![reading(IndicatorKind::Rsi, 0.70)];
        let ts = readings[0].computed_at;
        let scorer = scorer();
        let composite = scorer
            .compose(Instrument::EurUsd, Timeframe::Hour1, ts, &readings, &vector)
            .unwrap();
        assert!(scorer.qualifies(&composite));
    }

    #[test]
    fn test_bearish_composite_qualifies_on_magnitude() {
        let readings: Vec<_> = IndicatorKind::ALL
            .iter()
            .map(|k| reading(*k, -0.85))
            .collect();
        let ts = readings[0].computed_at;
        let scorer = scorer();
        let composite = scorer
            .compose(
                Instrument::GbpUsd,
                Timeframe::Hour1,
                ts,
                &readings,
                &balanced_vector(),
            )
            .unwrap();
        assert_eq!(composite.direction, Direction::Short);
        assert!(scorer.qualifies(&composite));
    }

    #[test]
    fn test_zero_composite_has_no_direction() {
        let readings: Vec<_> = IndicatorKind::ALL.iter().map(|k| reading(*k, 0.0)).collect();
        let ts = readings[0].computed_at;
        let result = scorer().compose(
            Instrument::EurUsd,
            Timeframe::Hour1,
            ts,
            &readings,
            &balanced_vector(),
        );
        assert!(result.is_none());
    }
}
