//! Strategy Registry - Named weight-vector variants and their records
//!
//! A variant is one weighting of the indicator bank: a validated
//! WeightVector plus a lifecycle state and a performance window filled in
//! by the adaptation controller as outcomes arrive. Vectors are immutable
//! once registered; an update replaces the whole struct.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::types::{IndicatorKind, TradeResult};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// One named weighting of the indicator bank. Weights lie in [0, 1] and
/// sum to 1 within tolerance; both are enforced at construction and the
/// struct is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    variant_id: String,
    weights: BTreeMap<IndicatorKind, f64>,
}

impl WeightVector {
    pub fn new(
        variant_id: impl Into<String>,
        weights: BTreeMap<IndicatorKind, f64>,
    ) -> EngineResult<Self> {
        let variant_id = variant_id.into();
        if variant_id.is_empty() {
            return Err(EngineError::ConfigValidation(
                "variant_id must not be empty".into(),
            ));
        }
        if weights.is_empty() {
            return Err(EngineError::ConfigValidation(format!(
                "variant {variant_id} has no weights"
            )));
        }
        for (kind, w) in &weights {
            if !w.is_finite() || *w < 0.0 || *w > 1.0 {
                return Err(EngineError::ConfigValidation(format!(
                    "variant {variant_id} weight for {kind} is {w}, outside [0, 1]"
                )));
            }
        }
        let sum: f64 = weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(EngineError::ConfigValidation(format!(
                "variant {variant_id} weights sum to {sum}, expected 1 ± {WEIGHT_SUM_TOLERANCE}"
            )));
        }
        Ok(Self {
            variant_id,
            weights,
        })
    }

    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    pub fn weight(&self, kind: IndicatorKind) -> Option<f64> {
        self.weights.get(&kind).copied()
    }

    /// Indicators this vector scores over, in stable order
    pub fn indicators(&self) -> impl Iterator<Item = (IndicatorKind, f64)> + '_ {
        self.weights.iter().map(|(k, w)| (*k, *w))
    }
}

/// Variant lifecycle as seen by the adaptation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantState {
    Active,
    Candidate,
    Retired,
    Blacklisted,
}

/// Realized performance of one variant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceWindow {
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_no_signal_days: u32,
}

impl PerformanceWindow {
    pub fn record(&mut self, result: TradeResult) {
        self.trades += 1;
        match result {
            TradeResult::Win => self.wins += 1,
            TradeResult::Loss => self.losses += 1,
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.trades == 0 {
            0.0
        } else {
            self.wins as f64 / self.trades as f64
        }
    }
}

struct VariantEntry {
    vector: Arc<WeightVector>,
    state: VariantState,
    performance: PerformanceWindow,
}

/// Holds every registered variant. Reads hand out Arc snapshots so a
/// replace never tears an in-flight scoring pass.
pub struct StrategyRegistry {
    variants: BTreeMap<String, VariantEntry>,
}

impl StrategyRegistry {
    pub fn new(vectors: Vec<WeightVector>) -> EngineResult<Self> {
        if vectors.is_empty() {
            return Err(EngineError::ConfigValidation(
                "registry needs at least one variant".into(),
            ));
        }
        let mut variants = BTreeMap::new();
        for vector in vectors {
            let id = vector.variant_id().to_string();
            if variants
                .insert(
                    id.clone(),
                    VariantEntry {
                        vector: Arc::new(vector),
                        state: VariantState::Retired,
                        performance: PerformanceWindow::default(),
                    },
                )
                .is_some()
            {
                return Err(EngineError::ConfigValidation(format!(
                    "duplicate variant id {id}"
                )));
            }
        }
        Ok(Self { variants })
    }

    /// The default built-in variant set: one balanced profile and two
    /// leaning ones, all over the full bank.
    pub fn default_variants() -> Vec<WeightVector> {
        let make = |id: &str, weights: [f64; 6]| {
            let map: BTreeMap<IndicatorKind, f64> = IndicatorKind::ALL
                .iter()
                .copied()
                .zip(weights.iter().copied())
                .collect();
            WeightVector::new(id, map).expect("built-in variant weights are normalized")
        };
        vec![
            // rsi, macd, bollinger, support_resistance, fibonacci, volume
            make("balanced", [0.15, 0.20, 0.15, 0.25, 0.15, 0.10]),
            make("trend_rider", [0.10, 0.30, 0.05, 0.20, 0.10, 0.25]),
            make("mean_reverter", [0.25, 0.10, 0.30, 0.20, 0.10, 0.05]),
        ]
    }

    pub fn contains(&self, variant_id: &str) -> bool {
        self.variants.contains_key(variant_id)
    }

    pub fn vector(&self, variant_id: &str) -> EngineResult<Arc<WeightVector>> {
        self.variants
            .get(variant_id)
            .map(|e| Arc::clone(&e.vector))
            .ok_or_else(|| EngineError::UnknownVariant(variant_id.to_string()))
    }

    pub fn state(&self, variant_id: &str) -> EngineResult<VariantState> {
        self.variants
            .get(variant_id)
            .map(|e| e.state)
            .ok_or_else(|| EngineError::UnknownVariant(variant_id.to_string()))
    }

    pub fn set_state(&mut self, variant_id: &str, state: VariantState) -> EngineResult<()> {
        let entry = self
            .variants
            .get_mut(variant_id)
            .ok_or_else(|| EngineError::UnknownVariant(variant_id.to_string()))?;
        entry.state = state;
        Ok(())
    }

    pub fn performance(&self, variant_id: &str) -> EngineResult<&PerformanceWindow> {
        self.variants
            .get(variant_id)
            .map(|e| &e.performance)
            .ok_or_else(|| EngineError::UnknownVariant(variant_id.to_string()))
    }

    pub fn performance_mut(
        &mut self,
        variant_id: &str,
    ) -> EngineResult<&mut PerformanceWindow> {
        self.variants
            .get_mut(variant_id)
            .map(|e| &mut e.performance)
            .ok_or_else(|| EngineError::UnknownVariant(variant_id.to_string()))
    }

    /// Variant ids in stable (lexicographic) order
    pub fn variant_ids(&self) -> Vec<String> {
        self.variants.keys().cloned().collect()
    }

    /// Snapshot of every variant's performance window
    pub fn performance_snapshot(&self) -> BTreeMap<String, PerformanceWindow> {
        self.variants
            .iter()
            .map(|(id, e)| (id.clone(), e.performance.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights_of(pairs: &[(IndicatorKind, f64)]) -> BTreeMap<IndicatorKind, f64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_weight_vector_sum_enforced() {
        let bad = WeightVector::new(
            "bad",
            weights_of(&[(IndicatorKind::Rsi, 0.5), (IndicatorKind::Macd, 0.6)]),
        );
        assert!(matches!(bad, Err(EngineError::ConfigValidation(_))));

        let good = WeightVector::new(
            "good",
            weights_of(&[(IndicatorKind::Rsi, 0.5), (IndicatorKind::Macd, 0.5)]),
        );
        assert!(good.is_ok());
    }

    #[test]
    fn test_weight_vector_tolerance() {
        // Off by less than 1e-6 passes
        let near = WeightVector::new(
            "near",
            weights_of(&[
                (IndicatorKind::Rsi, 0.5),
                (IndicatorKind::Macd, 0.5 + 5e-7),
            ]),
        );
        assert!(near.is_ok());
    }

    #[test]
    fn test_weight_out_of_range_rejected() {
        let bad = WeightVector::new(
            "bad",
            weights_of(&[(IndicatorKind::Rsi, 1.5), (IndicatorKind::Macd, -0.5)]),
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_default_variants_all_valid() {
        let variants = StrategyRegistry::default_variants();
        assert_eq!(variants.len(), 3);
        for v in &variants {
            let sum: f64 = v.indicators().map(|(_, w)| w).sum();
            assert!((sum - 1.0).abs() <= 1e-6, "{} sums to {}", v.variant_id(), sum);
        }
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let v = WeightVector::new(
            "dup",
            weights_of(&[(IndicatorKind::Rsi, 1.0)]),
        )
        .unwrap();
        let result = StrategyRegistry::new(vec![v.clone(), v]);
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_state_transitions() {
        let mut registry = StrategyRegistry::new(StrategyRegistry::default_variants()).unwrap();
        assert_eq!(registry.state("balanced").unwrap(), VariantState::Retired);
        registry
            .set_state("balanced", VariantState::Active)
            .unwrap();
        assert_eq!(registry.state("balanced").unwrap(), VariantState::Active);
        assert!(registry.set_state("missing", VariantState::Active).is_err());
    }

    #[test]
    fn test_performance_window_win_rate() {
        let mut window = PerformanceWindow::default();
        assert_eq!(window.win_rate(), 0.0);
        window.record(TradeResult::Win);
        window.record(TradeResult::Win);
        window.record(TradeResult::Loss);
        assert!((window.win_rate() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(window.trades, 3);
    }

    #[test]
    fn test_vector_serde_roundtrip_identical() {
        let vector = StrategyRegistry::default_variants().remove(0);
        let json = serde_json::to_string(&vector).unwrap();
        let reloaded: WeightVector = serde_json::from_str(&json).unwrap();
        assert_eq!(vector, reloaded);
    }
}
