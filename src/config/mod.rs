//! Configuration management for ConfluxBot
//!
//! Loads from YAML files + environment variables via .env. Every numeric
//! threshold the engine enforces lives here as a validated default; a
//! reconfigure replaces the whole value or none of it.

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::EngineError;
use crate::types::IndicatorKind;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub indicators: IndicatorConfig,
    pub confluence: ConfluenceConfig,
    pub risk: RiskConfig,
    pub cadence: CadenceConfig,
    pub adaptation: AdaptationConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Bot version tag for logging
    pub tag: String,
    /// Instruments to monitor
    pub instruments: Vec<String>,
    /// Timeframes to score (15m, 1h, 4h, 1d)
    pub timeframes: Vec<String>,
    /// Emit logs as JSON
    pub json_logs: bool,
    /// Optional YAML file defining the variant weight set
    #[serde(default)]
    pub variants_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorConfig {
    /// RSI period
    pub rsi_period: usize,
    /// MACD fast period
    pub macd_fast: usize,
    /// MACD slow period
    pub macd_slow: usize,
    /// MACD signal period
    pub macd_signal: usize,
    /// Lookback for the rolling max |histogram| normalizer
    pub macd_norm_lookback: usize,
    /// Bollinger Bands period
    pub bb_period: usize,
    /// Bollinger Bands standard-deviation multiplier
    pub bb_mult: f64,
    /// Support/resistance lookback window
    pub sr_lookback: usize,
    /// Fibonacci swing lookback window
    pub fib_lookback: usize,
    /// Fraction of the swing range treated as "approaching" a fib level
    pub fib_tolerance: f64,
    /// Volume moving-average period
    pub volume_period: usize,
    /// ATR period (used by the ATR stop policy)
    pub atr_period: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfluenceConfig {
    /// Minimum |composite| to qualify a candle (inclusive)
    pub threshold: f64,
}

/// Where the entry price of a signal comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPolicy {
    /// Enter at the close of the triggering candle
    CandleClose,
    /// Defer to the open of the next (confirmation) candle
    ConfirmationOpen,
}

/// How the stop distance is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    FixedPips,
    AtrMultiple,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    pub entry_policy: EntryPolicy,
    pub stop_mode: StopMode,
    /// Stop distance in pips when stop_mode = fixed_pips
    pub stop_pips: f64,
    /// ATR multiplier when stop_mode = atr_multiple
    pub atr_multiple: f64,
    /// Reward/risk floor every emitted signal must satisfy
    pub min_risk_reward: f64,
    /// Fraction of account risked per trade before the size cap
    pub account_risk_pct: f64,
    /// Hard cap on position_size_pct
    pub max_risk_per_trade: f64,
}

/// Whether the daily cap counts per instrument or across all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapScope {
    Global,
    PerInstrument,
}

/// Which clock defines the daily reset boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DailyBoundary {
    Utc,
    FixedOffset,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CadenceConfig {
    /// Maximum primary signals per day for the configured scope
    pub max_daily_signals: u32,
    pub cap_scope: CapScope,
    pub daily_boundary: DailyBoundary,
    /// Hours east of UTC when daily_boundary = fixed_offset
    pub boundary_offset_hours: i32,
    /// Delay before the secondary-signal check fires
    pub secondary_delay_secs: u64,
    /// Gate forex/metal primaries to London + New York hours
    pub session_filter: bool,
}

/// How the adaptation controller picks the next candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    RoundRobin,
    WinRate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdaptationConfig {
    /// Consecutive no-signal days before a switch is attempted
    pub no_signal_threshold_days: u32,
    /// Backtest win rate a candidate must reach to be promoted
    pub min_win_rate: f64,
    /// Days a rejected candidate stays blacklisted
    pub blacklist_cooldown_days: i64,
    /// Trailing candles replayed per instrument in the gating backtest
    pub backtest_window_candles: usize,
    /// Bars a simulated trade may run before horizon expiry
    pub backtest_horizon_candles: usize,
    /// Minimum simulated trades for a backtest verdict
    pub min_backtest_trades: usize,
    pub selection: SelectionMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayConfig {
    /// Optional JSON candle file replayed through the engine at startup
    #[serde(default)]
    pub file: Option<String>,
}

/// The sections the engine itself consumes
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub indicators: IndicatorConfig,
    pub confluence: ConfluenceConfig,
    pub risk: RiskConfig,
    pub cadence: CadenceConfig,
    pub adaptation: AdaptationConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default(
                "bot.instruments",
                vec!["EURUSD", "GBPUSD", "USDJPY", "XAUUSD", "BTCUSDT", "ETHUSDT"],
            )?
            .set_default("bot.timeframes", vec!["1h"])?
            .set_default("bot.json_logs", false)?
            // Indicator defaults
            .set_default("indicators.rsi_period", 14)?
            .set_default("indicators.macd_fast", 12)?
            .set_default("indicators.macd_slow", 26)?
            .set_default("indicators.macd_signal", 9)?
            .set_default("indicators.macd_norm_lookback", 30)?
            .set_default("indicators.bb_period", 20)?
            .set_default("indicators.bb_mult", 2.0)?
            .set_default("indicators.sr_lookback", 50)?
            .set_default("indicators.fib_lookback", 50)?
            .set_default("indicators.fib_tolerance", 0.15)?
            .set_default("indicators.volume_period", 20)?
            .set_default("indicators.atr_period", 14)?
            // Confluence defaults
            .set_default("confluence.threshold", 0.70)?
            // Risk defaults
            .set_default("risk.entry_policy", "candle_close")?
            .set_default("risk.stop_mode", "fixed_pips")?
            .set_default("risk.stop_pips", 30.0)?
            .set_default("risk.atr_multiple", 1.5)?
            .set_default("risk.min_risk_reward", 2.5)?
            .set_default("risk.account_risk_pct", 0.01)?
            .set_default("risk.max_risk_per_trade", 0.02)?
            // Cadence defaults
            .set_default("cadence.max_daily_signals", 3)?
            .set_default("cadence.cap_scope", "global")?
            .set_default("cadence.daily_boundary", "utc")?
            .set_default("cadence.boundary_offset_hours", 0)?
            .set_default("cadence.secondary_delay_secs", 4 * 3600)?
            .set_default("cadence.session_filter", true)?
            // Adaptation defaults
            .set_default("adaptation.no_signal_threshold_days", 3)?
            .set_default("adaptation.min_win_rate", 0.60)?
            .set_default("adaptation.blacklist_cooldown_days", 7)?
            .set_default("adaptation.backtest_window_candles", 500)?
            .set_default("adaptation.backtest_horizon_candles", 48)?
            .set_default("adaptation.min_backtest_trades", 5)?
            .set_default("adaptation.selection", "round_robin")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CONFLUX_*)
            .add_source(Environment::with_prefix("CONFLUX").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.engine_config().validate()?;

        Ok(app_config)
    }

    /// Clone the engine-facing sections
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            indicators: self.indicators.clone(),
            confluence: self.confluence.clone(),
            risk: self.risk.clone(),
            cadence: self.cadence.clone(),
            adaptation: self.adaptation.clone(),
        }
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "bot={} instruments={:?} timeframes={:?} threshold={:.2} rr_floor={:.1} cap={}/day",
            self.bot.tag,
            self.bot.instruments,
            self.bot.timeframes,
            self.confluence.threshold,
            self.risk.min_risk_reward,
            self.cadence.max_daily_signals,
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

impl IndicatorConfig {
    /// Shortest window the bank accepts; anything less is DataInsufficient.
    pub fn min_lookback(&self) -> usize {
        let macd_need = self.macd_slow + self.macd_signal;
        (self.rsi_period + 1)
            .max(macd_need)
            .max(self.bb_period)
            .max(self.sr_lookback)
            .max(self.fib_lookback)
            .max(self.volume_period + 1)
            .max(self.atr_period + 1)
    }
}

impl EngineConfig {
    /// Reject out-of-range values before anything is applied.
    pub fn validate(&self) -> Result<(), EngineError> {
        let ind = &self.indicators;
        if ind.rsi_period < 2 || ind.bb_period < 2 || ind.volume_period < 2 || ind.atr_period < 2 {
            return Err(EngineError::ConfigValidation(
                "indicator periods must be >= 2".into(),
            ));
        }
        if ind.macd_fast < 2 || ind.macd_fast >= ind.macd_slow || ind.macd_signal < 2 {
            return Err(EngineError::ConfigValidation(
                "macd periods must satisfy 2 <= fast < slow, signal >= 2".into(),
            ));
        }
        if ind.macd_norm_lookback < 2 || ind.sr_lookback < 2 || ind.fib_lookback < 2 {
            return Err(EngineError::ConfigValidation(
                "lookback windows must be >= 2".into(),
            ));
        }
        if !(ind.fib_tolerance > 0.0 && ind.fib_tolerance <= 1.0) {
            return Err(EngineError::ConfigValidation(format!(
                "fib_tolerance {} outside (0, 1]",
                ind.fib_tolerance
            )));
        }
        if !(ind.bb_mult > 0.0) {
            return Err(EngineError::ConfigValidation(
                "bb_mult must be positive".into(),
            ));
        }
        if !(self.confluence.threshold > 0.0 && self.confluence.threshold <= 1.0) {
            return Err(EngineError::ConfigValidation(format!(
                "confluence threshold {} outside (0, 1]",
                self.confluence.threshold
            )));
        }
        let risk = &self.risk;
        if !(risk.min_risk_reward > 0.0) {
            return Err(EngineError::ConfigValidation(
                "min_risk_reward must be positive".into(),
            ));
        }
        if !(risk.stop_pips > 0.0) || !(risk.atr_multiple > 0.0) {
            return Err(EngineError::ConfigValidation(
                "stop distances must be positive".into(),
            ));
        }
        if !(risk.account_risk_pct > 0.0 && risk.account_risk_pct <= 1.0)
            || !(risk.max_risk_per_trade > 0.0 && risk.max_risk_per_trade <= 1.0)
        {
            return Err(EngineError::ConfigValidation(
                "risk percentages must lie in (0, 1]".into(),
            ));
        }
        let cadence = &self.cadence;
        if cadence.max_daily_signals == 0 {
            return Err(EngineError::ConfigValidation(
                "max_daily_signals must be >= 1".into(),
            ));
        }
        if cadence.secondary_delay_secs == 0 {
            return Err(EngineError::ConfigValidation(
                "secondary_delay_secs must be positive".into(),
            ));
        }
        if cadence.daily_boundary == DailyBoundary::FixedOffset
            && !(-12..=14).contains(&cadence.boundary_offset_hours)
        {
            return Err(EngineError::ConfigValidation(format!(
                "boundary_offset_hours {} outside [-12, 14]",
                cadence.boundary_offset_hours
            )));
        }
        let adapt = &self.adaptation;
        if adapt.no_signal_threshold_days == 0 {
            return Err(EngineError::ConfigValidation(
                "no_signal_threshold_days must be >= 1".into(),
            ));
        }
        if !(adapt.min_win_rate > 0.0 && adapt.min_win_rate <= 1.0) {
            return Err(EngineError::ConfigValidation(format!(
                "min_win_rate {} outside (0, 1]",
                adapt.min_win_rate
            )));
        }
        if adapt.blacklist_cooldown_days < 1 {
            return Err(EngineError::ConfigValidation(
                "blacklist_cooldown_days must be >= 1".into(),
            ));
        }
        if adapt.backtest_window_candles <= self.indicators.min_lookback() {
            return Err(EngineError::ConfigValidation(format!(
                "backtest_window_candles {} must exceed the indicator lookback {}",
                adapt.backtest_window_candles,
                self.indicators.min_lookback()
            )));
        }
        if adapt.backtest_horizon_candles == 0 || adapt.min_backtest_trades == 0 {
            return Err(EngineError::ConfigValidation(
                "backtest horizon and minimum trades must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            indicators: IndicatorConfig {
                rsi_period: 14,
                macd_fast: 12,
                macd_slow: 26,
                macd_signal: 9,
                macd_norm_lookback: 30,
                bb_period: 20,
                bb_mult: 2.0,
                sr_lookback: 50,
                fib_lookback: 50,
                fib_tolerance: 0.15,
                volume_period: 20,
                atr_period: 14,
            },
            confluence: ConfluenceConfig { threshold: 0.70 },
            risk: RiskConfig {
                entry_policy: EntryPolicy::CandleClose,
                stop_mode: StopMode::FixedPips,
                stop_pips: 30.0,
                atr_multiple: 1.5,
                min_risk_reward: 2.5,
                account_risk_pct: 0.01,
                max_risk_per_trade: 0.02,
            },
            cadence: CadenceConfig {
                max_daily_signals: 3,
                cap_scope: CapScope::Global,
                daily_boundary: DailyBoundary::Utc,
                boundary_offset_hours: 0,
                secondary_delay_secs: 4 * 3600,
                session_filter: true,
            },
            adaptation: AdaptationConfig {
                no_signal_threshold_days: 3,
                min_win_rate: 0.60,
                blacklist_cooldown_days: 7,
                backtest_window_candles: 500,
                backtest_horizon_candles: 48,
                min_backtest_trades: 5,
                selection: SelectionMode::RoundRobin,
            },
        }
    }
}

/// YAML document shape for a variant weight set:
///
/// ```yaml
/// variants:
///   balanced:
///     rsi: 0.15
///     macd: 0.20
///     bollinger: 0.15
///     support_resistance: 0.25
///     fibonacci: 0.15
///     volume: 0.10
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantSetFile {
    pub variants: BTreeMap<String, BTreeMap<String, f64>>,
}

impl VariantSetFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read variants file {}", path.as_ref().display())
        })?;
        let parsed: VariantSetFile =
            serde_yaml::from_str(&raw).context("Failed to parse variants YAML")?;
        Ok(parsed)
    }

    /// Resolve indicator names, rejecting unknown keys up front.
    pub fn resolved(
        &self,
    ) -> Result<Vec<(String, BTreeMap<IndicatorKind, f64>)>, EngineError> {
        let mut out = Vec::with_capacity(self.variants.len());
        for (variant_id, weights) in &self.variants {
            let mut resolved = BTreeMap::new();
            for (name, weight) in weights {
                let kind = IndicatorKind::parse(name).ok_or_else(|| {
                    EngineError::ConfigValidation(format!(
                        "variant {variant_id} references unknown indicator {name}"
                    ))
                })?;
                resolved.insert(kind, *weight);
            }
            out.push((variant_id.clone(), resolved));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_engine_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.confluence.threshold = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(EngineError::ConfigValidation(_))
        ));
    }

    #[test]
    fn test_macd_periods_checked() {
        let mut cfg = EngineConfig::default();
        cfg.indicators.macd_fast = 26;
        cfg.indicators.macd_slow = 12;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_min_lookback_covers_all_indicators() {
        let cfg = EngineConfig::default();
        let min = cfg.indicators.min_lookback();
        assert!(min >= cfg.indicators.sr_lookback);
        assert!(min >= cfg.indicators.macd_slow + cfg.indicators.macd_signal);
    }

    #[test]
    fn test_variant_file_rejects_unknown_indicator() {
        let yaml = "variants:\n  weird:\n    rsi: 0.5\n    moonphase: 0.5\n";
        let parsed: VariantSetFile = serde_yaml::from_str(yaml).unwrap();
        assert!(parsed.resolved().is_err());
    }

    #[test]
    fn test_variant_file_parses() {
        let yaml = "variants:\n  balanced:\n    rsi: 0.5\n    macd: 0.5\n";
        let parsed: VariantSetFile = serde_yaml::from_str(yaml).unwrap();
        let resolved = parsed.resolved().unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].0, "balanced");
        assert_eq!(resolved[0].1[&IndicatorKind::Rsi], 0.5);
    }
}
