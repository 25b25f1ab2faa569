//! Engine error taxonomy
//!
//! Everything here is recoverable: candles get dropped or skipped, signals
//! get rejected, adaptation gets deferred. Nothing in normal operation
//! terminates the process.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Rolling window shorter than the minimum indicator lookback;
    /// the candle is skipped for scoring, no partial readings.
    #[error("insufficient data: have {have} candles, need {need}")]
    DataInsufficient { have: usize, need: usize },

    /// Malformed candle (NaN fields or out-of-order timestamp); dropped.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Composed trade parameters failed risk policy; counted as attempted.
    #[error("signal rejected: {0}")]
    SignalRejected(String),

    /// Daily cap reached for the configured scope.
    #[error("daily signal cap reached ({count}/{cap})")]
    CadenceExceeded { count: u32, cap: u32 },

    /// Backtest sample too small to judge the candidate; retry next trigger.
    #[error("adaptation deferred: {0}")]
    AdaptationDeferred(String),

    /// Configuration rejected at construction; never applied partially.
    #[error("config validation failed: {0}")]
    ConfigValidation(String),

    /// Referenced variant is not registered.
    #[error("unknown variant: {0}")]
    UnknownVariant(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
