//! ConfluxBot Library
//!
//! Adaptive multi-indicator confluence engine: candles in, gated trade
//! signals out, with a feedback loop that re-tunes indicator weights from
//! realized outcomes.

pub mod adaptation;
pub mod backtest;
pub mod cadence;
pub mod composer;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod indicators;
pub mod scorer;
pub mod strategy;
pub mod types;
