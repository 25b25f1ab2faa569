//! Candle Store - Validated, append-only candle history
//!
//! Keeps a bounded rolling window of completed candles per
//! (instrument, timeframe). Candles with NaN fields or out-of-order
//! timestamps are rejected here so nothing downstream has to re-check.

use std::collections::{HashMap, VecDeque};

use crate::error::{EngineError, EngineResult};
use crate::types::{Candle, Instrument, Timeframe};

pub struct CandleStore {
    /// Completed candles per (instrument, timeframe)
    history: HashMap<(Instrument, Timeframe), VecDeque<Candle>>,
    /// Maximum candles to keep per stream
    max_history: usize,
}

impl CandleStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: HashMap::new(),
            max_history,
        }
    }

    /// Append a candle, enforcing monotonic timestamps per stream.
    /// Equal timestamps replace the prior candle (late revision of the
    /// same bar); earlier timestamps are rejected.
    pub fn push(&mut self, candle: Candle) -> EngineResult<()> {
        if candle.has_invalid_values() {
            return Err(EngineError::InvalidInput(format!(
                "{} {} candle at {} has non-finite OHLCV",
                candle.instrument, candle.timeframe, candle.open_time
            )));
        }
        let key = (candle.instrument, candle.timeframe);
        let stream = self.history.entry(key).or_insert_with(VecDeque::new);

        if let Some(last) = stream.back() {
            if candle.open_time < last.open_time {
                return Err(EngineError::InvalidInput(format!(
                    "{} {} candle at {} is older than stream head {}",
                    candle.instrument, candle.timeframe, candle.open_time, last.open_time
                )));
            }
            if candle.open_time == last.open_time {
                stream.pop_back();
            }
        }

        stream.push_back(candle);
        while stream.len() > self.max_history {
            stream.pop_front();
        }
        Ok(())
    }

    /// Seed the store with historical candles (e.g. replayed from disk)
    pub fn seed(&mut self, candles: Vec<Candle>) -> usize {
        let mut accepted = 0;
        for candle in candles {
            match self.push(candle) {
                Ok(()) => accepted += 1,
                Err(err) => tracing::warn!(error = %err, "seed candle dropped"),
            }
        }
        accepted
    }

    /// Full window for a stream, oldest first
    pub fn window(&self, instrument: Instrument, timeframe: Timeframe) -> Vec<Candle> {
        self.history
            .get(&(instrument, timeframe))
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Last n candles for a stream, oldest first
    pub fn last_n(&self, instrument: Instrument, timeframe: Timeframe, n: usize) -> Vec<Candle> {
        self.history
            .get(&(instrument, timeframe))
            .map(|h| {
                let skip = h.len().saturating_sub(n);
                h.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self, instrument: Instrument, timeframe: Timeframe) -> usize {
        self.history
            .get(&(instrument, timeframe))
            .map(|h| h.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.history.values().all(|h| h.is_empty())
    }

    /// Streams currently holding candles
    pub fn streams(&self) -> Vec<(Instrument, Timeframe)> {
        let mut keys: Vec<_> = self.history.keys().copied().collect();
        keys.sort();
        keys
    }
}

impl Default for CandleStore {
    fn default() -> Self {
        Self::new(1000)
    }
}
