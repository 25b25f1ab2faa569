//! Core types used throughout ConfluxBot
//!
//! Defines common data structures for candles, indicator readings,
//! signals and trade outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Market class an instrument belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketClass {
    Forex,
    Commodity,
    Crypto,
}

/// Supported trading instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Instrument {
    EurUsd,
    GbpUsd,
    UsdJpy,
    UsdChf,
    AudUsd,
    UsdCad,
    NzdUsd,
    XauUsd,
    BtcUsdt,
    EthUsdt,
}

impl Default for Instrument {
    fn default() -> Self {
        Instrument::EurUsd
    }
}

impl Instrument {
    /// Smallest standard price increment for the instrument class.
    /// JPY pairs quote to two decimals, gold to one, crypto to whole units.
    pub fn pip_size(&self) -> f64 {
        match self {
            Instrument::UsdJpy => 0.01,
            Instrument::XauUsd => 0.1,
            Instrument::BtcUsdt | Instrument::EthUsdt => 1.0,
            _ => 0.0001,
        }
    }

    pub fn market(&self) -> MarketClass {
        match self {
            Instrument::XauUsd => MarketClass::Commodity,
            Instrument::BtcUsdt | Instrument::EthUsdt => MarketClass::Crypto,
            _ => MarketClass::Forex,
        }
    }

    /// Parse from string (case-insensitive symbol, e.g. "EURUSD")
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EURUSD" => Some(Instrument::EurUsd),
            "GBPUSD" => Some(Instrument::GbpUsd),
            "USDJPY" => Some(Instrument::UsdJpy),
            "USDCHF" => Some(Instrument::UsdChf),
            "AUDUSD" => Some(Instrument::AudUsd),
            "USDCAD" => Some(Instrument::UsdCad),
            "NZDUSD" => Some(Instrument::NzdUsd),
            "XAUUSD" => Some(Instrument::XauUsd),
            "BTCUSDT" => Some(Instrument::BtcUsdt),
            "ETHUSDT" => Some(Instrument::EthUsdt),
            _ => None,
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Instrument::EurUsd => "EURUSD",
            Instrument::GbpUsd => "GBPUSD",
            Instrument::UsdJpy => "USDJPY",
            Instrument::UsdChf => "USDCHF",
            Instrument::AudUsd => "AUDUSD",
            Instrument::UsdCad => "USDCAD",
            Instrument::NzdUsd => "NZDUSD",
            Instrument::XauUsd => "XAUUSD",
            Instrument::BtcUsdt => "BTCUSDT",
            Instrument::EthUsdt => "ETHUSDT",
        };
        write!(f, "{}", s)
    }
}

/// Supported timeframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    Min15,
    Hour1,
    Hour4,
    Day1,
}

impl Default for Timeframe {
    fn default() -> Self {
        Timeframe::Hour1
    }
}

impl Timeframe {
    /// Get duration in seconds
    pub fn duration_secs(&self) -> u64 {
        match self {
            Timeframe::Min15 => 15 * 60,
            Timeframe::Hour1 => 60 * 60,
            Timeframe::Hour4 => 4 * 60 * 60,
            Timeframe::Day1 => 24 * 60 * 60,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "15m" | "15min" => Some(Timeframe::Min15),
            "1h" | "1hour" => Some(Timeframe::Hour1),
            "4h" | "4hour" => Some(Timeframe::Hour4),
            "1d" | "daily" => Some(Timeframe::Day1),
            _ => None,
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::Min15 => write!(f, "15m"),
            Timeframe::Hour1 => write!(f, "1h"),
            Timeframe::Hour4 => write!(f, "4h"),
            Timeframe::Day1 => write!(f, "1d"),
        }
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Direction implied by a score's sign; zero has no direction.
    pub fn from_score(score: f64) -> Option<Self> {
        if score > 0.0 {
            Some(Direction::Long)
        } else if score < 0.0 {
            Some(Direction::Short)
        } else {
            None
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Candlestick data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time (start of period)
    pub open_time: DateTime<Utc>,
    /// Instrument
    pub instrument: Instrument,
    /// Timeframe
    pub timeframe: Timeframe,
    /// Open price
    pub open: f64,
    /// High price
    pub high: f64,
    /// Low price
    pub low: f64,
    /// Close price
    pub close: f64,
    /// Volume in base units
    pub volume: f64,
}

impl Candle {
    /// True when any OHLCV field is NaN or non-finite
    pub fn has_invalid_values(&self) -> bool {
        ![self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Identifier of a technical indicator in the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Rsi,
    Macd,
    Bollinger,
    SupportResistance,
    Fibonacci,
    Volume,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 6] = [
        IndicatorKind::Rsi,
        IndicatorKind::Macd,
        IndicatorKind::Bollinger,
        IndicatorKind::SupportResistance,
        IndicatorKind::Fibonacci,
        IndicatorKind::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndicatorKind::Rsi => "rsi",
            IndicatorKind::Macd => "macd",
            IndicatorKind::Bollinger => "bollinger",
            IndicatorKind::SupportResistance => "support_resistance",
            IndicatorKind::Fibonacci => "fibonacci",
            IndicatorKind::Volume => "volume",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rsi" => Some(IndicatorKind::Rsi),
            "macd" => Some(IndicatorKind::Macd),
            "bollinger" | "bb" => Some(IndicatorKind::Bollinger),
            "support_resistance" | "sr" => Some(IndicatorKind::SupportResistance),
            "fibonacci" | "fib" => Some(IndicatorKind::Fibonacci),
            "volume" | "vol" => Some(IndicatorKind::Volume),
            _ => None,
        }
    }
}

impl fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized directional reading from a single indicator.
/// Sign is direction (positive bullish), magnitude is strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorReading {
    pub indicator: IndicatorKind,
    /// Normalized score in [-1, 1]
    pub score: f64,
    /// Raw indicator value before normalization (RSI level, MACD histogram, ...)
    pub raw_value: f64,
    pub computed_at: DateTime<Utc>,
}

/// Weighted aggregate of all indicator scores for one candle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeScore {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    /// Weighted sum in [-1, 1]
    pub value: f64,
    pub direction: Direction,
    /// Variant whose weight vector produced this score
    pub variant_id: String,
}

/// Signal lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    PrimarySent,
    SecondarySent,
    Expired,
    Confirmed,
    Closed,
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalStatus::Pending => "pending",
            SignalStatus::PrimarySent => "primary_sent",
            SignalStatus::SecondarySent => "secondary_sent",
            SignalStatus::Expired => "expired",
            SignalStatus::Confirmed => "confirmed",
            SignalStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Trade signal produced by the composer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Unique signal ID
    pub id: Uuid,
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub direction: Direction,
    /// Entry price
    pub entry: f64,
    /// Stop-loss price
    pub stop_loss: f64,
    /// Take-profit price
    pub take_profit: f64,
    /// Reward distance divided by risk distance
    pub risk_reward_ratio: f64,
    /// Fraction of account committed, capped by risk policy
    pub position_size_pct: f64,
    /// Composite score that triggered this signal
    pub composite_score: f64,
    pub created_at: DateTime<Utc>,
    pub status: SignalStatus,
    /// Variant that was active when the signal was generated
    pub linked_variant_id: String,
    /// For secondary signals, the primary they confirm
    pub secondary_of: Option<Uuid>,
}

/// Trade result reported by the tracking collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeResult {
    Win,
    Loss,
}

impl fmt::Display for TradeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeResult::Win => write!(f, "WIN"),
            TradeResult::Loss => write!(f, "LOSS"),
        }
    }
}

/// Realized outcome of a previously emitted signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOutcome {
    pub signal_id: Uuid,
    pub result: TradeResult,
    pub closed_at: DateTime<Utc>,
    pub realized_pips: f64,
}

/// Ordered batch of candles for one (instrument, timeframe) stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleBatch {
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    pub candles: Vec<Candle>,
}
