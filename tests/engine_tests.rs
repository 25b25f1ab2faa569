//! End-to-end engine tests: candle stream in, policy-compliant signals
//! out, adaptation loop behind a gated backtest.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;

use confluxbot::backtest::BacktestMetrics;
use confluxbot::config::EngineConfig;
use confluxbot::engine::{self, ConfluenceEngine, EngineEvent};
use confluxbot::error::EngineError;
use confluxbot::strategy::StrategyRegistry;
use confluxbot::types::{
    Candle, CandleBatch, Direction, Instrument, SignalStatus, Timeframe, TradeOutcome,
    TradeResult,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()
}

fn candles_from_closes(instrument: Instrument, closes: &[f64]) -> Vec<Candle> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = if i == 0 { close } else { closes[i - 1] };
            Candle {
                open_time: t0() + Duration::hours(i as i64),
                instrument,
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

/// Steady decline: mean-reversion indicators align into a bullish
/// confluence once the lookback fills.
fn oversold_closes(len: usize) -> Vec<f64> {
    (0..len).map(|i| 1.30 - 0.002 * i as f64).collect()
}

fn test_config(threshold: f64) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.confluence.threshold = threshold;
    cfg.cadence.session_filter = false;
    cfg
}

fn collect_signals(events: &[EngineEvent]) -> Vec<confluxbot::types::Signal> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Signal(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn exactly_one_primary_per_triggering_candle() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.30)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
    };
    let report = engine.ingest_batch(batch, t0());
    let signals = collect_signals(&report.events);
    assert!(!signals.is_empty());

    let mut seen = HashMap::new();
    for signal in &signals {
        assert!(signal.secondary_of.is_none());
        let prev = seen.insert((signal.instrument, signal.created_at), signal.id);
        assert!(prev.is_none(), "duplicate primary for one triggering candle");
    }
}

#[test]
fn every_signal_respects_risk_floor_and_size_cap() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.10)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(200)),
    };
    let report = engine.ingest_batch(batch, t0());
    let signals = collect_signals(&report.events);
    assert!(!signals.is_empty());

    for signal in &signals {
        let (reward, risk) = match signal.direction {
            Direction::Long => (
                signal.take_profit - signal.entry,
                signal.entry - signal.stop_loss,
            ),
            Direction::Short => (
                signal.entry - signal.take_profit,
                signal.stop_loss - signal.entry,
            ),
        };
        assert!(risk > 0.0);
        assert!(reward / risk >= 2.5 - 1e-9, "risk/reward floor violated");
        assert!(signal.position_size_pct <= 0.02 + 1e-12, "size cap violated");
        assert!(signal.composite_score.abs() <= 1.0);
    }
}

#[test]
fn daily_cap_never_exceeded() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.05)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(300)),
    };
    let report = engine.ingest_batch(batch, t0());
    let signals = collect_signals(&report.events);

    let mut per_day: HashMap<chrono::NaiveDate, u32> = HashMap::new();
    for signal in &signals {
        *per_day.entry(signal.created_at.date_naive()).or_default() += 1;
    }
    assert!(per_day.values().all(|&n| n <= 3), "cap breached: {per_day:?}");
    assert!(report
        .rejected
        .iter()
        .any(|e| matches!(e, EngineError::CadenceExceeded { .. })));
}

#[test]
fn secondary_fires_only_while_primary_sent() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.30)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
    };
    let report = engine.ingest_batch(batch, t0());
    let primary = collect_signals(&report.events).remove(0);

    // Nothing fires before the delay elapses
    let early = engine.poll_secondaries(primary.created_at + Duration::hours(3));
    assert!(early
        .iter()
        .all(|e| !matches!(e, EngineEvent::Signal(s) if s.secondary_of == Some(primary.id))));

    // At the deadline the still-qualifying setup spawns a linked secondary
    let due = engine.poll_secondaries(primary.created_at + Duration::hours(4));
    let secondary = collect_signals(&due)
        .into_iter()
        .find(|s| s.secondary_of == Some(primary.id))
        .expect("secondary expected");
    assert_eq!(secondary.direction, primary.direction);
    assert_eq!(secondary.status, SignalStatus::SecondarySent);
    assert_eq!(
        engine.signal(primary.id).unwrap().status,
        SignalStatus::SecondarySent
    );
}

#[test]
fn closed_primary_never_fires_a_secondary() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.30)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
    };
    let report = engine.ingest_batch(batch, t0());
    let primary = collect_signals(&report.events).remove(0);

    engine.record_outcome(TradeOutcome {
        signal_id: primary.id,
        result: TradeResult::Loss,
        closed_at: primary.created_at + Duration::hours(2),
        realized_pips: -30.0,
    });

    let due = engine.poll_secondaries(primary.created_at + Duration::hours(4));
    assert!(due.is_empty(), "closed primary must not produce a secondary");
    assert_eq!(
        engine.signal(primary.id).unwrap().status,
        SignalStatus::Closed
    );
}

#[test]
fn outcome_attribution_survives_variant_switch() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.30)).unwrap();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
    };
    let report = engine.ingest_batch(batch, t0());
    let primary = collect_signals(&report.events).remove(0);
    assert_eq!(primary.linked_variant_id, "balanced");

    // Promote another variant before the outcome arrives
    let metrics = BacktestMetrics {
        total_trades: 20,
        wins: 14,
        losses: 6,
        win_rate: 0.70,
        ..Default::default()
    };
    let event = engine
        .apply_adaptation_verdict("trend_rider", &metrics, t0() + Duration::days(5))
        .unwrap()
        .expect("switch expected");
    assert!(matches!(event, EngineEvent::VariantSwitch(_)));
    assert_eq!(engine.active_variant_id(), "trend_rider");

    engine.record_outcome(TradeOutcome {
        signal_id: primary.id,
        result: TradeResult::Win,
        closed_at: t0() + Duration::days(6),
        realized_pips: 75.0,
    });
    let snapshot = engine.performance_snapshot();
    assert_eq!(snapshot.windows["balanced"].wins, 1);
    assert_eq!(snapshot.windows["trend_rider"].trades, 0);
}

#[test]
fn rejected_candidate_is_blacklisted_and_skipped() {
    let mut engine = ConfluenceEngine::with_default_variants(test_config(0.99)).unwrap();
    // Three quiet days with data present but nothing qualifying
    let closes: Vec<f64> = (0..96)
        .map(|i| 1.10 + 0.0003 * ((i as f64) * 0.7).sin())
        .collect();
    let batch = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &closes),
    };
    let report = engine.ingest_batch(batch, t0());
    let candidate = report
        .pending_adaptation
        .expect("three no-signal days must trigger");

    let weak = BacktestMetrics {
        total_trades: 20,
        wins: 8,
        losses: 12,
        win_rate: 0.40,
        ..Default::default()
    };
    let now = t0() + Duration::days(4);
    let outcome = engine.apply_adaptation_verdict(&candidate, &weak, now).unwrap();
    assert!(outcome.is_none(), "sub-threshold candidate must not promote");
    assert_eq!(engine.active_variant_id(), "balanced");
    assert!(engine
        .performance_snapshot()
        .state
        .blacklist
        .contains_key(&candidate));

    // The next trigger must pick a different candidate
    let next = engine.observe_time(now + Duration::days(1));
    if let Some(next_candidate) = next {
        assert_ne!(next_candidate, candidate);
    }
}

#[test]
fn serialized_variant_set_scores_identically() {
    let variants = StrategyRegistry::default_variants();
    let json = serde_json::to_string(&variants).unwrap();
    let reloaded: Vec<confluxbot::strategy::WeightVector> =
        serde_json::from_str(&json).unwrap();

    let candles = candles_from_closes(Instrument::EurUsd, &oversold_closes(120));
    let run = |variants: Vec<confluxbot::strategy::WeightVector>| {
        let mut engine =
            ConfluenceEngine::new(test_config(0.30), variants, Some("balanced")).unwrap();
        let report = engine.ingest_batch(
            CandleBatch {
                instrument: Instrument::EurUsd,
                timeframe: Timeframe::Hour1,
                candles: candles.clone(),
            },
            t0(),
        );
        collect_signals(&report.events)
    };

    let original = run(variants);
    let roundtripped = run(reloaded);
    assert_eq!(original.len(), roundtripped.len());
    for (a, b) in original.iter().zip(roundtripped.iter()) {
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(a.direction, b.direction);
        assert_eq!(a.entry, b.entry);
        assert_eq!(a.composite_score, b.composite_score);
    }
}

#[test]
fn cross_instrument_streams_are_independent() {
    let mut cfg = test_config(0.30);
    cfg.cadence.cap_scope = confluxbot::config::CapScope::PerInstrument;
    let mut engine = ConfluenceEngine::with_default_variants(cfg).unwrap();
    let eur = CandleBatch {
        instrument: Instrument::EurUsd,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
    };
    let btc_closes: Vec<f64> = (0..90).map(|i| 50_000.0 - 80.0 * i as f64).collect();
    let btc = CandleBatch {
        instrument: Instrument::BtcUsdt,
        timeframe: Timeframe::Hour1,
        candles: candles_from_closes(Instrument::BtcUsdt, &btc_closes),
    };
    let eur_report = engine.ingest_batch(eur, t0());
    let btc_report = engine.ingest_batch(btc, t0());
    let eur_signals = collect_signals(&eur_report.events);
    let btc_signals = collect_signals(&btc_report.events);
    assert!(!eur_signals.is_empty());
    assert!(!btc_signals.is_empty());
    assert!(eur_signals.iter().all(|s| s.instrument == Instrument::EurUsd));
    assert!(btc_signals.iter().all(|s| s.instrument == Instrument::BtcUsdt));
}

#[tokio::test]
async fn actor_round_trip() {
    let engine = ConfluenceEngine::with_default_variants(test_config(0.30)).unwrap();
    let (handle, join) = engine::spawn(engine);
    let mut events = handle.subscribe();

    handle
        .ingest(CandleBatch {
            instrument: Instrument::EurUsd,
            timeframe: Timeframe::Hour1,
            candles: candles_from_closes(Instrument::EurUsd, &oversold_closes(90)),
        })
        .await;

    let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");
    match event {
        EngineEvent::Signal(signal) => {
            assert_eq!(signal.instrument, Instrument::EurUsd);
            assert_eq!(signal.status, SignalStatus::PrimarySent);
        }
        other => panic!("expected a signal event, got {other:?}"),
    }

    let snapshot = handle.snapshot().await.expect("snapshot");
    assert_eq!(snapshot.state.active_variant_id, "balanced");

    handle.shutdown().await;
    join.await.unwrap();
}
