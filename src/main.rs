//! ConfluxBot - Adaptive confluence signal engine
//!
//! Bootstraps configuration and logging, spawns the engine actor, and
//! wires a logging consumer onto the event stream. Market data arrives
//! from the acquisition collaborator over the actor's command channel; a
//! JSON candle file can be replayed through the same path for dry runs.

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use confluxbot::config::{AppConfig, VariantSetFile};
use confluxbot::engine::{self, ConfluenceEngine, EngineEvent};
use confluxbot::strategy::{StrategyRegistry, WeightVector};
use confluxbot::types::{CandleBatch, Candle};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("configuration rejected")?;
    init_tracing(config.bot.json_logs);
    info!(config = %config.digest(), "starting confluxbot");

    let variants = load_variants(&config)?;
    let engine = ConfluenceEngine::new(config.engine_config(), variants, None)
        .context("engine construction failed")?;
    let (handle, join) = engine::spawn(engine);

    // Event consumer: the delivery/persistence collaborators subscribe the
    // same way; here we log what they would receive.
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Signal(signal)) => info!(
                    id = %signal.id,
                    instrument = %signal.instrument,
                    direction = %signal.direction,
                    entry = signal.entry,
                    stop = signal.stop_loss,
                    target = signal.take_profit,
                    size_pct = signal.position_size_pct,
                    status = %signal.status,
                    "signal event"
                ),
                Ok(EngineEvent::VariantSwitch(switch)) => info!(
                    old = %switch.old_variant,
                    new = %switch.new_variant,
                    win_rate = switch.backtest_win_rate,
                    "variant switch event"
                ),
                Ok(EngineEvent::SignalExpired { signal_id }) => {
                    info!(id = %signal_id, "signal expired")
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "event consumer lagging")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    if let Some(path) = &config.replay.file {
        replay_candles(&handle, path).await?;
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    handle.shutdown().await;
    join.await.ok();
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,confluxbot=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Variant set from the configured YAML file, or the built-in defaults.
fn load_variants(config: &AppConfig) -> Result<Vec<WeightVector>> {
    let Some(path) = &config.bot.variants_file else {
        return Ok(StrategyRegistry::default_variants());
    };
    let file = VariantSetFile::load(path)?;
    let mut vectors = Vec::new();
    for (variant_id, weights) in file.resolved()? {
        vectors.push(WeightVector::new(variant_id, weights)?);
    }
    info!(count = vectors.len(), path, "variant set loaded");
    Ok(vectors)
}

/// Replay a JSON candle file through the engine, grouped into per-stream
/// batches in file order.
async fn replay_candles(handle: &engine::EngineHandle, path: &str) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read replay file {path}"))?;
    let candles: Vec<Candle> =
        serde_json::from_str(&raw).context("replay file is not a JSON candle array")?;
    info!(count = candles.len(), path, "replaying candles");

    let mut batch: Option<CandleBatch> = None;
    for candle in candles {
        match &mut batch {
            Some(b) if b.instrument == candle.instrument && b.timeframe == candle.timeframe => {
                b.candles.push(candle);
            }
            _ => {
                if let Some(full) = batch.take() {
                    handle.ingest(full).await;
                }
                batch = Some(CandleBatch {
                    instrument: candle.instrument,
                    timeframe: candle.timeframe,
                    candles: vec![candle],
                });
            }
        }
    }
    if let Some(full) = batch.take() {
        handle.ingest(full).await;
    }

    if let Some(snapshot) = handle.snapshot().await {
        info!(
            active = %snapshot.state.active_variant_id,
            streak = snapshot.state.streak_days,
            "replay finished"
        );
    } else {
        error!("engine unavailable after replay");
    }
    Ok(())
}
