//! Confluence Engine - Facade over the scoring pipeline plus the actor
//! that runs it on tokio
//!
//! The synchronous `ConfluenceEngine` owns every moving part (history,
//! indicator bank, scorer, composer, cadence guard, adaptation
//! controller) behind explicit-`now` methods, so the whole decision path
//! is deterministic and testable without a runtime. `spawn` wraps it in
//! an actor: commands arrive on an mpsc channel, events fan out on a
//! broadcast channel, secondary timers fire via a deadline sleep, and
//! gated backtests run on `spawn_blocking` so scoring never waits on them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adaptation::{
    AdaptationController, PerformanceSnapshot, VariantSwitchEvent,
};
use crate::backtest::{BacktestMetrics, Backtester};
use crate::cadence::CadenceGuard;
use crate::composer::SignalComposer;
use crate::config::{EngineConfig, EntryPolicy};
use crate::error::{EngineError, EngineResult};
use crate::history::CandleStore;
use crate::indicators::IndicatorBank;
use crate::scorer::ConfluenceScorer;
use crate::strategy::{StrategyRegistry, WeightVector};
use crate::types::{
    Candle, CandleBatch, CompositeScore, Instrument, Signal, SignalStatus, Timeframe,
    TradeOutcome,
};

/// Outbound engine events for the delivery/audit collaborators
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Signal(Signal),
    VariantSwitch(VariantSwitchEvent),
    /// A secondary slot fired but the primary no longer qualified
    SignalExpired { signal_id: Uuid },
}

/// Per-batch ingest accounting, surfaced to the caller for logging
#[derive(Debug, Default)]
pub struct IngestReport {
    pub accepted: usize,
    /// Candles rejected as invalid input, with the reason
    pub dropped: Vec<EngineError>,
    /// Candles skipped because the window was too short
    pub skipped_insufficient: usize,
    /// Candles scored but disqualified or below the confluence threshold
    pub below_threshold: usize,
    /// Signals attempted but rejected by risk or cadence policy
    pub rejected: Vec<EngineError>,
    pub events: Vec<EngineEvent>,
    /// Candidate variant awaiting a gated backtest after a day close
    pub pending_adaptation: Option<String>,
}

/// Pending confirmation-bar entry under EntryPolicy::ConfirmationOpen
struct PendingEntry {
    composite: CompositeScore,
}

pub struct ConfluenceEngine {
    cfg: EngineConfig,
    bank: IndicatorBank,
    scorer: ConfluenceScorer,
    composer: SignalComposer,
    guard: CadenceGuard,
    controller: AdaptationController,
    store: CandleStore,
    /// Emitted signals; the engine owns their status transitions
    signals: HashMap<Uuid, Signal>,
    /// Pending confirmation-bar entries per stream
    pending_entries: HashMap<(Instrument, Timeframe), PendingEntry>,
    /// Triggering-bar dedupe: exactly one primary per (stream, bar)
    last_signal_bar: HashMap<(Instrument, Timeframe), DateTime<Utc>>,
    /// Whether any candle qualified since the last day close
    qualifying_today: bool,
}

impl ConfluenceEngine {
    pub fn new(
        cfg: EngineConfig,
        variants: Vec<WeightVector>,
        initial_active: Option<&str>,
    ) -> EngineResult<Self> {
        cfg.validate()?;
        let registry = StrategyRegistry::new(variants)?;
        let controller =
            AdaptationController::new(cfg.adaptation.clone(), registry, initial_active)?;
        Ok(Self {
            bank: IndicatorBank::new(cfg.indicators.clone()),
            scorer: ConfluenceScorer::new(&cfg.confluence),
            composer: SignalComposer::new(cfg.risk.clone()),
            guard: CadenceGuard::new(cfg.cadence.clone()),
            controller,
            store: CandleStore::default(),
            signals: HashMap::new(),
            pending_entries: HashMap::new(),
            last_signal_bar: HashMap::new(),
            qualifying_today: false,
            cfg,
        })
    }

    /// Engine with the built-in variant set, active variant `balanced`
    pub fn with_default_variants(cfg: EngineConfig) -> EngineResult<Self> {
        Self::new(cfg, StrategyRegistry::default_variants(), Some("balanced"))
    }

    pub fn active_variant_id(&self) -> &str {
        self.controller.active_variant_id()
    }

    pub fn signal(&self, id: Uuid) -> Option<&Signal> {
        self.signals.get(&id)
    }

    pub fn next_secondary_due(&self) -> Option<DateTime<Utc>> {
        self.guard.next_due()
    }

    /// Ingest an ordered candle batch. Per-instrument ordering is the
    /// caller's single-stream discipline; within the batch each candle is
    /// validated, appended, scored, and possibly turned into a signal.
    pub fn ingest_batch(&mut self, batch: CandleBatch, now: DateTime<Utc>) -> IngestReport {
        let mut report = IngestReport::default();
        for candle in batch.candles {
            if candle.instrument != batch.instrument || candle.timeframe != batch.timeframe {
                report.dropped.push(EngineError::InvalidInput(format!(
                    "candle stream mismatch: batch is {} {}",
                    batch.instrument, batch.timeframe
                )));
                continue;
            }
            self.roll_day(candle.open_time.max(now), &mut report);
            if let Err(err) = self.store.push(candle.clone()) {
                warn!(error = %err, "candle dropped");
                report.dropped.push(err);
                continue;
            }
            report.accepted += 1;
            self.process_candle(&candle, &mut report);
        }
        report
    }

    fn process_candle(&mut self, candle: &Candle, report: &mut IngestReport) {
        let key = (candle.instrument, candle.timeframe);
        let window = self.store.window(candle.instrument, candle.timeframe);

        // Confirmation-bar entry left over from the previous candle
        if let Some(pending) = self.pending_entries.remove(&key) {
            self.finish_confirmation_entry(candle, &window, pending, report);
        }

        let readings = match self.bank.compute(&window) {
            Ok(r) => r,
            Err(EngineError::DataInsufficient { .. }) => {
                report.skipped_insufficient += 1;
                return;
            }
            Err(err) => {
                report.dropped.push(err);
                return;
            }
        };

        let vector = self.controller.active_vector();
        let composite = match self.scorer.compose(
            candle.instrument,
            candle.timeframe,
            candle.open_time,
            &readings,
            &vector,
        ) {
            Some(c) => c,
            None => {
                report.below_threshold += 1;
                return;
            }
        };
        if !self.scorer.qualifies(&composite) {
            report.below_threshold += 1;
            return;
        }
        self.qualifying_today = true;

        if self.last_signal_bar.get(&key) == Some(&candle.open_time) {
            // Revised bar already produced its primary
            return;
        }
        if !self.guard.in_session(candle.instrument, candle.open_time) {
            debug!(instrument = %candle.instrument, "qualifying candle outside session hours");
            report.rejected.push(EngineError::SignalRejected(format!(
                "{} outside trading session",
                candle.instrument
            )));
            return;
        }

        match self.cfg.risk.entry_policy {
            EntryPolicy::CandleClose => {
                let atr = self.bank.atr(&window);
                self.emit_primary(composite, candle.close, atr, candle.open_time, report);
                self.last_signal_bar.insert(key, candle.open_time);
            }
            EntryPolicy::ConfirmationOpen => {
                self.pending_entries.insert(key, PendingEntry { composite });
                self.last_signal_bar.insert(key, candle.open_time);
            }
        }
    }

    /// Enter at the confirmation bar's open, provided the setup still
    /// qualifies with this bar included.
    fn finish_confirmation_entry(
        &mut self,
        candle: &Candle,
        window: &[Candle],
        pending: PendingEntry,
        report: &mut IngestReport,
    ) {
        let Ok(readings) = self.bank.compute(window) else {
            report.below_threshold += 1;
            return;
        };
        let Ok(vector) = self.controller.vector(&pending.composite.variant_id) else {
            report.below_threshold += 1;
            return;
        };
        let recheck = self.scorer.compose(
            candle.instrument,
            candle.timeframe,
            candle.open_time,
            &readings,
            &vector,
        );
        match recheck {
            Some(c) if self.scorer.qualifies(&c) && c.direction == pending.composite.direction => {
                let atr = self.bank.atr(window);
                self.emit_primary(pending.composite, candle.open, atr, candle.open_time, report);
            }
            _ => {
                debug!(
                    instrument = %candle.instrument,
                    "confirmation bar no longer qualifies; entry abandoned"
                );
                report.below_threshold += 1;
            }
        }
    }

    fn emit_primary(
        &mut self,
        composite: CompositeScore,
        entry: f64,
        atr: Option<f64>,
        now: DateTime<Utc>,
        report: &mut IngestReport,
    ) {
        let mut signal = match self.composer.compose(&composite, entry, atr, now) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "signal attempt rejected");
                report.rejected.push(err);
                return;
            }
        };
        if let Err(err) = self.guard.admit_primary(composite.instrument, now) {
            info!(error = %err, instrument = %composite.instrument, "signal held back by cadence");
            report.rejected.push(err);
            return;
        }
        signal.status = SignalStatus::PrimarySent;
        self.guard.schedule_secondary(signal.id, now);
        self.signals.insert(signal.id, signal.clone());
        info!(
            id = %signal.id,
            instrument = %signal.instrument,
            direction = %signal.direction,
            composite = signal.composite_score,
            entry = signal.entry,
            "primary signal emitted"
        );
        report.events.push(EngineEvent::Signal(signal));
    }

    /// Fire every secondary slot whose deadline has passed. A secondary
    /// goes out iff the primary is still PrimarySent and its direction
    /// still qualifies under current data.
    pub fn poll_secondaries(&mut self, now: DateTime<Utc>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for primary_id in self.guard.due_secondaries(now) {
            let Some(primary) = self.signals.get(&primary_id).cloned() else {
                continue;
            };
            if primary.status != SignalStatus::PrimarySent {
                // Confirmed or closed in the meantime; the late fire is a no-op
                continue;
            }
            match self.requalify(&primary, now) {
                Some((composite, entry, atr)) => {
                    match self
                        .composer
                        .compose_secondary(&composite, entry, atr, now, primary_id)
                    {
                        Ok(mut secondary) => {
                            secondary.status = SignalStatus::SecondarySent;
                            if let Some(p) = self.signals.get_mut(&primary_id) {
                                p.status = SignalStatus::SecondarySent;
                            }
                            self.signals.insert(secondary.id, secondary.clone());
                            info!(
                                primary = %primary_id,
                                secondary = %secondary.id,
                                "secondary signal emitted"
                            );
                            events.push(EngineEvent::Signal(secondary));
                        }
                        Err(err) => {
                            warn!(error = %err, primary = %primary_id, "secondary rejected");
                            self.expire(primary_id, &mut events);
                        }
                    }
                }
                None => self.expire(primary_id, &mut events),
            }
        }
        events
    }

    /// Re-score the primary's stream with its originating variant.
    fn requalify(
        &self,
        primary: &Signal,
        _now: DateTime<Utc>,
    ) -> Option<(CompositeScore, f64, Option<f64>)> {
        let window = self.store.window(primary.instrument, primary.timeframe);
        let readings = self.bank.compute(&window).ok()?;
        let vector = self
            .controller
            .vector(&primary.linked_variant_id)
            .unwrap_or_else(|_| self.controller.active_vector());
        let last = window.last()?;
        let composite = self.scorer.compose(
            primary.instrument,
            primary.timeframe,
            last.open_time,
            &readings,
            &vector,
        )?;
        if self.scorer.qualifies(&composite) && composite.direction == primary.direction {
            let atr = self.bank.atr(&window);
            Some((composite, last.close, atr))
        } else {
            None
        }
    }

    fn expire(&mut self, primary_id: Uuid, events: &mut Vec<EngineEvent>) {
        if let Some(p) = self.signals.get_mut(&primary_id) {
            p.status = SignalStatus::Expired;
        }
        info!(primary = %primary_id, "secondary slot expired");
        events.push(EngineEvent::SignalExpired {
            signal_id: primary_id,
        });
    }

    /// External confirmation (trade taken). Cancels the pending secondary;
    /// the cancel/fire race resolves safely because both run through the
    /// single writer and the fire re-checks status.
    pub fn confirm_signal(&mut self, signal_id: Uuid) -> EngineResult<()> {
        let signal = self
            .signals
            .get_mut(&signal_id)
            .ok_or_else(|| EngineError::InvalidInput(format!("unknown signal {signal_id}")))?;
        signal.status = SignalStatus::Confirmed;
        self.guard.cancel_secondary(signal_id);
        Ok(())
    }

    /// Realized outcome from the trade-tracking collaborator. Attribution
    /// goes to the variant that generated the signal.
    pub fn record_outcome(&mut self, outcome: TradeOutcome) {
        let Some(signal) = self.signals.get_mut(&outcome.signal_id) else {
            warn!(signal = %outcome.signal_id, "outcome for unknown signal dropped");
            return;
        };
        signal.status = SignalStatus::Closed;
        let variant_id = signal.linked_variant_id.clone();
        self.guard.cancel_secondary(outcome.signal_id);
        self.controller.record_outcome(&variant_id, outcome.result);
    }

    /// Advance the engine clock: reset daily counters and close the
    /// trading day when the boundary is crossed. A returned candidate id
    /// means a gated backtest is due.
    pub fn observe_time(&mut self, now: DateTime<Utc>) -> Option<String> {
        let mut report = IngestReport::default();
        self.roll_day(now, &mut report);
        report.pending_adaptation
    }

    fn roll_day(&mut self, now: DateTime<Utc>, report: &mut IngestReport) {
        if !self.guard.roll_day(now) {
            return;
        }
        let had_signal = std::mem::take(&mut self.qualifying_today);
        if let Some(candidate) = self.controller.on_day_close(had_signal, now) {
            report.pending_adaptation = Some(candidate);
        }
    }

    /// Inputs for a gated backtest: the candidate vector and a bounded
    /// snapshot of every stream. The snapshot decouples the replay from
    /// ongoing ingestion.
    pub fn backtest_inputs(
        &self,
        candidate_id: &str,
    ) -> EngineResult<(std::sync::Arc<WeightVector>, Vec<Vec<Candle>>)> {
        let vector = self.controller.vector(candidate_id)?;
        let window = self.cfg.adaptation.backtest_window_candles;
        let streams = self
            .store
            .streams()
            .into_iter()
            .map(|(inst, tf)| self.store.last_n(inst, tf, window))
            .collect();
        Ok((vector, streams))
    }

    /// Apply a finished backtest to the adaptation state.
    pub fn apply_adaptation_verdict(
        &mut self,
        candidate_id: &str,
        metrics: &BacktestMetrics,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<EngineEvent>> {
        let switched = self
            .controller
            .apply_backtest_verdict(candidate_id, metrics, now)?;
        Ok(switched.map(EngineEvent::VariantSwitch))
    }

    /// Synchronous adaptation cycle: snapshot, replay, verdict. The actor
    /// splits this across `spawn_blocking` instead.
    pub fn run_adaptation(
        &mut self,
        candidate_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<EngineEvent>> {
        let (vector, streams) = self.backtest_inputs(candidate_id)?;
        let metrics = run_gated_backtest(&self.cfg, &vector, &streams);
        self.apply_adaptation_verdict(candidate_id, &metrics, now)
    }

    /// Replace configuration and variant set in one step. Validation runs
    /// first; on any error the old state stays untouched.
    pub fn reconfigure(
        &mut self,
        cfg: EngineConfig,
        variants: Vec<WeightVector>,
    ) -> EngineResult<()> {
        cfg.validate()?;
        let registry = StrategyRegistry::new(variants)?;
        self.controller.replace_registry(registry)?;
        self.bank = IndicatorBank::new(cfg.indicators.clone());
        self.scorer = ConfluenceScorer::new(&cfg.confluence);
        self.composer = SignalComposer::new(cfg.risk.clone());
        self.guard.set_config(cfg.cadence.clone());
        self.cfg = cfg;
        info!(active = %self.controller.active_variant_id(), "engine reconfigured");
        Ok(())
    }

    pub fn performance_snapshot(&self) -> PerformanceSnapshot {
        self.controller.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }
}

/// Pure gated backtest, safe to run on a blocking worker: everything it
/// needs is owned or borrowed immutably.
pub fn run_gated_backtest(
    cfg: &EngineConfig,
    candidate: &WeightVector,
    streams: &[Vec<Candle>],
) -> BacktestMetrics {
    let bank = IndicatorBank::new(cfg.indicators.clone());
    let scorer = ConfluenceScorer::new(&cfg.confluence);
    let composer = SignalComposer::new(cfg.risk.clone());
    let backtester = Backtester::new(
        &bank,
        &scorer,
        &composer,
        cfg.adaptation.backtest_horizon_candles,
    );
    let (metrics, trades) = backtester.run(candidate, streams);
    debug!(
        candidate = candidate.variant_id(),
        trades = trades.len(),
        win_rate = metrics.win_rate,
        "gated backtest finished"
    );
    metrics
}

// ---------------------------------------------------------------------------
// Actor wrapper
// ---------------------------------------------------------------------------

/// Commands accepted by the engine actor
pub enum EngineCommand {
    Ingest(CandleBatch),
    Outcome(TradeOutcome),
    Confirm(Uuid),
    Reconfigure {
        cfg: EngineConfig,
        variants: Vec<WeightVector>,
        respond: oneshot::Sender<EngineResult<()>>,
    },
    Snapshot(oneshot::Sender<PerformanceSnapshot>),
    AdaptationResult {
        candidate_id: String,
        metrics: BacktestMetrics,
    },
    Shutdown,
}

/// Cloneable handle to a spawned engine actor
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub async fn ingest(&self, batch: CandleBatch) {
        let _ = self.tx.send(EngineCommand::Ingest(batch)).await;
    }

    pub async fn record_outcome(&self, outcome: TradeOutcome) {
        let _ = self.tx.send(EngineCommand::Outcome(outcome)).await;
    }

    pub async fn confirm(&self, signal_id: Uuid) {
        let _ = self.tx.send(EngineCommand::Confirm(signal_id)).await;
    }

    pub async fn reconfigure(
        &self,
        cfg: EngineConfig,
        variants: Vec<WeightVector>,
    ) -> EngineResult<()> {
        let (respond, rx) = oneshot::channel();
        if self
            .tx
            .send(EngineCommand::Reconfigure {
                cfg,
                variants,
                respond,
            })
            .await
            .is_err()
        {
            return Err(EngineError::InvalidInput("engine actor stopped".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(EngineError::InvalidInput("engine actor stopped".into())))
    }

    pub async fn snapshot(&self) -> Option<PerformanceSnapshot> {
        let (respond, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Snapshot(respond)).await.ok()?;
        rx.await.ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineCommand::Shutdown).await;
    }
}

/// Spawn the actor loop. The returned handle is the only way in; the
/// engine itself is owned exclusively by the loop task (single writer).
pub fn spawn(engine: ConfluenceEngine) -> (EngineHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let (events, _) = broadcast::channel(256);
    let handle = EngineHandle {
        tx: tx.clone(),
        events: events.clone(),
    };
    let join = tokio::spawn(run_loop(engine, rx, tx, events));
    (handle, join)
}

async fn run_loop(
    mut engine: ConfluenceEngine,
    mut rx: mpsc::Receiver<EngineCommand>,
    self_tx: mpsc::Sender<EngineCommand>,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut day_tick = tokio::time::interval(std::time::Duration::from_secs(60));
    day_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let timer_gap = engine
            .next_secondary_due()
            .map(|due| (due - Utc::now()).to_std().unwrap_or_default())
            .unwrap_or(std::time::Duration::from_secs(3600));

        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    EngineCommand::Ingest(batch) => {
                        let report = engine.ingest_batch(batch, Utc::now());
                        for err in report.dropped.iter().chain(report.rejected.iter()) {
                            debug!(error = %err, "ingest diagnostic");
                        }
                        for event in report.events {
                            let _ = events.send(event);
                        }
                        if let Some(candidate) = report.pending_adaptation {
                            launch_backtest(&engine, candidate, self_tx.clone());
                        }
                    }
                    EngineCommand::Outcome(outcome) => engine.record_outcome(outcome),
                    EngineCommand::Confirm(id) => {
                        if let Err(err) = engine.confirm_signal(id) {
                            warn!(error = %err, "confirm failed");
                        }
                    }
                    EngineCommand::Reconfigure { cfg, variants, respond } => {
                        let _ = respond.send(engine.reconfigure(cfg, variants));
                    }
                    EngineCommand::Snapshot(respond) => {
                        let _ = respond.send(engine.performance_snapshot());
                    }
                    EngineCommand::AdaptationResult { candidate_id, metrics } => {
                        match engine.apply_adaptation_verdict(&candidate_id, &metrics, Utc::now()) {
                            Ok(Some(event)) => { let _ = events.send(event); }
                            Ok(None) => {}
                            Err(err) => info!(error = %err, "adaptation verdict"),
                        }
                    }
                    EngineCommand::Shutdown => break,
                }
            }
            _ = tokio::time::sleep(timer_gap) => {
                for event in engine.poll_secondaries(Utc::now()) {
                    let _ = events.send(event);
                }
            }
            _ = day_tick.tick() => {
                if let Some(candidate) = engine.observe_time(Utc::now()) {
                    launch_backtest(&engine, candidate, self_tx.clone());
                }
            }
        }
    }
    info!("engine actor stopped");
}

/// Run the gated backtest off the scoring path and feed the verdict back
/// through the command channel.
fn launch_backtest(
    engine: &ConfluenceEngine,
    candidate_id: String,
    tx: mpsc::Sender<EngineCommand>,
) {
    let inputs = match engine.backtest_inputs(&candidate_id) {
        Ok(inputs) => inputs,
        Err(err) => {
            warn!(error = %err, "backtest inputs unavailable");
            return;
        }
    };
    let cfg = engine.config().clone();
    tokio::task::spawn_blocking(move || {
        let (vector, streams) = inputs;
        let metrics = run_gated_backtest(&cfg, &vector, &streams);
        let _ = tx.blocking_send(EngineCommand::AdaptationResult {
            candidate_id,
            metrics,
        });
    });
}
