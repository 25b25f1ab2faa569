//! Trade Cadence Guard - Daily caps and the delayed secondary rule
//!
//! Counts primary signals against a daily cap whose scope (global or
//! per-instrument) and reset boundary (UTC or a fixed offset) are explicit
//! configuration, never assumptions. Also owns the deferred secondary
//! slots: one cancellable due-time per primary, fired by the engine when
//! its clock passes the deadline. Cancelling a slot that already fired or
//! never existed is a no-op.
//!
//! The session filter carried over from the upstream bot gates forex and
//! metal primaries to the London (08-17 UTC) and New York (13-22 UTC)
//! sessions; crypto trades around the clock.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{CadenceConfig, CapScope, DailyBoundary};
use crate::error::{EngineError, EngineResult};
use crate::types::{Instrument, MarketClass};

const LONDON_OPEN_HOUR: u32 = 8;
const LONDON_CLOSE_HOUR: u32 = 17;
const NEW_YORK_OPEN_HOUR: u32 = 13;
const NEW_YORK_CLOSE_HOUR: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScopeKey {
    Global,
    Instrument(Instrument),
}

#[derive(Debug, Clone)]
struct SecondarySlot {
    primary_id: Uuid,
    due_at: DateTime<Utc>,
    cancelled: bool,
}

pub struct CadenceGuard {
    cfg: CadenceConfig,
    counters: HashMap<ScopeKey, u32>,
    current_day: Option<NaiveDate>,
    slots: Vec<SecondarySlot>,
}

impl CadenceGuard {
    pub fn new(cfg: CadenceConfig) -> Self {
        Self {
            cfg,
            counters: HashMap::new(),
            current_day: None,
            slots: Vec::new(),
        }
    }

    pub fn config(&self) -> &CadenceConfig {
        &self.cfg
    }

    /// Swap in a new policy while keeping today's counters and pending
    /// slots; a mid-day reconfigure must not reopen an exhausted cap.
    pub fn set_config(&mut self, cfg: CadenceConfig) {
        self.cfg = cfg;
    }

    /// Calendar day in the configured boundary clock
    pub fn day_key(&self, now: DateTime<Utc>) -> NaiveDate {
        match self.cfg.daily_boundary {
            DailyBoundary::Utc => now.date_naive(),
            DailyBoundary::FixedOffset => {
                (now + Duration::hours(self.cfg.boundary_offset_hours as i64)).date_naive()
            }
        }
    }

    /// Roll the counters when the boundary day changes. Returns true when
    /// a boundary was crossed (the first observation does not count).
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = self.day_key(now);
        match self.current_day {
            None => {
                self.current_day = Some(today);
                false
            }
            Some(day) if day != today => {
                tracing::debug!(from = %day, to = %today, "daily counters reset");
                self.counters.clear();
                self.current_day = Some(today);
                true
            }
            Some(_) => false,
        }
    }

    /// Session gate: forex/metals trade London + New York hours only,
    /// crypto always. Disabled entirely via config.
    pub fn in_session(&self, instrument: Instrument, now: DateTime<Utc>) -> bool {
        if !self.cfg.session_filter {
            return true;
        }
        if instrument.market() == MarketClass::Crypto {
            return true;
        }
        let hour = now.hour();
        let london = (LONDON_OPEN_HOUR..LONDON_CLOSE_HOUR).contains(&hour);
        let new_york = (NEW_YORK_OPEN_HOUR..NEW_YORK_CLOSE_HOUR).contains(&hour);
        london || new_york
    }

    fn scope_key(&self, instrument: Instrument) -> ScopeKey {
        match self.cfg.cap_scope {
            CapScope::Global => ScopeKey::Global,
            CapScope::PerInstrument => ScopeKey::Instrument(instrument),
        }
    }

    /// Count today's primaries for the instrument's scope
    pub fn count_today(&self, instrument: Instrument) -> u32 {
        self.counters
            .get(&self.scope_key(instrument))
            .copied()
            .unwrap_or(0)
    }

    /// Admit one primary signal against the daily cap, incrementing the
    /// scope counter on success.
    pub fn admit_primary(
        &mut self,
        instrument: Instrument,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.roll_day(now);
        let key = self.scope_key(instrument);
        let count = self.counters.entry(key).or_insert(0);
        if *count >= self.cfg.max_daily_signals {
            return Err(EngineError::CadenceExceeded {
                count: *count,
                cap: self.cfg.max_daily_signals,
            });
        }
        *count += 1;
        Ok(())
    }

    /// Schedule the secondary check for a primary just sent
    pub fn schedule_secondary(&mut self, primary_id: Uuid, sent_at: DateTime<Utc>) {
        let due_at = sent_at + Duration::seconds(self.cfg.secondary_delay_secs as i64);
        self.slots.push(SecondarySlot {
            primary_id,
            due_at,
            cancelled: false,
        });
    }

    /// Cancel a pending secondary slot. Idempotent: cancelling a fired,
    /// already-cancelled or unknown slot changes nothing.
    pub fn cancel_secondary(&mut self, primary_id: Uuid) {
        for slot in &mut self.slots {
            if slot.primary_id == primary_id {
                slot.cancelled = true;
            }
        }
    }

    /// Earliest pending due time, for the actor's sleep deadline
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.slots
            .iter()
            .filter(|s| !s.cancelled)
            .map(|s| s.due_at)
            .min()
    }

    /// Drain every slot whose deadline has passed. Cancelled slots are
    /// dropped silently; live ones are returned for the engine to check.
    pub fn due_secondaries(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut due = Vec::new();
        self.slots.retain(|slot| {
            if slot.due_at > now {
                return true;
            }
            if !slot.cancelled {
                due.push(slot.primary_id);
            }
            false
        });
        due.sort();
        due
    }

    /// Pending (non-cancelled) slot count, for diagnostics
    pub fn pending_secondaries(&self) -> usize {
        self.slots.iter().filter(|s| !s.cancelled).count()
    }
}
