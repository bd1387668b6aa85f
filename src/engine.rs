// =============================================================================
// Engine — stream ownership, bar routing, tick scheduling, rollover
// =============================================================================
//
// Single logical engine task: the 1 Hz tick, bar routing, and execution
// callbacks all mutate stream state here, serialized by the caller's select
// loop. Cross-stream coordination is limited to the kill switch (inside the
// risk gate) and the duplicate-instance guard (acquired in main before the
// engine exists).
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{ExecutionPolicy, Timetable};
use crate::events::{EventBus, EventLevel, EventScope};
use crate::execution::{ExecutionAdapter, ExecutionEvent};
use crate::journal::{
    ExecutionJournal, HydrationLog, RangesLog, StreamJournalRecord, StreamJournalStore,
};
use crate::market_data::{historical, Bar};
use crate::notify::{AlertClass, Notifier};
use crate::restore::RestoreLayer;
use crate::risk::RiskGate;
use crate::stream::{StreamCtx, StreamStateMachine};
use crate::time_service::TimeService;
use crate::types::{BarSource, StreamState};

/// Engine tick gaps beyond this are reported as a tick stall.
const TICK_STALL_THRESHOLD_SECS: i64 = 10;

pub struct Engine {
    policy: ExecutionPolicy,
    time_service: TimeService,
    data_root: PathBuf,

    /// Streams keyed by `{trading_date}_{stream_id}`.
    streams: HashMap<String, StreamStateMachine>,
    /// Per-canonical-instrument historical fetch interlock. Set before a
    /// fetch is queued, cleared before fetched bars are fed.
    fetch_pending: HashMap<String, bool>,
    /// Per-canonical-instrument last accepted bar open time (stall watch).
    last_bar: HashMap<String, DateTime<Utc>>,

    active_trading_date: Option<NaiveDate>,
    rollover_utc: Option<DateTime<Utc>>,
    last_tick: Option<DateTime<Utc>>,
    recovery_active: bool,
    kill_latched: bool,

    journal: Arc<ExecutionJournal>,
    stream_journals: Arc<StreamJournalStore>,
    hydration: Arc<HydrationLog>,
    ranges: Arc<RangesLog>,
    adapter: Arc<dyn ExecutionAdapter>,
    gate: Arc<RiskGate>,
    events: Arc<EventBus>,
    notifier: Arc<Notifier>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: ExecutionPolicy,
        time_service: TimeService,
        journal: Arc<ExecutionJournal>,
        stream_journals: Arc<StreamJournalStore>,
        hydration: Arc<HydrationLog>,
        ranges: Arc<RangesLog>,
        adapter: Arc<dyn ExecutionAdapter>,
        gate: Arc<RiskGate>,
        events: Arc<EventBus>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let data_root = PathBuf::from(&policy.data_root);
        Self {
            policy,
            time_service,
            data_root,
            streams: HashMap::new(),
            fetch_pending: HashMap::new(),
            last_bar: HashMap::new(),
            active_trading_date: None,
            rollover_utc: None,
            last_tick: None,
            recovery_active: false,
            kill_latched: false,
            journal,
            stream_journals,
            hydration,
            ranges,
            adapter,
            gate,
            events,
            notifier,
        }
    }

    fn ctx(&self) -> StreamCtx {
        StreamCtx {
            journal: self.journal.clone(),
            stream_journals: self.stream_journals.clone(),
            hydration: self.hydration.clone(),
            ranges: self.ranges.clone(),
            adapter: self.adapter.clone(),
            gate: self.gate.clone(),
            events: self.events.clone(),
            notifier: self.notifier.clone(),
            active_trading_date: self.active_trading_date,
            recovery_active: self.recovery_active,
        }
    }

    pub fn active_trading_date(&self) -> Option<NaiveDate> {
        self.active_trading_date
    }

    pub fn set_recovery_active(&mut self, active: bool) {
        self.recovery_active = active;
    }

    pub fn stream(&self, trading_date: NaiveDate, stream_id: &str) -> Option<&StreamStateMachine> {
        self.streams
            .get(&StreamJournalRecord::journal_key(trading_date, stream_id))
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Snapshot rows for the status API.
    pub fn stream_summaries(&self) -> Vec<serde_json::Value> {
        self.streams
            .values()
            .map(|s| {
                json!({
                    "stream": s.stream_id,
                    "instrument": s.canonical_instrument,
                    "trading_date": s.trading_date,
                    "slot_time": s.slot_time_local,
                    "state": s.state().to_string(),
                    "entry_detected": s.entry_detected(),
                    "committed": s.is_committed(),
                    "bars": s.bar_count(),
                })
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Timetable application
    // -------------------------------------------------------------------------

    /// Apply (or re-apply) the polled timetable. New enabled streams are
    /// created and restored; an attempt to change an initialized stream's
    /// slot time is rejected with an operator alert and the stream keeps its
    /// original slot.
    pub async fn apply_timetable(&mut self, timetable: &Timetable, now: DateTime<Utc>) -> Result<()> {
        let today = self.time_service.trading_date_at(now);
        timetable
            .validate(&self.policy, today)
            .context("timetable rejected")?;

        self.active_trading_date = Some(timetable.trading_date);
        self.rollover_utc = Some(
            self.time_service
                .resolve_local(timetable.trading_date, &self.policy.rollover_local)?,
        );

        for row in &timetable.streams {
            let key = StreamJournalRecord::journal_key(timetable.trading_date, &row.stream);

            if let Some(existing) = self.streams.get(&key) {
                if existing.slot_time_local != row.slot_time {
                    self.events.emit(
                        EventLevel::Error,
                        "timetable_slot_change_rejected",
                        &EventScope::stream(
                            row.stream.clone(),
                            row.instrument.clone(),
                            timetable.trading_date,
                        ),
                        json!({
                            "initialized_slot_time": existing.slot_time_local,
                            "requested_slot_time": row.slot_time,
                        }),
                    );
                    self.notifier
                        .notify(
                            "execution-policy-validation-failed",
                            AlertClass::Standard,
                            &format!(
                                "timetable tried to move stream {} from {} to {}; keeping {}",
                                row.stream,
                                existing.slot_time_local,
                                row.slot_time,
                                existing.slot_time_local
                            ),
                        )
                        .await;
                }
                continue;
            }

            if !row.enabled {
                info!(
                    stream = %row.stream,
                    reason = row.block_reason.as_deref().unwrap_or("disabled"),
                    "timetable row disabled — no stream created"
                );
                continue;
            }

            let policy = self
                .policy
                .instrument(&row.instrument)
                .context("timetable validated against policy, instrument must exist")?;
            if !policy.enabled {
                info!(stream = %row.stream, instrument = %row.instrument, "instrument disabled in policy");
                continue;
            }

            let mut stream = StreamStateMachine::new(
                row.stream.clone(),
                row.instrument.clone(),
                row.session,
                row.slot_time.clone(),
                timetable.trading_date,
                policy.clone(),
                &self.time_service,
                &self.policy.market_open_local,
                &self.policy.market_close_local,
                &self.policy.forced_flatten_local,
            )?;

            let ctx = self.ctx();
            let result =
                RestoreLayer::restore(&mut stream, self.policy.min_range_bars, now, &ctx).await?;
            info!(
                stream = %row.stream,
                state = %stream.state(),
                restore = ?result,
                "stream initialized"
            );
            self.streams.insert(key, stream);
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Historical data
    // -------------------------------------------------------------------------

    /// Seed buffers from local day files (FILE source), then run the
    /// retrospective fetch (HISTORICAL source) for every active canonical
    /// instrument. The pending flag is raised synchronously before each
    /// fetch and cleared before its bars are fed, so the first fed bar can
    /// already observe "not pending" and arm the stream.
    pub async fn seed_and_fetch(&mut self, now: DateTime<Utc>) {
        let Some(date) = self.active_trading_date else {
            return;
        };
        let canonicals: Vec<String> = {
            let mut c: Vec<String> = self
                .streams
                .values()
                .filter(|s| s.trading_date == date)
                .map(|s| s.canonical_instrument.clone())
                .collect();
            c.sort();
            c.dedup();
            c
        };

        for canonical in canonicals {
            match historical::load_day(&self.data_root, &canonical, date, Some(now), BarSource::File)
            {
                Ok(bars) => {
                    for bar in bars {
                        self.route_canonical_bar(&canonical, &bar, now).await;
                    }
                }
                Err(e) => {
                    warn!(instrument = %canonical, error = %e, "file seed failed");
                }
            }

            self.run_historical_fetch(&canonical, date, now).await;
        }
    }

    /// One retrospective fetch for a canonical instrument. The end cap is
    /// `now` (buffers already refuse anything past their slot), which covers
    /// the restart-after-open case where bars between slot and now exist.
    pub async fn run_historical_fetch(
        &mut self,
        canonical: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) {
        self.fetch_pending.insert(canonical.to_string(), true);

        let loaded =
            historical::load_day(&self.data_root, canonical, date, Some(now), BarSource::Historical);

        // Clear BEFORE feeding: the first fed bar must already observe the
        // completed fetch so PRE_HYDRATION streams transition immediately.
        self.fetch_pending.insert(canonical.to_string(), false);

        match loaded {
            Ok(bars) => {
                let count = bars.len();
                for bar in bars {
                    self.route_canonical_bar(canonical, &bar, now).await;
                }
                info!(instrument = %canonical, bars = count, "historical fetch complete");
            }
            Err(e) => {
                self.events.emit(
                    EventLevel::Error,
                    "historical_fetch_failed",
                    &EventScope::engine(),
                    json!({ "instrument": canonical, "error": e.to_string() }),
                );
            }
        }
    }

    pub fn historical_pending(&self, canonical: &str) -> bool {
        *self.fetch_pending.get(canonical).unwrap_or(&false)
    }

    // -------------------------------------------------------------------------
    // Bar routing
    // -------------------------------------------------------------------------

    /// Route a raw feed bar: canonicalize the instrument, then offer the bar
    /// to every matching stream on the active trading date.
    pub async fn route_bar(&mut self, raw_instrument: &str, bar: &Bar, now: DateTime<Utc>) {
        let Some(canonical) = self.policy.canonicalize(raw_instrument) else {
            self.events.emit_rate_limited(
                &format!("unknown_instrument:{raw_instrument}"),
                std::time::Duration::from_secs(60),
                EventLevel::Warn,
                "bar_for_unknown_instrument",
                &EventScope::engine(),
                json!({ "raw_instrument": raw_instrument }),
            );
            return;
        };
        self.route_canonical_bar(&canonical, bar, now).await;
    }

    async fn route_canonical_bar(&mut self, canonical: &str, bar: &Bar, now: DateTime<Utc>) {
        if bar.source == BarSource::Live {
            let newest = self
                .last_bar
                .get(canonical)
                .map_or(true, |prev| bar.open_time_utc > *prev);
            if newest {
                self.last_bar
                    .insert(canonical.to_string(), bar.open_time_utc);
            }
        }

        let Some(date) = self.active_trading_date else {
            return;
        };
        let pending = self.historical_pending(canonical);
        let ctx = self.ctx();

        for stream in self.streams.values_mut() {
            if stream.canonical_instrument != canonical || stream.trading_date != date {
                continue;
            }
            stream.on_bar(bar, now, &ctx);
            // Re-evaluate immediately on admission so a slot boundary does
            // not wait for the next second tick.
            stream.tick(now, pending, &ctx).await;
        }
    }

    // -------------------------------------------------------------------------
    // Execution callbacks
    // -------------------------------------------------------------------------

    /// Dispatch one broker callback to the owning stream.
    pub async fn handle_execution_event(&mut self, event: ExecutionEvent) {
        let ctx = self.ctx();
        match event {
            ExecutionEvent::EntryFill {
                intent_id,
                fill_price,
                delta_quantity,
                utc_now,
            } => {
                let Some(stream) = self
                    .streams
                    .values_mut()
                    .find(|s| s.owns_intent(&intent_id))
                else {
                    warn!(intent_id = %intent_id, "entry fill for unowned intent");
                    return;
                };
                stream
                    .handle_entry_fill(&intent_id, fill_price, delta_quantity, utc_now, &ctx)
                    .await;
            }
            ExecutionEvent::ExitFill {
                intent_id,
                exit_price,
                delta_quantity,
                exit_kind,
                utc_now,
            } => {
                let Some(stream) = self
                    .streams
                    .values_mut()
                    .find(|s| s.owns_intent(&intent_id))
                else {
                    warn!(intent_id = %intent_id, "exit fill for unowned intent");
                    return;
                };
                stream
                    .handle_exit_fill(
                        &intent_id,
                        exit_price,
                        delta_quantity,
                        exit_kind,
                        utc_now,
                        &ctx,
                    )
                    .await;
            }
            ExecutionEvent::Rejected {
                intent_id,
                reason,
                utc_now,
            } => {
                self.events.emit(
                    EventLevel::Error,
                    "order_rejected",
                    &EventScope::engine(),
                    json!({ "intent_id": intent_id, "reason": reason, "utc_now": utc_now }),
                );
            }
            ExecutionEvent::UntrackedFill {
                instrument,
                raw_tag,
                utc_now,
            } => {
                // The adapter already flattened; verify and surface the
                // critical alert.
                let residual = self.adapter.current_position(&instrument).await;
                self.events.emit(
                    EventLevel::Critical,
                    "untracked_fill_flattened",
                    &EventScope::engine(),
                    json!({
                        "instrument": instrument,
                        "raw_tag": raw_tag,
                        "utc_now": utc_now,
                        "residual_position": residual,
                    }),
                );
                self.notifier
                    .notify(
                        "execution-gate-invariant-violation",
                        AlertClass::Emergency,
                        &format!(
                            "untracked fill on {instrument} (tag {raw_tag:?}) — position flattened"
                        ),
                    )
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------------

    /// One engine tick: stall watches, per-stream advancement, rollover.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_tick {
            let gap = now - last;
            if gap > Duration::seconds(TICK_STALL_THRESHOLD_SECS) {
                self.events.emit(
                    EventLevel::Error,
                    "engine_tick_stall",
                    &EventScope::engine(),
                    json!({ "gap_seconds": gap.num_seconds() }),
                );
                self.notifier
                    .notify(
                        "engine-tick-stall-detected",
                        AlertClass::Emergency,
                        &format!("engine tick stalled for {}s", gap.num_seconds()),
                    )
                    .await;
            }
        }
        self.last_tick = Some(now);

        // Kill switch: latch once, flatten everything, stand all streams
        // down. The gate already refuses new submissions independently.
        if !self.kill_latched && self.gate.kill_switch().engaged() {
            self.kill_latched = true;
            self.events.emit(
                EventLevel::Critical,
                "kill_switch_engaged",
                &EventScope::engine(),
                json!({ "path": self.gate.kill_switch().path() }),
            );
            let ctx = self.ctx();
            for stream in self.streams.values_mut() {
                stream.kill(now, &ctx).await;
            }
        }

        self.check_data_stalls(now);

        let pending = self.fetch_pending.clone();
        let ctx = self.ctx();
        for stream in self.streams.values_mut() {
            let p = *pending.get(&stream.canonical_instrument).unwrap_or(&false);
            stream.tick(now, p, &ctx).await;
        }

        if let (Some(rollover), Some(_)) = (self.rollover_utc, self.active_trading_date) {
            if now >= rollover {
                if let Err(e) = self.rollover(now).await {
                    warn!(error = %e, "trading day rollover failed");
                }
            }
        }
    }

    fn check_data_stalls(&self, now: DateTime<Utc>) {
        let stall = Duration::minutes(self.policy.data_stall_minutes);
        for (canonical, last) in &self.last_bar {
            let has_live_stream = self.streams.values().any(|s| {
                s.canonical_instrument == *canonical
                    && !s.is_committed()
                    && s.state() != StreamState::Done
            });
            if has_live_stream && now - *last > stall {
                self.events.emit_rate_limited(
                    &format!("data_stall:{canonical}"),
                    std::time::Duration::from_secs(300),
                    EventLevel::Warn,
                    "market_data_stall",
                    &EventScope::engine(),
                    json!({
                        "instrument": canonical,
                        "last_bar_open": last,
                        "stall_minutes": self.policy.data_stall_minutes,
                    }),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Trading-day rollover
    // -------------------------------------------------------------------------

    /// End-of-day housekeeping: committed streams are dropped; slot-persistent
    /// interrupted streams are carried forward into the next trading date.
    /// New streams for the next date arrive with the next timetable.
    async fn rollover(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(date) = self.active_trading_date else {
            return Ok(());
        };
        let next_date = date
            .succ_opt()
            .context("trading date overflow at rollover")?;

        info!(from = %date, to = %next_date, "trading day rollover");
        self.events.emit(
            EventLevel::Info,
            "trading_day_rollover",
            &EventScope::engine(),
            json!({ "from": date, "to": next_date }),
        );

        let keys: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, s)| s.trading_date == date)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let Some(stream) = self.streams.remove(&key) else {
                continue;
            };

            let carry = stream.execution_interrupted_by_close() && stream.entry_detected();
            if !carry {
                continue;
            }

            // The original entry intent (the one that filled) supplies the
            // re-entry's direction and bracket levels.
            let original = self
                .journal
                .scan_stream(date, &stream.stream_id)?
                .into_iter()
                .find(|e| e.entry_filled_qty_total > 0)
                .map(|e| e.intent);
            let Some(original) = original else {
                warn!(stream = %stream.stream_id, "interrupted stream has no filled intent — not carried");
                continue;
            };
            let Some(policy) = self.policy.instrument(&stream.canonical_instrument) else {
                continue;
            };

            let record = self
                .stream_journals
                .load(date, &stream.stream_id)?
                .unwrap_or_else(|| StreamJournalRecord {
                    trading_date: date,
                    stream_id: stream.stream_id.clone(),
                    last_state: stream.state().to_string(),
                    committed: false,
                    stop_brackets_submitted_at_lock: stream.stop_brackets_submitted(),
                    entry_detected: true,
                    execution_interrupted_by_close: true,
                    slot_instance_key: stream.slot_instance_key.clone(),
                    prior_journal_key: None,
                    reentry_submitted: false,
                    updated_at_utc: Some(now),
                });

            let carried = StreamStateMachine::carried_forward(
                &record,
                &original,
                next_date,
                policy.clone(),
                &self.time_service,
                &self.policy.market_open_local,
                &self.policy.market_close_local,
                &self.policy.forced_flatten_local,
            )?;

            let new_key = StreamJournalRecord::journal_key(next_date, &carried.stream_id);
            info!(
                stream = %carried.stream_id,
                slot_instance_key = %carried.slot_instance_key,
                "slot carried forward for re-entry"
            );
            self.streams.insert(new_key, carried);
        }

        self.active_trading_date = Some(next_date);
        self.rollover_utc = Some(
            self.time_service
                .resolve_local(next_date, &self.policy.rollover_local)?,
        );
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("streams", &self.streams.len())
            .field("active_trading_date", &self.active_trading_date)
            .field("fetch_pending", &self.fetch_pending)
            .finish()
    }
}
