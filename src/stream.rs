// =============================================================================
// Stream State Machine — per-stream breakout lifecycle
// =============================================================================
//
// One stream = one instrument + one session + one slot time on one trading
// date. Lifecycle:
//
//   PRE_HYDRATION -> ARMED -> RANGE_BUILDING -> RANGE_LOCKED -> DONE
//   (any)         -> SUSPENDED_DATA_INSUFFICIENT on unrestorable restart
//
// At the slot time the pre-slot high/low range locks and two opposing
// stop-entry intents bracket it as a broker OCO pair. A fill attaches
// protective stop/target orders sized to the cumulative filled quantity, a
// break-even modification fires once when price crosses the trigger, and the
// forced-flatten point closes any open position without committing the slot
// so the carry-forward path can re-enter next day.
//
// All mutation happens on the engine task; the journal is the source of
// truth and this struct is a cached read model of it.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::config::InstrumentPolicy;
use crate::events::{EventBus, EventLevel, EventScope};
use crate::execution::{
    submit_with_retries, ExecutionAdapter, SubmitError, MAX_SUBMIT_ATTEMPTS,
};
use crate::journal::intent::{
    intent_id as compute_intent_id, reentry_intent_id, slot_instance_key, IntentIdentity,
};
use crate::journal::{
    ExecutionJournal, HydrationLog, HydrationRecord, Intent, RangesLog, StreamJournalRecord,
    StreamJournalStore,
};
use crate::notify::{AlertClass, Notifier};
use crate::risk::{GateContext, RiskGate};
use crate::time_service::TimeService;
use crate::types::{round_to_tick, Direction, ExitKind, OrderKind, SessionTag, StreamState};
use crate::market_data::{AdmissionOutcome, Bar, BarBuffer};

/// Shared collaborators a stream needs on every call. Built per tick by the
/// engine; the Arc fields clone cheaply.
#[derive(Clone)]
pub struct StreamCtx {
    pub journal: Arc<ExecutionJournal>,
    pub stream_journals: Arc<StreamJournalStore>,
    pub hydration: Arc<HydrationLog>,
    pub ranges: Arc<RangesLog>,
    pub adapter: Arc<dyn ExecutionAdapter>,
    pub gate: Arc<RiskGate>,
    pub events: Arc<EventBus>,
    pub notifier: Arc<Notifier>,
    pub active_trading_date: Option<NaiveDate>,
    pub recovery_active: bool,
}

/// The four derived prices of a locked range. Immutable for the trading date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockedRange {
    pub range_high: f64,
    pub range_low: f64,
    pub freeze_close: f64,
    pub brk_long: f64,
    pub brk_short: f64,
}

/// Carry-forward payload on a slot-persistent stream: the deterministic
/// market re-entry to submit at next market open.
#[derive(Debug, Clone)]
struct CarryForward {
    reentry_intent: Intent,
}

/// UTC instants derived once at construction; never recomputed.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimes {
    pub range_start_utc: DateTime<Utc>,
    pub slot_time_utc: DateTime<Utc>,
    pub market_open_utc: DateTime<Utc>,
    pub market_close_utc: DateTime<Utc>,
    pub forced_flatten_utc: DateTime<Utc>,
}

pub struct StreamStateMachine {
    // ── Identity ────────────────────────────────────────────────────────
    pub stream_id: String,
    pub canonical_instrument: String,
    pub execution_instrument: String,
    pub session: SessionTag,
    pub slot_time_local: String,
    pub trading_date: NaiveDate,
    pub slot_instance_key: String,

    policy: InstrumentPolicy,
    times: StreamTimes,

    // ── State (cached read model of the journals) ───────────────────────
    state: StreamState,
    bars: BarBuffer,
    range: Option<LockedRange>,
    long_intent: Option<Intent>,
    short_intent: Option<Intent>,
    active_intent_id: Option<String>,
    entry_detected: bool,
    stop_brackets_submitted: bool,
    be_applied: bool,
    execution_interrupted_by_close: bool,
    committed: bool,
    stood_down: bool,
    is_restart: bool,
    reentry_submitted: bool,
    prior_journal_key: Option<String>,
    carry_forward: Option<CarryForward>,
    last_price: Option<(DateTime<Utc>, f64)>,
}

impl StreamStateMachine {
    /// Create a fresh stream for a trading date. All scheduling instants are
    /// resolved here, once.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream_id: impl Into<String>,
        canonical_instrument: impl Into<String>,
        session: SessionTag,
        slot_time_local: impl Into<String>,
        trading_date: NaiveDate,
        policy: InstrumentPolicy,
        time_service: &TimeService,
        market_open_local: &str,
        market_close_local: &str,
        forced_flatten_local: &str,
    ) -> Result<Self> {
        let stream_id = stream_id.into();
        let canonical_instrument = canonical_instrument.into();
        let slot_time_local = slot_time_local.into();

        let range_start_utc =
            time_service.resolve_local(trading_date, session.range_start_local())?;
        let slot_time_utc = time_service.resolve_local(trading_date, &slot_time_local)?;
        let market_open_utc = time_service.resolve_local(trading_date, market_open_local)?;
        let market_close_utc = time_service.resolve_local(trading_date, market_close_local)?;
        let forced_flatten_utc = time_service.resolve_local(trading_date, forced_flatten_local)?;

        let times = StreamTimes {
            range_start_utc,
            slot_time_utc,
            market_open_utc,
            market_close_utc,
            forced_flatten_utc,
        };

        let key = slot_instance_key(&stream_id, &slot_time_local, trading_date);

        Ok(Self {
            execution_instrument: policy.execution_instrument.clone(),
            stream_id,
            canonical_instrument,
            session,
            slot_time_local,
            trading_date,
            slot_instance_key: key,
            policy,
            times,
            state: StreamState::PreHydration,
            bars: BarBuffer::new(range_start_utc, slot_time_utc),
            range: None,
            long_intent: None,
            short_intent: None,
            active_intent_id: None,
            entry_detected: false,
            stop_brackets_submitted: false,
            be_applied: false,
            execution_interrupted_by_close: false,
            committed: false,
            stood_down: false,
            is_restart: false,
            reentry_submitted: false,
            prior_journal_key: None,
            carry_forward: None,
            last_price: None,
        })
    }

    /// Build the next-day continuation of a slot whose position was force
    /// flattened. Preserves the slot instance key and carries the original
    /// intent's bracket levels into a deterministic market re-entry.
    #[allow(clippy::too_many_arguments)]
    pub fn carried_forward(
        prior: &StreamJournalRecord,
        original_intent: &Intent,
        new_trading_date: NaiveDate,
        policy: InstrumentPolicy,
        time_service: &TimeService,
        market_open_local: &str,
        market_close_local: &str,
        forced_flatten_local: &str,
    ) -> Result<Self> {
        let mut stream = Self::new(
            prior.stream_id.clone(),
            original_intent.canonical_instrument.clone(),
            original_intent.session,
            original_intent.slot_time_local.clone(),
            new_trading_date,
            policy,
            time_service,
            market_open_local,
            market_close_local,
            forced_flatten_local,
        )?;

        // The carried slot keeps its original identity; it does not start a
        // new range cycle.
        stream.slot_instance_key = prior.slot_instance_key.clone();
        stream.prior_journal_key = Some(StreamJournalRecord::journal_key(
            prior.trading_date,
            &prior.stream_id,
        ));
        stream.state = StreamState::RangeLocked;

        let reentry_id = reentry_intent_id(&prior.slot_instance_key);
        let mut reentry = original_intent.clone();
        reentry.intent_id = reentry_id;
        reentry.trading_date = new_trading_date;
        reentry.order_kind = OrderKind::Market;
        reentry.oco_group_id = None;
        reentry.slot_instance_key = prior.slot_instance_key.clone();

        stream.carry_forward = Some(CarryForward {
            reentry_intent: reentry,
        });
        Ok(stream)
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn range(&self) -> Option<&LockedRange> {
        self.range.as_ref()
    }

    pub fn entry_detected(&self) -> bool {
        self.entry_detected
    }

    pub fn stop_brackets_submitted(&self) -> bool {
        self.stop_brackets_submitted
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_stood_down(&self) -> bool {
        self.stood_down
    }

    pub fn execution_interrupted_by_close(&self) -> bool {
        self.execution_interrupted_by_close
    }

    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    pub fn tick_size(&self) -> f64 {
        self.policy.tick_size
    }

    pub fn long_intent(&self) -> Option<&Intent> {
        self.long_intent.as_ref()
    }

    pub fn short_intent(&self) -> Option<&Intent> {
        self.short_intent.as_ref()
    }

    pub fn reentry_intent(&self) -> Option<&Intent> {
        self.carry_forward.as_ref().map(|c| &c.reentry_intent)
    }

    /// Is this stream the owner of a fill for `intent_id`?
    pub fn owns_intent(&self, intent_id: &str) -> bool {
        self.long_intent
            .as_ref()
            .is_some_and(|i| i.intent_id == intent_id)
            || self
                .short_intent
                .as_ref()
                .is_some_and(|i| i.intent_id == intent_id)
            || self
                .carry_forward
                .as_ref()
                .is_some_and(|c| c.reentry_intent.intent_id == intent_id)
    }

    fn scope(&self) -> EventScope {
        EventScope::stream(
            self.stream_id.clone(),
            self.canonical_instrument.clone(),
            self.trading_date,
        )
    }

    // -------------------------------------------------------------------------
    // Bar ingestion
    // -------------------------------------------------------------------------

    /// Offer a bar for this stream's canonical instrument. Bars inside the
    /// admission window feed the range; every bar updates the last observed
    /// price used by the break-even check.
    pub fn on_bar(&mut self, bar: &Bar, now_utc: DateTime<Utc>, ctx: &StreamCtx) {
        if self.stood_down {
            return;
        }

        // Track the most recent close as the observed market price.
        let newer = self
            .last_price
            .map_or(true, |(prev, _)| bar.open_time_utc >= prev);
        if newer {
            self.last_price = Some((bar.open_time_utc, bar.close));
        }

        let outcome = self.bars.admit(bar.clone(), now_utc);
        match outcome {
            AdmissionOutcome::Admitted | AdmissionOutcome::Replaced(_) => {
                ctx.events.emit(
                    EventLevel::Debug,
                    "bar_admitted",
                    &self.scope(),
                    json!({
                        "open_time_utc": bar.open_time_utc,
                        "source": bar.source.to_string(),
                        "replaced": matches!(outcome, AdmissionOutcome::Replaced(_)),
                        "bar_count": self.bars.len(),
                    }),
                );
            }
            AdmissionOutcome::RejectedOutsideWindow
            | AdmissionOutcome::DroppedLowerPrecedence(_) => {}
            AdmissionOutcome::RejectedMisaligned | AdmissionOutcome::RejectedInProgress => {
                ctx.events.emit_rate_limited(
                    &format!("bar_rejected:{}", self.stream_id),
                    std::time::Duration::from_secs(60),
                    EventLevel::Warn,
                    "bar_rejected",
                    &self.scope(),
                    json!({ "open_time_utc": bar.open_time_utc, "outcome": format!("{outcome:?}") }),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Tick-driven transitions
    // -------------------------------------------------------------------------

    /// Advance the state machine to `now`. `historical_pending` is the
    /// engine's per-instrument fetch interlock flag.
    pub async fn tick(&mut self, now: DateTime<Utc>, historical_pending: bool, ctx: &StreamCtx) {
        if self.stood_down || self.committed {
            return;
        }

        match self.state {
            StreamState::PreHydration => {
                if !historical_pending {
                    self.transition(StreamState::Armed, "historical_fetch_complete", now, ctx);
                } else if now >= self.times.range_start_utc {
                    self.transition(StreamState::Armed, "time_threshold", now, ctx);
                }
            }
            StreamState::Armed => {
                if now >= self.times.range_start_utc {
                    self.transition(StreamState::RangeBuilding, "range_window_open", now, ctx);
                }
            }
            StreamState::RangeBuilding => {
                if now >= self.times.slot_time_utc && !historical_pending {
                    self.try_lock_range(now, ctx).await;
                }
            }
            StreamState::RangeLocked => {
                self.tick_locked(now, ctx).await;
            }
            StreamState::Done | StreamState::SuspendedDataInsufficient => {}
        }
    }

    async fn tick_locked(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        // Restore repair: brackets were never journaled as submitted and no
        // entry is known; journal idempotency makes this safe to re-attempt.
        if self.is_restart
            && !self.stop_brackets_submitted
            && !self.entry_detected
            && self.carry_forward.is_none()
            && now < self.times.market_close_utc
        {
            self.submit_stop_brackets(now, ctx).await;
        }

        // Slot-persistent re-entry at next-day market open.
        if self.carry_forward.is_some() && !self.reentry_submitted && now >= self.times.market_open_utc
        {
            self.submit_reentry(now, ctx).await;
        }

        if self.entry_detected {
            self.check_break_even(now, ctx).await;
        }

        // Forced flatten at session close for a live position.
        if now >= self.times.forced_flatten_utc && !self.execution_interrupted_by_close {
            self.forced_flatten(now, ctx).await;
        }

        // Market close with no entry: cancel the brackets and commit.
        if now >= self.times.market_close_utc && !self.entry_detected {
            self.cancel_pending_entries(ctx).await;
            self.commit("market_close_no_entry", now, ctx);
        }
    }

    // -------------------------------------------------------------------------
    // Range lock
    // -------------------------------------------------------------------------

    async fn try_lock_range(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let Some(raw) = self.bars.compute_range() else {
            ctx.events.emit_rate_limited(
                &format!("range_lock_wait:{}", self.stream_id),
                std::time::Duration::from_secs(60),
                EventLevel::Warn,
                "range_lock_no_bars",
                &self.scope(),
                json!({ "slot_time_utc": self.times.slot_time_utc }),
            );
            return;
        };

        let tick = self.policy.tick_size;
        let range = LockedRange {
            range_high: raw.high,
            range_low: raw.low,
            freeze_close: raw.freeze_close,
            brk_long: round_to_tick(raw.high + tick, tick),
            brk_short: round_to_tick(raw.low - tick, tick),
        };
        self.install_range(range);

        self.persist_hydration(now, ctx);
        self.transition(StreamState::RangeLocked, "range_locked", now, ctx);
        ctx.events.emit(
            EventLevel::Info,
            "range_locked",
            &self.scope(),
            json!({
                "range_high": range.range_high,
                "range_low": range.range_low,
                "freeze_close": range.freeze_close,
                "brk_long": range.brk_long,
                "brk_short": range.brk_short,
                "bar_count": raw.bar_count,
            }),
        );

        // Immediate-entry branch: the freeze close already sits through a
        // breakout level, so a resting stop entry would fill instantly.
        if range.freeze_close >= range.brk_long {
            self.submit_immediate_entry(Direction::Long, now, ctx).await;
        } else if range.freeze_close <= range.brk_short {
            self.submit_immediate_entry(Direction::Short, now, ctx).await;
        } else {
            self.submit_stop_brackets(now, ctx).await;
        }
    }

    /// Install the locked range and derive both leg intents from it.
    fn install_range(&mut self, range: LockedRange) {
        self.range = Some(range);
        self.long_intent = Some(self.build_leg_intent(Direction::Long, &range));
        self.short_intent = Some(self.build_leg_intent(Direction::Short, &range));
    }

    fn build_leg_intent(&self, direction: Direction, range: &LockedRange) -> Intent {
        let tick = self.policy.tick_size;
        let base = self.policy.base_target_points;

        let (entry_price, target_price) = match direction {
            Direction::Long => (
                range.brk_long,
                round_to_tick(range.range_high + base * self.policy.target_ratio, tick),
            ),
            Direction::Short => (
                range.brk_short,
                round_to_tick(range.range_low - base * self.policy.target_ratio, tick),
            ),
        };
        let stop_price = round_to_tick(
            entry_price - direction.sign() * base * self.policy.stop_ratio,
            tick,
        );
        // Stored at construction so restart paths never re-derive it from
        // the range.
        let be_trigger_price =
            entry_price + self.policy.be_fraction * (target_price - entry_price);

        let identity = IntentIdentity {
            trading_date: self.trading_date,
            stream_id: &self.stream_id,
            canonical_instrument: &self.canonical_instrument,
            session: self.session,
            slot_time_local: &self.slot_time_local,
            direction,
            entry_price,
            stop_price,
            target_price,
            be_trigger_price,
        };

        Intent {
            intent_id: compute_intent_id(&identity),
            trading_date: self.trading_date,
            stream_id: self.stream_id.clone(),
            canonical_instrument: self.canonical_instrument.clone(),
            session: self.session,
            slot_time_local: self.slot_time_local.clone(),
            direction,
            entry_price,
            stop_price,
            target_price,
            be_trigger_price,
            execution_instrument: self.execution_instrument.clone(),
            quantity: self.policy.quantity.min(self.policy.max_quantity),
            tick_size: tick,
            contract_multiplier: self.policy.contract_multiplier,
            order_kind: OrderKind::StopMarket,
            oco_group_id: Some(format!("{}:OCO", self.slot_instance_key)),
            slot_instance_key: self.slot_instance_key.clone(),
            slippage_per_contract: self.policy.slippage_per_contract,
            commission_per_contract: self.policy.commission_per_contract,
            fees_per_contract: self.policy.fees_per_contract,
        }
    }

    fn persist_hydration(&self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let Some(range) = self.range else {
            return;
        };
        let record = HydrationRecord {
            ts_utc: now,
            event: "range_locked".to_string(),
            stream: self.stream_id.clone(),
            range_high: Some(range.range_high),
            range_low: Some(range.range_low),
            freeze_close: Some(range.freeze_close),
            brk_long: Some(range.brk_long),
            brk_short: Some(range.brk_short),
        };
        if let Err(e) = ctx.hydration.append(self.trading_date, &record) {
            warn!(stream = %self.stream_id, error = %e, "failed to append hydration record");
        }
        if let Err(e) = ctx.ranges.append(self.trading_date, &record) {
            warn!(stream = %self.stream_id, error = %e, "failed to append ranges record");
        }
    }

    // -------------------------------------------------------------------------
    // Submission paths
    // -------------------------------------------------------------------------

    fn gate_ctx(&self, now: DateTime<Utc>, ctx: &StreamCtx, fail_closed_flatten: bool) -> GateContext {
        GateContext {
            utc_now: now,
            active_trading_date: ctx.active_trading_date,
            stream_state: self.state,
            session_start_utc: self.times.range_start_utc,
            session_end_utc: self.times.forced_flatten_utc,
            recovery_active: ctx.recovery_active,
            fail_closed_flatten,
        }
    }

    /// Submit both stop-entry legs as an OCO pair, skipping any leg already
    /// journaled as submitted.
    async fn submit_stop_brackets(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let (Some(long), Some(short)) = (self.long_intent.clone(), self.short_intent.clone())
        else {
            return;
        };

        for intent in [&long, &short] {
            match self.submit_one_stop_entry(intent, now, ctx).await {
                Ok(()) => {}
                Err(e) => {
                    self.fail_stream(
                        &format!("stop bracket submission failed for {}: {e}", intent.direction),
                        now,
                        ctx,
                    )
                    .await;
                    return;
                }
            }
        }

        self.stop_brackets_submitted = true;
        self.persist_stream_journal(now, ctx);
        ctx.events.emit(
            EventLevel::Info,
            "stop_brackets_submitted",
            &self.scope(),
            json!({
                "long_intent": long.intent_id,
                "short_intent": short.intent_id,
                "brk_long": long.entry_price,
                "brk_short": short.entry_price,
            }),
        );
    }

    async fn submit_one_stop_entry(
        &self,
        intent: &Intent,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) -> Result<()> {
        if ctx
            .journal
            .is_intent_submitted(&intent.intent_id)
            .context("journal idempotency probe failed")?
        {
            info!(intent_id = %intent.intent_id, "bracket leg already journaled — skipping");
            return Ok(());
        }

        if let Err(refusal) = ctx.gate.check(intent, &self.gate_ctx(now, ctx, false)) {
            ctx.events.emit(
                EventLevel::Error,
                "submission_refused",
                &self.scope(),
                json!({ "intent_id": intent.intent_id, "gate": refusal.to_string() }),
            );
            anyhow::bail!("risk gate refused: {refusal}");
        }

        let group = intent
            .oco_group_id
            .clone()
            .unwrap_or_else(|| format!("{}:OCO", self.slot_instance_key));
        let adapter = ctx.adapter.clone();
        let outcome = submit_with_retries("stop_entry", || {
            let adapter = adapter.clone();
            let intent = intent.clone();
            let group = group.clone();
            async move { adapter.submit_stop_entry_order(&intent, &group, now).await }
        })
        .await;

        match outcome {
            Ok(result) => {
                ctx.journal
                    .record_submission(intent, &result.broker_order_id, intent.entry_price, now)?;
                Ok(())
            }
            // The broker already holds an order for this intent: success.
            Err(SubmitError::Duplicate) => {
                ctx.journal
                    .record_submission(intent, "BROKER-DUPLICATE", intent.entry_price, now)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Immediate-entry branch: freeze close breached a level at lock, so a
    /// market entry replaces the stop bracket in that direction.
    async fn submit_immediate_entry(
        &mut self,
        direction: Direction,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        let intent = match direction {
            Direction::Long => self.long_intent.clone(),
            Direction::Short => self.short_intent.clone(),
        };
        let Some(mut intent) = intent else { return };
        intent.order_kind = OrderKind::Market;
        intent.oco_group_id = None;
        // Keep the derived copy so fills resolve to the market-kind intent.
        match direction {
            Direction::Long => self.long_intent = Some(intent.clone()),
            Direction::Short => self.short_intent = Some(intent.clone()),
        }

        if let Ok(true) = ctx.journal.is_intent_submitted(&intent.intent_id) {
            return;
        }
        if let Err(refusal) = ctx.gate.check(&intent, &self.gate_ctx(now, ctx, false)) {
            ctx.events.emit(
                EventLevel::Error,
                "submission_refused",
                &self.scope(),
                json!({ "intent_id": intent.intent_id, "gate": refusal.to_string() }),
            );
            return;
        }

        let adapter = ctx.adapter.clone();
        let submit_intent = intent.clone();
        let outcome = submit_with_retries("immediate_entry", || {
            let adapter = adapter.clone();
            let intent = submit_intent.clone();
            async move {
                adapter
                    .submit_entry_order(&intent, OrderKind::Market, now)
                    .await
            }
        })
        .await;

        match outcome {
            Ok(result) => {
                if let Err(e) = ctx.journal.record_submission(
                    &intent,
                    &result.broker_order_id,
                    intent.entry_price,
                    now,
                ) {
                    warn!(error = %e, "failed to journal immediate entry submission");
                }
                ctx.events.emit(
                    EventLevel::Info,
                    "immediate_entry_submitted",
                    &self.scope(),
                    json!({
                        "intent_id": intent.intent_id,
                        "direction": direction.to_string(),
                        "freeze_close": self.range.map(|r| r.freeze_close),
                    }),
                );
            }
            Err(SubmitError::Duplicate) => {}
            Err(e) => {
                self.fail_stream(&format!("immediate entry submission failed: {e}"), now, ctx)
                    .await;
            }
        }
    }

    /// Once-only market re-entry for a carried-forward slot.
    async fn submit_reentry(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let Some(carry) = self.carry_forward.clone() else {
            return;
        };
        let intent = carry.reentry_intent;

        // Restart safety: the journal decides whether this fired before.
        match ctx.journal.is_intent_submitted(&intent.intent_id) {
            Ok(true) => {
                self.reentry_submitted = true;
                self.persist_stream_journal(now, ctx);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                self.fail_stream(&format!("journal probe failed for re-entry: {e}"), now, ctx)
                    .await;
                return;
            }
        }

        if let Err(refusal) = ctx.gate.check(&intent, &self.gate_ctx(now, ctx, false)) {
            ctx.events.emit(
                EventLevel::Error,
                "submission_refused",
                &self.scope(),
                json!({ "intent_id": intent.intent_id, "gate": refusal.to_string() }),
            );
            return;
        }

        let adapter = ctx.adapter.clone();
        let submit_intent = intent.clone();
        let outcome = submit_with_retries("reentry", || {
            let adapter = adapter.clone();
            let intent = submit_intent.clone();
            async move {
                adapter
                    .submit_entry_order(&intent, OrderKind::Market, now)
                    .await
            }
        })
        .await;

        match outcome {
            Ok(result) => {
                if let Err(e) = ctx.journal.record_submission(
                    &intent,
                    &result.broker_order_id,
                    intent.entry_price,
                    now,
                ) {
                    warn!(error = %e, "failed to journal re-entry submission");
                }
                self.reentry_submitted = true;
                self.persist_stream_journal(now, ctx);
                ctx.events.emit(
                    EventLevel::Info,
                    "reentry_submitted",
                    &self.scope(),
                    json!({
                        "intent_id": intent.intent_id,
                        "slot_instance_key": self.slot_instance_key,
                        "direction": intent.direction.to_string(),
                    }),
                );
            }
            Err(SubmitError::Duplicate) => {
                self.reentry_submitted = true;
                self.persist_stream_journal(now, ctx);
            }
            Err(e) => {
                self.fail_stream(&format!("re-entry submission failed: {e}"), now, ctx)
                    .await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Fill handling
    // -------------------------------------------------------------------------

    /// Entry fill callback (partial or full). `delta_quantity` is this
    /// callback's fill only.
    pub async fn handle_entry_fill(
        &mut self,
        intent_id: &str,
        fill_price: f64,
        delta_quantity: u32,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        if self.stood_down {
            return;
        }

        // The journal is authoritative for the intent context; a fill whose
        // intent is missing or incomplete cannot be protected.
        let entry = match ctx.journal.load(intent_id) {
            Ok(Some(entry)) if entry.intent.protectives_complete() => entry,
            Ok(_) => {
                self.flatten_fail_closed(
                    intent_id,
                    "entry fill with missing or incomplete intent context",
                    now,
                    ctx,
                )
                .await;
                return;
            }
            Err(e) => {
                self.flatten_fail_closed(
                    intent_id,
                    &format!("journal unreadable on entry fill: {e}"),
                    now,
                    ctx,
                )
                .await;
                return;
            }
        };
        if entry.trade_completed {
            warn!(intent_id, "entry fill after completed trade ignored (broker replay)");
            return;
        }
        let intent = entry.intent.clone();

        let entry = match ctx
            .journal
            .record_entry_fill(intent_id, fill_price, delta_quantity, now)
        {
            Ok(entry) => entry,
            Err(e) => {
                self.flatten_fail_closed(
                    intent_id,
                    &format!("failed to journal entry fill: {e}"),
                    now,
                    ctx,
                )
                .await;
                return;
            }
        };

        let first_fill = !self.entry_detected;
        self.entry_detected = true;
        self.active_intent_id = Some(intent_id.to_string());
        self.persist_stream_journal(now, ctx);

        ctx.events.emit(
            EventLevel::Info,
            "entry_fill",
            &self.scope(),
            json!({
                "intent_id": intent_id,
                "fill_price": fill_price,
                "delta_quantity": delta_quantity,
                "cumulative_quantity": entry.entry_filled_qty_total,
                "avg_fill_price": entry.entry_avg_fill_price,
            }),
        );

        // Defensively cancel the opposing pending entry; its protective
        // orders (it has none yet) and other intents are never touched.
        if first_fill {
            if let Some(opposing) = self.opposing_intent_id(intent_id) {
                if let Err(e) = ctx.adapter.cancel_intent_orders(&opposing).await {
                    warn!(intent_id = %opposing, error = %e, "failed to cancel opposing entry");
                }
            }
        }

        // Attach (or resize) protectives to the cumulative filled quantity.
        self.attach_protectives(&intent, entry.entry_filled_qty_total, now, ctx)
            .await;
    }

    fn opposing_intent_id(&self, filled: &str) -> Option<String> {
        let long = self.long_intent.as_ref()?;
        let short = self.short_intent.as_ref()?;
        if long.intent_id == filled {
            Some(short.intent_id.clone())
        } else if short.intent_id == filled {
            Some(long.intent_id.clone())
        } else {
            None
        }
    }

    async fn attach_protectives(
        &mut self,
        intent: &Intent,
        cumulative_qty: u32,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        let group = format!("{}:PROT", self.slot_instance_key);

        let adapter = ctx.adapter.clone();
        let stop_intent = intent.clone();
        let stop_group = group.clone();
        let stop = submit_with_retries("protective_stop", || {
            let adapter = adapter.clone();
            let intent = stop_intent.clone();
            let group = stop_group.clone();
            async move {
                adapter
                    .submit_protective_stop(&intent, intent.stop_price, cumulative_qty, &group)
                    .await
            }
        })
        .await;

        let adapter = ctx.adapter.clone();
        let target_intent = intent.clone();
        let target_group = group.clone();
        let target = submit_with_retries("protective_target", || {
            let adapter = adapter.clone();
            let intent = target_intent.clone();
            let group = target_group.clone();
            async move {
                adapter
                    .submit_target_order(&intent, intent.target_price, cumulative_qty, &group)
                    .await
            }
        })
        .await;

        let stop_ok = matches!(stop, Ok(_) | Err(SubmitError::Duplicate));
        let target_ok = matches!(target, Ok(_) | Err(SubmitError::Duplicate));
        if stop_ok && target_ok {
            ctx.events.emit(
                EventLevel::Info,
                "protectives_attached",
                &self.scope(),
                json!({
                    "intent_id": intent.intent_id,
                    "stop_price": intent.stop_price,
                    "target_price": intent.target_price,
                    "quantity": cumulative_qty,
                }),
            );
        } else {
            self.flatten_fail_closed(
                &intent.intent_id,
                &format!("protective attachment failed after {MAX_SUBMIT_ATTEMPTS} attempts"),
                now,
                ctx,
            )
            .await;
        }
    }

    /// Exit fill callback from a protective stop or target.
    pub async fn handle_exit_fill(
        &mut self,
        intent_id: &str,
        exit_price: f64,
        delta_quantity: u32,
        exit_kind: ExitKind,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        if self.stood_down {
            return;
        }

        let entry = match ctx
            .journal
            .record_exit_fill(intent_id, exit_price, delta_quantity, exit_kind, now)
        {
            Ok(entry) => entry,
            Err(e) => {
                // Overfill or unreadable journal: fatal invariant violation.
                ctx.notifier
                    .notify(
                        "execution-gate-invariant-violation",
                        AlertClass::Emergency,
                        &format!("exit fill rejected for {intent_id}: {e}"),
                    )
                    .await;
                self.flatten_fail_closed(intent_id, &format!("exit fill rejected: {e}"), now, ctx)
                    .await;
                return;
            }
        };

        ctx.events.emit(
            EventLevel::Info,
            "exit_fill",
            &self.scope(),
            json!({
                "intent_id": intent_id,
                "exit_price": exit_price,
                "delta_quantity": delta_quantity,
                "exit_kind": exit_kind.to_string(),
                "cumulative_exit": entry.exit_filled_qty_total,
                "completed": entry.trade_completed,
            }),
        );

        if entry.trade_completed {
            ctx.events.emit(
                EventLevel::Info,
                "trade_completed",
                &self.scope(),
                json!({
                    "intent_id": intent_id,
                    "realized_points": entry.realized_points,
                    "gross_pnl": entry.gross_pnl,
                    "net_pnl": entry.net_pnl,
                    "completion_reason": entry.completion_reason,
                }),
            );
            self.commit("trade_completed", now, ctx);
        }
    }

    // -------------------------------------------------------------------------
    // Break-even modification
    // -------------------------------------------------------------------------

    async fn check_break_even(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        if self.be_applied {
            return;
        }
        let Some(intent_id) = self.active_intent_id.clone() else {
            return;
        };
        let Some((_, price)) = self.last_price else {
            return;
        };

        let Ok(Some(entry)) = ctx.journal.load(&intent_id) else {
            return;
        };
        if entry.be_applied {
            self.be_applied = true;
            return;
        }
        if entry.entry_filled_qty_total == 0 || entry.trade_completed {
            return;
        }

        let intent = &entry.intent;
        let crossed = match intent.direction {
            Direction::Long => price >= intent.be_trigger_price,
            Direction::Short => price <= intent.be_trigger_price,
        };
        if !crossed {
            return;
        }

        // One tick in favor of the position, off the weighted entry price.
        let new_stop = round_to_tick(
            entry.entry_avg_fill_price + intent.direction.sign() * intent.tick_size,
            intent.tick_size,
        );

        let adapter = ctx.adapter.clone();
        let modify_id = intent_id.clone();
        let outcome = submit_with_retries("be_modify", || {
            let adapter = adapter.clone();
            let intent_id = modify_id.clone();
            async move {
                adapter
                    .modify_stop_price(&intent_id, new_stop)
                    .await
                    .map(|()| crate::execution::SubmitResult {
                        broker_order_id: String::new(),
                    })
            }
        })
        .await;

        match outcome {
            Ok(_) => {
                self.be_applied = true;
                if let Err(e) = ctx.journal.mark_be_applied(&intent_id, now) {
                    warn!(error = %e, "failed to journal break-even mark");
                }
                ctx.events.emit(
                    EventLevel::Info,
                    "break_even_applied",
                    &self.scope(),
                    json!({
                        "intent_id": intent_id,
                        "trigger_price": intent.be_trigger_price,
                        "observed_price": price,
                        "new_stop": new_stop,
                    }),
                );
            }
            Err(e) => {
                ctx.events.emit_rate_limited(
                    &format!("be_modify_failed:{}", self.stream_id),
                    std::time::Duration::from_secs(60),
                    EventLevel::Error,
                    "break_even_modify_failed",
                    &self.scope(),
                    json!({ "intent_id": intent_id, "error": e.to_string() }),
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Forced flatten & commit
    // -------------------------------------------------------------------------

    async fn forced_flatten(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let Some(intent_id) = self.active_intent_id.clone() else {
            return;
        };
        // Only a live position is flattened: entry filled, exit incomplete.
        let Ok(Some(entry)) = ctx.journal.load(&intent_id) else {
            return;
        };
        if entry.entry_filled_qty_total == 0
            || entry.trade_completed
            || entry.exit_filled_qty_total >= entry.entry_filled_qty_total
        {
            return;
        }

        if let Err(e) = ctx
            .adapter
            .flatten(&intent_id, &self.execution_instrument, now)
            .await
        {
            warn!(intent_id = %intent_id, error = %e, "forced flatten failed");
        }

        // The slot is deliberately NOT committed: the rollover carry-forward
        // path owns what happens next.
        self.execution_interrupted_by_close = true;
        self.persist_stream_journal(now, ctx);
        ctx.events.emit(
            EventLevel::Warn,
            "forced_flatten",
            &self.scope(),
            json!({
                "intent_id": intent_id,
                "entry_quantity": entry.entry_filled_qty_total,
                "exit_quantity": entry.exit_filled_qty_total,
                "slot_instance_key": self.slot_instance_key,
            }),
        );
    }

    async fn cancel_pending_entries(&self, ctx: &StreamCtx) {
        for intent in [self.long_intent.as_ref(), self.short_intent.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = ctx.adapter.cancel_intent_orders(&intent.intent_id).await {
                warn!(intent_id = %intent.intent_id, error = %e, "failed to cancel pending entry");
            }
        }
    }

    fn commit(&mut self, reason: &str, now: DateTime<Utc>, ctx: &StreamCtx) {
        self.committed = true;
        self.transition(StreamState::Done, reason, now, ctx);
        ctx.events.emit(
            EventLevel::Info,
            "slot_committed",
            &self.scope(),
            json!({ "reason": reason }),
        );
    }

    // -------------------------------------------------------------------------
    // Fail-closed paths
    // -------------------------------------------------------------------------

    async fn flatten_fail_closed(
        &mut self,
        intent_id: &str,
        reason: &str,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        if let Err(e) = ctx
            .adapter
            .flatten(intent_id, &self.execution_instrument, now)
            .await
        {
            warn!(intent_id, error = %e, "fail-closed flatten errored");
        }
        ctx.notifier
            .notify(
                "execution-gate-invariant-violation",
                AlertClass::Emergency,
                &format!("stream {} fail-closed: {reason}", self.stream_id),
            )
            .await;
        self.stand_down(reason, now, ctx);
    }

    async fn fail_stream(&mut self, reason: &str, now: DateTime<Utc>, ctx: &StreamCtx) {
        ctx.notifier
            .notify(
                "execution-gate-invariant-violation",
                AlertClass::Emergency,
                &format!("stream {} failed: {reason}", self.stream_id),
            )
            .await;
        self.stand_down(reason, now, ctx);
    }

    /// Kill-switch stand-down: flatten any open position, then stop
    /// operating for the rest of the process lifetime.
    pub async fn kill(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) {
        if self.stood_down || self.committed {
            return;
        }
        if let Some(intent_id) = self.active_intent_id.clone() {
            if let Ok(Some(entry)) = ctx.journal.load(&intent_id) {
                if entry.entry_filled_qty_total > entry.exit_filled_qty_total {
                    if let Err(e) = ctx
                        .adapter
                        .flatten(&intent_id, &self.execution_instrument, now)
                        .await
                    {
                        warn!(intent_id = %intent_id, error = %e, "kill-switch flatten failed");
                    }
                }
            }
        }
        self.cancel_pending_entries(ctx).await;
        self.stand_down("kill_switch_engaged", now, ctx);
    }

    fn stand_down(&mut self, reason: &str, now: DateTime<Utc>, ctx: &StreamCtx) {
        self.stood_down = true;
        self.persist_stream_journal(now, ctx);
        ctx.events.emit(
            EventLevel::Critical,
            "stream_stand_down",
            &self.scope(),
            json!({ "reason": reason }),
        );
    }

    // -------------------------------------------------------------------------
    // Restore hooks (driven by the restore layer)
    // -------------------------------------------------------------------------

    /// Place the stream directly into RANGE_LOCKED with restored values;
    /// never re-enters PRE_HYDRATION, never recomputes the range from bars.
    pub fn restore_locked(
        &mut self,
        range: LockedRange,
        entry_detected: bool,
        active_intent_id: Option<String>,
        stop_brackets_submitted: bool,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) {
        self.is_restart = true;
        self.install_range(range);
        self.entry_detected = entry_detected;
        self.active_intent_id = active_intent_id;
        self.stop_brackets_submitted = stop_brackets_submitted;
        self.transition(StreamState::RangeLocked, "restored_from_journal", now, ctx);
    }

    /// Mark the restart flag without a state change (pre-lock restarts).
    pub fn mark_restart(&mut self) {
        self.is_restart = true;
    }

    /// Re-apply persisted lifecycle flags from a stream journal record.
    pub fn restore_flags(&mut self, record: &StreamJournalRecord) {
        self.committed = record.committed;
        self.execution_interrupted_by_close = record.execution_interrupted_by_close;
        self.reentry_submitted = record.reentry_submitted;
        if record.committed {
            self.state = StreamState::Done;
        }
    }

    /// Restart expected a locked range but nothing is restorable, or the
    /// stream's journals are unreadable. Manual intervention required.
    pub fn suspend(&mut self, reason: &str, now: DateTime<Utc>, ctx: &StreamCtx) {
        self.transition(StreamState::SuspendedDataInsufficient, reason, now, ctx);
    }

    /// Recompute a previously locked range from refetched bars; only the
    /// restore layer calls this, and only above its bar-count minimum.
    pub async fn relock_from_bars(&mut self, now: DateTime<Utc>, ctx: &StreamCtx) -> bool {
        self.is_restart = true;
        if self.bars.compute_range().is_none() {
            return false;
        }
        self.try_lock_range(now, ctx).await;
        self.state == StreamState::RangeLocked
    }

    // -------------------------------------------------------------------------
    // Transition plumbing
    // -------------------------------------------------------------------------

    fn transition(&mut self, to: StreamState, reason: &str, now: DateTime<Utc>, ctx: &StreamCtx) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        ctx.events.emit(
            EventLevel::Info,
            "stream_transition",
            &self.scope(),
            json!({
                "utc_now": now,
                "from": from.to_string(),
                "to": to.to_string(),
                "reason": reason,
            }),
        );
        self.persist_stream_journal(now, ctx);
    }

    fn persist_stream_journal(&self, now: DateTime<Utc>, ctx: &StreamCtx) {
        let record = StreamJournalRecord {
            trading_date: self.trading_date,
            stream_id: self.stream_id.clone(),
            last_state: self.state.to_string(),
            committed: self.committed,
            stop_brackets_submitted_at_lock: self.stop_brackets_submitted,
            entry_detected: self.entry_detected,
            execution_interrupted_by_close: self.execution_interrupted_by_close,
            slot_instance_key: self.slot_instance_key.clone(),
            prior_journal_key: self.prior_journal_key.clone(),
            reentry_submitted: self.reentry_submitted,
            updated_at_utc: Some(now),
        };
        if let Err(e) = ctx.stream_journals.save(&record) {
            warn!(stream = %self.stream_id, error = %e, "failed to persist stream journal");
        }
    }
}

impl std::fmt::Debug for StreamStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamStateMachine")
            .field("stream_id", &self.stream_id)
            .field("trading_date", &self.trading_date)
            .field("state", &self.state)
            .field("bars", &self.bars.len())
            .field("entry_detected", &self.entry_detected)
            .field("committed", &self.committed)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::{Duration, TimeZone};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 11).unwrap()
    }

    /// 07:30 CDT on 2024-06-11 == 12:30 UTC.
    fn slot_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, 12, 30, 0).unwrap()
    }

    fn feed_range_bars(stream: &mut StreamStateMachine, ctx: &StreamCtx) {
        // Three in-window bars: high 4500.00, low 4495.00, freeze 4498.00.
        let now = slot_utc() + Duration::minutes(1);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap();
        stream.on_bar(&bar_at(t0, 4499.00, 4495.00, 4497.00), now, ctx);
        stream.on_bar(
            &bar_at(t0 + Duration::minutes(1), 4500.00, 4496.00, 4499.00),
            now,
            ctx,
        );
        stream.on_bar(
            &bar_at(t0 + Duration::minutes(2), 4499.50, 4496.50, 4498.00),
            now,
            ctx,
        );
    }

    async fn locked_stream(h: &Harness) -> StreamStateMachine {
        let mut stream = make_stream(h, date());
        stream.tick(slot_utc() - Duration::hours(3), false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::Armed);
        stream
            .tick(slot_utc() - Duration::hours(2), false, &h.ctx)
            .await;
        assert_eq!(stream.state(), StreamState::RangeBuilding);

        feed_range_bars(&mut stream, &h.ctx);
        stream.tick(slot_utc(), false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::RangeLocked);
        stream
    }

    #[tokio::test]
    async fn pre_hydration_arms_on_fetch_complete() {
        let h = harness(date());
        let mut stream = make_stream(&h, date());
        assert_eq!(stream.state(), StreamState::PreHydration);

        // Fetch pending and before range start: no transition.
        let early = Utc.with_ymd_and_hms(2024, 6, 11, 5, 0, 0).unwrap();
        stream.tick(early, true, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::PreHydration);

        // Fetch completes: ARMED.
        stream.tick(early, false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::Armed);
    }

    #[tokio::test]
    async fn pre_hydration_arms_on_time_threshold() {
        let h = harness(date());
        let mut stream = make_stream(&h, date());
        // Fetch still pending but range window already open.
        let in_window = Utc.with_ymd_and_hms(2024, 6, 11, 7, 30, 0).unwrap();
        stream.tick(in_window, true, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::Armed);
    }

    #[tokio::test]
    async fn range_locks_with_breakout_levels_and_brackets() {
        let h = harness(date());
        let stream = locked_stream(&h).await;

        let range = stream.range().unwrap();
        assert!((range.range_high - 4500.00).abs() < 1e-9);
        assert!((range.range_low - 4495.00).abs() < 1e-9);
        assert!((range.freeze_close - 4498.00).abs() < 1e-9);
        assert!((range.brk_long - 4500.25).abs() < 1e-9);
        assert!((range.brk_short - 4494.75).abs() < 1e-9);

        assert!(stream.stop_brackets_submitted());
        let long = stream.long_intent().unwrap();
        let short = stream.short_intent().unwrap();
        assert!((long.target_price - 4510.00).abs() < 1e-9);
        assert!((short.target_price - 4485.00).abs() < 1e-9);
        assert!((long.stop_price - 4495.25).abs() < 1e-9);

        // be_trigger = entry + 0.65 * (target - entry)
        let expected_be = 4500.25 + 0.65 * (4510.00 - 4500.25);
        assert!((long.be_trigger_price - expected_be).abs() < 1e-9);

        // Both legs journaled as submitted.
        assert!(h.ctx.journal.is_intent_submitted(&long.intent_id).unwrap());
        assert!(h.ctx.journal.is_intent_submitted(&short.intent_id).unwrap());

        // Hydration log holds the locked range.
        let restored = h
            .ctx
            .hydration
            .latest_range_for(date(), "ES-0730")
            .unwrap()
            .unwrap();
        assert!((restored.range_high - 4500.00).abs() < 1e-9);
        assert_eq!(restored.brk_long, Some(4500.25));
    }

    #[tokio::test]
    async fn range_lock_waits_for_pending_fetch() {
        let h = harness(date());
        let mut stream = make_stream(&h, date());
        stream
            .tick(slot_utc() - Duration::hours(2), false, &h.ctx)
            .await;
        feed_range_bars(&mut stream, &h.ctx);

        stream.tick(slot_utc(), true, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::RangeBuilding);

        stream.tick(slot_utc(), false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::RangeLocked);
    }

    #[tokio::test]
    async fn immediate_entry_branch_skips_brackets() {
        let h = harness(date());
        let mut stream = make_stream(&h, date());
        stream
            .tick(slot_utc() - Duration::hours(2), false, &h.ctx)
            .await;

        // A consistent OHLC bar can never close above range_high + tick, so
        // this branch only triggers on malformed feed data. Fabricate a bar
        // whose close exceeds its own high: range_high 4500.00 gives
        // brk_long 4500.25 <= freeze_close 4501.00.
        let now = slot_utc() + Duration::minutes(1);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap();
        stream.on_bar(&bar_at(t0, 4500.00, 4495.00, 4497.00), now, &h.ctx);
        stream.on_bar(
            &bar_at(t0 + Duration::minutes(1), 4499.00, 4496.00, 4501.00),
            now,
            &h.ctx,
        );

        stream.tick(slot_utc(), false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::RangeLocked);

        // No stop brackets; the long intent was submitted as market instead.
        assert!(!stream.stop_brackets_submitted());
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        assert!(h.ctx.journal.is_intent_submitted(&long_id).unwrap());
    }

    #[tokio::test]
    async fn entry_fill_attaches_protectives_and_cancels_opposite() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let short_id = stream.short_intent().unwrap().intent_id.clone();

        let fill_at = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, fill_at, &h.ctx)
            .await;

        assert!(stream.entry_detected());
        let entry = h.ctx.journal.load(&long_id).unwrap().unwrap();
        assert_eq!(entry.entry_filled_qty_total, 1);
        assert!((entry.entry_avg_fill_price - 4500.50).abs() < 1e-9);

        // Protectives live at the configured prices, sized to the fill.
        assert_eq!(h.sim.protective_stop_price(&long_id), Some(4495.25));
        assert_eq!(h.sim.protective_stop_quantity(&long_id), Some(1));
        // The opposing short entry order is gone.
        assert_eq!(h.sim.open_order_count(&short_id), 0);
    }

    #[tokio::test]
    async fn partial_fills_resize_protectives_not_duplicate() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();

        let t = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx)
            .await;
        stream
            .handle_entry_fill(&long_id, 4500.75, 1, t + Duration::seconds(5), &h.ctx)
            .await;

        let entry = h.ctx.journal.load(&long_id).unwrap().unwrap();
        assert_eq!(entry.entry_filled_qty_total, 2);
        assert!((entry.entry_avg_fill_price - 4500.625).abs() < 1e-9);

        // One stop + one target, resized — never a second bracket.
        assert_eq!(h.sim.protective_order_count(&long_id), 2);
        assert_eq!(h.sim.protective_stop_quantity(&long_id), Some(2));
    }

    #[tokio::test]
    async fn break_even_fires_once_at_trigger() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let t = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx)
            .await;

        let be_trigger = stream.long_intent().unwrap().be_trigger_price;

        // Below trigger: no modification.
        let below = bar_at(
            Utc.with_ymd_and_hms(2024, 6, 11, 12, 40, 0).unwrap(),
            be_trigger - 1.0,
            4500.0,
            be_trigger - 1.0,
        );
        stream.on_bar(&below, t + Duration::minutes(11), &h.ctx);
        stream.tick(t + Duration::minutes(11), false, &h.ctx).await;
        assert_eq!(h.sim.protective_stop_price(&long_id), Some(4495.25));

        // Through the trigger: stop moves to entry_avg + 1 tick.
        let above = bar_at(
            Utc.with_ymd_and_hms(2024, 6, 11, 12, 45, 0).unwrap(),
            be_trigger + 1.0,
            4500.0,
            be_trigger + 0.5,
        );
        stream.on_bar(&above, t + Duration::minutes(16), &h.ctx);
        stream.tick(t + Duration::minutes(16), false, &h.ctx).await;
        assert_eq!(h.sim.protective_stop_price(&long_id), Some(4500.75));
        assert!(h.ctx.journal.load(&long_id).unwrap().unwrap().be_applied);

        // Second crossing does not modify again: park the stop at a sentinel
        // and confirm the stream leaves it alone.
        h.sim.modify_stop_price(&long_id, 4499.00).await.unwrap();
        stream.tick(t + Duration::minutes(17), false, &h.ctx).await;
        assert_eq!(h.sim.protective_stop_price(&long_id), Some(4499.00));
    }

    #[tokio::test]
    async fn target_exit_completes_and_commits() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let t = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx)
            .await;

        stream
            .handle_exit_fill(
                &long_id,
                4510.00,
                1,
                ExitKind::Target,
                t + Duration::minutes(30),
                &h.ctx,
            )
            .await;

        assert_eq!(stream.state(), StreamState::Done);
        assert!(stream.is_committed());
        let entry = h.ctx.journal.load(&long_id).unwrap().unwrap();
        assert!(entry.trade_completed);
        assert!((entry.realized_points - 9.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overfill_exit_stands_stream_down() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let t = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx)
            .await;

        stream
            .handle_exit_fill(&long_id, 4510.00, 2, ExitKind::Target, t, &h.ctx)
            .await;

        assert!(stream.is_stood_down());
        assert_eq!(h.sim.current_position("MES").await, 0);
    }

    #[tokio::test]
    async fn market_close_without_entry_commits() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        // 15:00 CDT == 20:00 UTC.
        let close = Utc.with_ymd_and_hms(2024, 6, 11, 20, 0, 0).unwrap();
        stream.tick(close, false, &h.ctx).await;
        assert_eq!(stream.state(), StreamState::Done);
        assert!(stream.is_committed());
    }

    #[tokio::test]
    async fn forced_flatten_sets_interrupted_not_committed() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let t = Utc.with_ymd_and_hms(2024, 6, 11, 19, 0, 0).unwrap();
        stream.handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx).await;

        // 15:55 CDT == 20:55 UTC.
        let flatten_at = Utc.with_ymd_and_hms(2024, 6, 11, 20, 55, 0).unwrap();
        stream.tick(flatten_at, false, &h.ctx).await;

        assert!(stream.execution_interrupted_by_close());
        assert!(!stream.is_committed());
        assert_ne!(stream.state(), StreamState::Done);
        assert_eq!(h.sim.current_position("MES").await, 0);

        let record = h
            .ctx
            .stream_journals
            .load(date(), "ES-0730")
            .unwrap()
            .unwrap();
        assert!(record.execution_interrupted_by_close);
        assert!(!record.committed);
        assert_eq!(record.slot_instance_key, "ES-0730_07:30_2024-06-11");
    }

    #[tokio::test]
    async fn carried_forward_reenters_exactly_once() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        let t = Utc.with_ymd_and_hms(2024, 6, 11, 19, 0, 0).unwrap();
        stream.handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx).await;
        let flatten_at = Utc.with_ymd_and_hms(2024, 6, 11, 20, 55, 0).unwrap();
        stream.tick(flatten_at, false, &h.ctx).await;

        let prior = h
            .ctx
            .stream_journals
            .load(date(), "ES-0730")
            .unwrap()
            .unwrap();
        let original = h.ctx.journal.load(&long_id).unwrap().unwrap().intent;
        let next_date = NaiveDate::from_ymd_opt(2024, 6, 12).unwrap();

        let mut carried = StreamStateMachine::carried_forward(
            &prior,
            &original,
            next_date,
            policy(),
            &h.time_service,
            "08:30",
            "15:00",
            "15:55",
        )
        .unwrap();
        assert_eq!(carried.slot_instance_key, "ES-0730_07:30_2024-06-11");

        let reentry_id = carried.reentry_intent().unwrap().intent_id.clone();
        assert_eq!(reentry_id, reentry_intent_id("ES-0730_07:30_2024-06-11"));

        let mut ctx = h.ctx.clone();
        ctx.active_trading_date = Some(next_date);

        // Before market open on D+1: nothing submitted.
        let before_open = Utc.with_ymd_and_hms(2024, 6, 12, 13, 0, 0).unwrap();
        carried.tick(before_open, false, &ctx).await;
        assert!(!h.ctx.journal.is_intent_submitted(&reentry_id).unwrap());

        // Market open 08:30 CDT == 13:30 UTC: the market re-entry fires.
        let open = Utc.with_ymd_and_hms(2024, 6, 12, 13, 30, 0).unwrap();
        carried.tick(open, false, &ctx).await;
        assert!(h.ctx.journal.is_intent_submitted(&reentry_id).unwrap());

        // A later tick (or restart) does not resubmit.
        carried.tick(open + Duration::minutes(1), false, &ctx).await;
        let entry = h.ctx.journal.load(&reentry_id).unwrap().unwrap();
        assert_eq!(entry.broker_order_id.as_deref().map(|s| s.is_empty()), Some(false));
        assert_eq!(h.sim.open_order_count(&reentry_id), 1);
    }

    #[tokio::test]
    async fn restore_locked_reuses_range_without_resubmission() {
        let h = harness(date());
        // First life: lock and submit brackets.
        let stream = locked_stream(&h).await;
        let range = *stream.range().unwrap();
        let long_id = stream.long_intent().unwrap().intent_id.clone();
        drop(stream);

        // Second life: restored directly into RANGE_LOCKED.
        let mut restored = make_stream(&h, date());
        restored.restore_locked(
            range,
            false,
            None,
            true,
            slot_utc() + Duration::minutes(20),
            &h.ctx,
        );
        assert_eq!(restored.state(), StreamState::RangeLocked);

        // Same derived intent ids, and the journal says already submitted.
        assert_eq!(restored.long_intent().unwrap().intent_id, long_id);
        restored
            .tick(slot_utc() + Duration::minutes(21), false, &h.ctx)
            .await;
        let entry = h.ctx.journal.load(&long_id).unwrap().unwrap();
        assert_eq!(entry.broker_order_id.as_deref(), Some("SIM-1"));
    }

    #[tokio::test]
    async fn protective_failure_flattens_and_stands_down() {
        let h = harness(date());
        let mut stream = locked_stream(&h).await;
        let long_id = stream.long_intent().unwrap().intent_id.clone();

        // Every protective submission attempt fails.
        h.sim.fail_next_submissions(6);
        let t = slot_utc() + Duration::minutes(5);
        stream
            .handle_entry_fill(&long_id, 4500.50, 1, t, &h.ctx)
            .await;

        assert!(stream.is_stood_down());
        assert_eq!(h.sim.current_position("MES").await, 0);
    }
}
