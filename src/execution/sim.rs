// =============================================================================
// Simulated Execution Adapter — in-process broker with OCO semantics
// =============================================================================
//
// Implements the full adapter contract against an in-memory order book:
// stop entries trigger on observed prices, OCO siblings cancel on fill, and
// fills re-enter the core through the execution event channel as deltas.
//
// Also models the failure surfaces the core must survive: duplicate
// submissions, transient broker errors, tag-verification failure, the
// accept/fill callback race, foreign-instrument callbacks, and untracked
// fills. Test hooks drive each one deterministically.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::execution::tag::{decode_tag, encode_tag};
use crate::execution::{ExecutionAdapter, ExecutionEvent, SubmitError, SubmitResult};
use crate::journal::Intent;
use crate::types::{Direction, ExitKind, OrderKind};

/// Spacing between lookup retries when a fill callback races the accept
/// callback.
const ACCEPT_RACE_RETRY_SPACING: StdDuration = StdDuration::from_millis(100);
const ACCEPT_RACE_MAX_RETRIES: u32 = 3;

/// Minimum interval between warnings about callbacks for foreign instruments.
const FOREIGN_WARN_INTERVAL: StdDuration = StdDuration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderRole {
    Entry,
    ProtectiveStop,
    ProtectiveTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderStatus {
    /// Created locally, accept callback not yet processed.
    Initialized,
    Accepted,
    Filled,
    Cancelled,
}

#[derive(Debug, Clone)]
struct SimOrder {
    broker_order_id: String,
    intent_id: String,
    tag: String,
    instrument: String,
    direction: Direction,
    role: OrderRole,
    kind: OrderKind,
    price: f64,
    quantity: u32,
    oco_group_id: Option<String>,
    status: OrderStatus,
}

impl SimOrder {
    fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Initialized | OrderStatus::Accepted)
    }
}

#[derive(Default)]
struct SimInner {
    orders: HashMap<String, SimOrder>,
    positions: HashMap<String, i64>,
}

/// In-process simulated broker.
pub struct SimAdapter {
    execution_instrument: String,
    events_tx: mpsc::Sender<ExecutionEvent>,
    inner: RwLock<SimInner>,
    next_order_seq: AtomicU64,
    foreign_warn: Mutex<HashMap<String, Instant>>,

    // ── Test hooks ──────────────────────────────────────────────────────
    /// Force the next N submissions to fail transiently.
    fail_next_submissions: AtomicU32,
    /// Force tag verification to fail (both the attempt and its one retry).
    fail_tag_verification: AtomicBool,
    /// Keep newly created orders in Initialized (accept callback withheld).
    hold_acceptance: AtomicBool,
}

impl SimAdapter {
    pub fn new(
        execution_instrument: impl Into<String>,
        events_tx: mpsc::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            execution_instrument: execution_instrument.into(),
            events_tx,
            inner: RwLock::new(SimInner::default()),
            next_order_seq: AtomicU64::new(1),
            foreign_warn: Mutex::new(HashMap::new()),
            fail_next_submissions: AtomicU32::new(0),
            fail_tag_verification: AtomicBool::new(false),
            hold_acceptance: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Test hooks
    // -------------------------------------------------------------------------

    pub fn fail_next_submissions(&self, n: u32) {
        self.fail_next_submissions.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_tag_verification(&self, fail: bool) {
        self.fail_tag_verification.store(fail, Ordering::SeqCst);
    }

    pub fn set_hold_acceptance(&self, hold: bool) {
        self.hold_acceptance.store(hold, Ordering::SeqCst);
    }

    /// Release all withheld accept callbacks.
    pub fn release_held_acceptances(&self) {
        self.hold_acceptance.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write();
        for order in inner.orders.values_mut() {
            if order.status == OrderStatus::Initialized {
                order.status = OrderStatus::Accepted;
            }
        }
    }

    /// Count of open orders for an intent (any role).
    pub fn open_order_count(&self, intent_id: &str) -> usize {
        self.inner
            .read()
            .orders
            .values()
            .filter(|o| o.intent_id == intent_id && o.is_open())
            .count()
    }

    /// Current price of the protective stop for an intent, if open.
    pub fn protective_stop_price(&self, intent_id: &str) -> Option<f64> {
        self.inner
            .read()
            .orders
            .values()
            .find(|o| {
                o.intent_id == intent_id && o.role == OrderRole::ProtectiveStop && o.is_open()
            })
            .map(|o| o.price)
    }

    /// Current quantity of the protective stop for an intent, if open.
    pub fn protective_stop_quantity(&self, intent_id: &str) -> Option<u32> {
        self.inner
            .read()
            .orders
            .values()
            .find(|o| {
                o.intent_id == intent_id && o.role == OrderRole::ProtectiveStop && o.is_open()
            })
            .map(|o| o.quantity)
    }

    /// Total number of protective orders ever created for an intent,
    /// including filled/cancelled ones. Partial-fill handling must keep this
    /// at two (one stop, one target), resized in place.
    pub fn protective_order_count(&self, intent_id: &str) -> usize {
        self.inner
            .read()
            .orders
            .values()
            .filter(|o| {
                o.intent_id == intent_id
                    && matches!(
                        o.role,
                        OrderRole::ProtectiveStop | OrderRole::ProtectiveTarget
                    )
            })
            .count()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_order_id(&self) -> String {
        format!("SIM-{}", self.next_order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn take_forced_failure(&self) -> bool {
        self.fail_next_submissions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn initial_status(&self) -> OrderStatus {
        if self.hold_acceptance.load(Ordering::SeqCst) {
            OrderStatus::Initialized
        } else {
            OrderStatus::Accepted
        }
    }

    /// Create an order, enforcing tag integrity: the tag is set, verified by
    /// decoding, and retried once. Final verification failure aborts order
    /// creation and removes the order from the map.
    fn create_order(
        &self,
        intent: &Intent,
        role: OrderRole,
        kind: OrderKind,
        price: f64,
        quantity: u32,
        oco_group_id: Option<String>,
    ) -> Result<SubmitResult, SubmitError> {
        if self.take_forced_failure() {
            return Err(SubmitError::Transient("simulated broker failure".to_string()));
        }

        let leg = match role {
            OrderRole::Entry => None,
            OrderRole::ProtectiveStop => Some(ExitKind::Stop),
            OrderRole::ProtectiveTarget => Some(ExitKind::Target),
        };
        let tag = encode_tag(&intent.intent_id, leg);
        let broker_order_id = self.next_order_id();

        let order = SimOrder {
            broker_order_id: broker_order_id.clone(),
            intent_id: intent.intent_id.clone(),
            tag: tag.clone(),
            instrument: intent.execution_instrument.clone(),
            direction: intent.direction,
            role,
            kind,
            price,
            quantity,
            oco_group_id,
            status: self.initial_status(),
        };
        self.inner
            .write()
            .orders
            .insert(broker_order_id.clone(), order);

        // Verify the tag round-trips; retry once.
        let mut verified = false;
        for _ in 0..2 {
            let tampered = self.fail_tag_verification.load(Ordering::SeqCst);
            if !tampered && decode_tag(&tag).map(|(id, _)| id) == Some(intent.intent_id.clone()) {
                verified = true;
                break;
            }
        }
        if !verified {
            self.inner.write().orders.remove(&broker_order_id);
            return Err(SubmitError::Fatal(format!(
                "tag verification failed for intent {}",
                intent.intent_id
            )));
        }

        debug!(
            broker_order_id = %broker_order_id,
            intent_id = %intent.intent_id,
            role = ?role,
            price,
            quantity,
            "sim order created"
        );
        Ok(SubmitResult { broker_order_id })
    }

    fn cancel_oco_siblings(inner: &mut SimInner, filled_order_id: &str) {
        let Some(filled) = inner.orders.get(filled_order_id).cloned() else {
            return;
        };
        let Some(group) = filled.oco_group_id.clone() else {
            return;
        };
        for order in inner.orders.values_mut() {
            if order.broker_order_id != filled.broker_order_id
                && order.oco_group_id.as_deref() == Some(group.as_str())
                && order.is_open()
            {
                order.status = OrderStatus::Cancelled;
                debug!(
                    broker_order_id = %order.broker_order_id,
                    group = %group,
                    "OCO sibling cancelled"
                );
            }
        }
    }

    async fn send_event(&self, event: ExecutionEvent) {
        if self.events_tx.send(event).await.is_err() {
            warn!("execution event channel closed");
        }
    }

    /// Fill an open order in place and return its post-fill snapshot.
    fn apply_fill(&self, broker_order_id: &str, quantity: u32) -> Option<SimOrder> {
        let mut inner = self.inner.write();
        let order = inner.orders.get_mut(broker_order_id)?;
        if !order.is_open() {
            return None;
        }
        order.status = OrderStatus::Filled;
        let snapshot = order.clone();

        let position_delta = match snapshot.role {
            OrderRole::Entry => snapshot.direction.sign() as i64 * i64::from(quantity),
            // Protective fills close the position.
            OrderRole::ProtectiveStop | OrderRole::ProtectiveTarget => {
                -(snapshot.direction.sign() as i64) * i64::from(quantity)
            }
        };
        *inner
            .positions
            .entry(snapshot.instrument.clone())
            .or_insert(0) += position_delta;

        Self::cancel_oco_siblings(&mut inner, broker_order_id);
        Some(snapshot)
    }

    // -------------------------------------------------------------------------
    // Market simulation
    // -------------------------------------------------------------------------

    /// Drive the simulated book with an observed price. Triggered stop
    /// entries and protective orders fill at their order price and emit
    /// fill events.
    pub async fn on_price(&self, instrument: &str, price: f64, utc_now: DateTime<Utc>) {
        let triggered: Vec<SimOrder> = {
            let inner = self.inner.read();
            inner
                .orders
                .values()
                .filter(|o| o.instrument == instrument && o.status == OrderStatus::Accepted)
                .filter(|o| Self::is_triggered(o, price))
                .cloned()
                .collect()
        };

        for order in triggered {
            let Some(filled) = self.apply_fill(&order.broker_order_id, order.quantity) else {
                continue;
            };
            info!(
                broker_order_id = %filled.broker_order_id,
                intent_id = %filled.intent_id,
                role = ?filled.role,
                price = filled.price,
                quantity = filled.quantity,
                "sim order triggered"
            );
            match filled.role {
                OrderRole::Entry => {
                    self.send_event(ExecutionEvent::EntryFill {
                        intent_id: filled.intent_id,
                        fill_price: filled.price,
                        delta_quantity: filled.quantity,
                        utc_now,
                    })
                    .await;
                }
                OrderRole::ProtectiveStop => {
                    self.send_event(ExecutionEvent::ExitFill {
                        intent_id: filled.intent_id,
                        exit_price: filled.price,
                        delta_quantity: filled.quantity,
                        exit_kind: ExitKind::Stop,
                        utc_now,
                    })
                    .await;
                }
                OrderRole::ProtectiveTarget => {
                    self.send_event(ExecutionEvent::ExitFill {
                        intent_id: filled.intent_id,
                        exit_price: filled.price,
                        delta_quantity: filled.quantity,
                        exit_kind: ExitKind::Target,
                        utc_now,
                    })
                    .await;
                }
            }
        }
    }

    fn is_triggered(order: &SimOrder, price: f64) -> bool {
        match (order.role, order.direction) {
            // Stop entries trigger through the breakout level.
            (OrderRole::Entry, Direction::Long) => {
                order.kind == OrderKind::StopMarket && price >= order.price
            }
            (OrderRole::Entry, Direction::Short) => {
                order.kind == OrderKind::StopMarket && price <= order.price
            }
            // Protective stops close against the position.
            (OrderRole::ProtectiveStop, Direction::Long) => price <= order.price,
            (OrderRole::ProtectiveStop, Direction::Short) => price >= order.price,
            (OrderRole::ProtectiveTarget, Direction::Long) => price >= order.price,
            (OrderRole::ProtectiveTarget, Direction::Short) => price <= order.price,
        }
    }

    // -------------------------------------------------------------------------
    // Raw broker callback path (tag decoding, races, foreign instruments)
    // -------------------------------------------------------------------------

    /// Process a raw execution callback as delivered by a broker SDK.
    ///
    /// * Foreign instrument → rate-limited warning, ignored.
    /// * Undecodable tag → flatten the instrument, emit UntrackedFill.
    /// * Order still Initialized → retry the lookup (accept-race policy);
    ///   unresolved after retries → untracked path.
    pub async fn inject_execution(
        &self,
        raw_tag: &str,
        instrument: &str,
        price: f64,
        delta_quantity: u32,
        utc_now: DateTime<Utc>,
    ) {
        if instrument != self.execution_instrument {
            let mut warns = self.foreign_warn.lock();
            let now = Instant::now();
            let due = warns
                .get(instrument)
                .map_or(true, |last| now.duration_since(*last) >= FOREIGN_WARN_INTERVAL);
            if due {
                warns.insert(instrument.to_string(), now);
                warn!(
                    instrument,
                    expected = %self.execution_instrument,
                    "execution callback for foreign instrument ignored"
                );
            }
            return;
        }

        let Some((intent_id, leg)) = decode_tag(raw_tag) else {
            warn!(raw_tag, instrument, "undecodable order tag — flattening");
            self.force_flat(instrument);
            self.send_event(ExecutionEvent::UntrackedFill {
                instrument: instrument.to_string(),
                raw_tag: raw_tag.to_string(),
                utc_now,
            })
            .await;
            return;
        };

        // Accept-race policy: the fill callback may arrive before the order
        // leaves Initialized.
        let mut resolved = None;
        for attempt in 0..=ACCEPT_RACE_MAX_RETRIES {
            let status = {
                let inner = self.inner.read();
                inner
                    .orders
                    .values()
                    .find(|o| o.tag == raw_tag && o.status != OrderStatus::Cancelled)
                    .map(|o| (o.broker_order_id.clone(), o.status))
            };
            match status {
                Some((order_id, OrderStatus::Initialized)) if attempt < ACCEPT_RACE_MAX_RETRIES => {
                    debug!(order_id = %order_id, attempt, "fill raced order acceptance — retrying lookup");
                    tokio::time::sleep(ACCEPT_RACE_RETRY_SPACING).await;
                }
                Some((order_id, OrderStatus::Initialized)) => {
                    warn!(order_id = %order_id, "order never acknowledged — treating fill as untracked");
                    break;
                }
                Some((order_id, _)) => {
                    resolved = Some(order_id);
                    break;
                }
                None => break,
            }
        }

        let Some(order_id) = resolved else {
            self.force_flat(instrument);
            self.send_event(ExecutionEvent::UntrackedFill {
                instrument: instrument.to_string(),
                raw_tag: raw_tag.to_string(),
                utc_now,
            })
            .await;
            return;
        };

        let Some(filled) = self.apply_fill(&order_id, delta_quantity) else {
            return;
        };
        match (filled.role, leg) {
            (OrderRole::Entry, _) => {
                self.send_event(ExecutionEvent::EntryFill {
                    intent_id,
                    fill_price: price,
                    delta_quantity,
                    utc_now,
                })
                .await;
            }
            (OrderRole::ProtectiveStop, _) => {
                self.send_event(ExecutionEvent::ExitFill {
                    intent_id,
                    exit_price: price,
                    delta_quantity,
                    exit_kind: ExitKind::Stop,
                    utc_now,
                })
                .await;
            }
            (OrderRole::ProtectiveTarget, _) => {
                self.send_event(ExecutionEvent::ExitFill {
                    intent_id,
                    exit_price: price,
                    delta_quantity,
                    exit_kind: ExitKind::Target,
                    utc_now,
                })
                .await;
            }
        }
    }

    fn force_flat(&self, instrument: &str) {
        let mut inner = self.inner.write();
        inner.positions.insert(instrument.to_string(), 0);
        for order in inner.orders.values_mut() {
            if order.instrument == instrument && order.is_open() {
                order.status = OrderStatus::Cancelled;
            }
        }
    }
}

#[async_trait]
impl ExecutionAdapter for SimAdapter {
    async fn submit_entry_order(
        &self,
        intent: &Intent,
        kind: OrderKind,
        _utc_now: DateTime<Utc>,
    ) -> Result<SubmitResult, SubmitError> {
        let duplicate = self.inner.read().orders.values().any(|o| {
            o.intent_id == intent.intent_id
                && o.role == OrderRole::Entry
                && (o.is_open() || o.status == OrderStatus::Filled)
        });
        if duplicate {
            return Err(SubmitError::Duplicate);
        }
        self.create_order(
            intent,
            OrderRole::Entry,
            kind,
            intent.entry_price,
            intent.quantity,
            intent.oco_group_id.clone(),
        )
    }

    async fn submit_stop_entry_order(
        &self,
        intent: &Intent,
        oco_group_id: &str,
        _utc_now: DateTime<Utc>,
    ) -> Result<SubmitResult, SubmitError> {
        let duplicate = self.inner.read().orders.values().any(|o| {
            o.intent_id == intent.intent_id
                && o.role == OrderRole::Entry
                && (o.is_open() || o.status == OrderStatus::Filled)
        });
        if duplicate {
            return Err(SubmitError::Duplicate);
        }
        self.create_order(
            intent,
            OrderRole::Entry,
            OrderKind::StopMarket,
            intent.entry_price,
            intent.quantity,
            Some(oco_group_id.to_string()),
        )
    }

    async fn submit_protective_stop(
        &self,
        intent: &Intent,
        stop_price: f64,
        cumulative_qty: u32,
        oco_group_id: &str,
    ) -> Result<SubmitResult, SubmitError> {
        // Resize in place on repeat calls (partial fills), never stack.
        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.orders.values_mut().find(|o| {
                o.intent_id == intent.intent_id && o.role == OrderRole::ProtectiveStop && o.is_open()
            }) {
                existing.quantity = cumulative_qty;
                existing.price = stop_price;
                return Ok(SubmitResult {
                    broker_order_id: existing.broker_order_id.clone(),
                });
            }
        }
        self.create_order(
            intent,
            OrderRole::ProtectiveStop,
            OrderKind::StopMarket,
            stop_price,
            cumulative_qty,
            Some(oco_group_id.to_string()),
        )
    }

    async fn submit_target_order(
        &self,
        intent: &Intent,
        target_price: f64,
        cumulative_qty: u32,
        oco_group_id: &str,
    ) -> Result<SubmitResult, SubmitError> {
        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.orders.values_mut().find(|o| {
                o.intent_id == intent.intent_id
                    && o.role == OrderRole::ProtectiveTarget
                    && o.is_open()
            }) {
                existing.quantity = cumulative_qty;
                existing.price = target_price;
                return Ok(SubmitResult {
                    broker_order_id: existing.broker_order_id.clone(),
                });
            }
        }
        self.create_order(
            intent,
            OrderRole::ProtectiveTarget,
            OrderKind::Limit,
            target_price,
            cumulative_qty,
            Some(oco_group_id.to_string()),
        )
    }

    async fn modify_stop_price(
        &self,
        intent_id: &str,
        new_stop_price: f64,
    ) -> Result<(), SubmitError> {
        let mut inner = self.inner.write();
        match inner.orders.values_mut().find(|o| {
            o.intent_id == intent_id && o.role == OrderRole::ProtectiveStop && o.is_open()
        }) {
            Some(order) => {
                order.price = new_stop_price;
                Ok(())
            }
            None => Err(SubmitError::Fatal(format!(
                "no open protective stop for intent {intent_id}"
            ))),
        }
    }

    async fn cancel_intent_orders(&self, intent_id: &str) -> Result<(), SubmitError> {
        let mut inner = self.inner.write();
        for order in inner.orders.values_mut() {
            if order.intent_id == intent_id && order.is_open() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn flatten(
        &self,
        intent_id: &str,
        instrument: &str,
        _utc_now: DateTime<Utc>,
    ) -> Result<(), SubmitError> {
        info!(intent_id, instrument, "flatten requested");
        let mut inner = self.inner.write();
        for order in inner.orders.values_mut() {
            if order.intent_id == intent_id && order.is_open() {
                order.status = OrderStatus::Cancelled;
            }
        }
        inner.positions.insert(instrument.to_string(), 0);
        Ok(())
    }

    async fn current_position(&self, instrument: &str) -> i64 {
        *self.inner.read().positions.get(instrument).unwrap_or(&0)
    }
}

impl std::fmt::Debug for SimAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SimAdapter")
            .field("execution_instrument", &self.execution_instrument)
            .field("orders", &inner.orders.len())
            .field("positions", &inner.positions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::intent::{intent_id, IntentIdentity};
    use crate::types::SessionTag;
    use chrono::{NaiveDate, TimeZone};

    fn make_intent(direction: Direction, entry: f64) -> Intent {
        let identity = IntentIdentity {
            trading_date: NaiveDate::from_ymd_opt(2024, 6, 11).unwrap(),
            stream_id: "ES-0730",
            canonical_instrument: "ES",
            session: SessionTag::S1,
            slot_time_local: "07:30",
            direction,
            entry_price: entry,
            stop_price: if direction == Direction::Long {
                entry - 5.0
            } else {
                entry + 5.0
            },
            target_price: if direction == Direction::Long {
                entry + 10.0
            } else {
                entry - 10.0
            },
            be_trigger_price: entry + direction.sign() * 6.5,
        };
        Intent {
            intent_id: intent_id(&identity),
            trading_date: identity.trading_date,
            stream_id: "ES-0730".into(),
            canonical_instrument: "ES".into(),
            session: SessionTag::S1,
            slot_time_local: "07:30".into(),
            direction,
            entry_price: identity.entry_price,
            stop_price: identity.stop_price,
            target_price: identity.target_price,
            be_trigger_price: identity.be_trigger_price,
            execution_instrument: "MES".into(),
            quantity: 1,
            tick_size: 0.25,
            contract_multiplier: 5.0,
            order_kind: OrderKind::StopMarket,
            oco_group_id: Some("grp:OCO".into()),
            slot_instance_key: "ES-0730_07:30_2024-06-11".into(),
            slippage_per_contract: 0.0,
            commission_per_contract: 0.0,
            fees_per_contract: 0.0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, 12, 35, 0).unwrap()
    }

    fn adapter() -> (SimAdapter, mpsc::Receiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (SimAdapter::new("MES", tx), rx)
    }

    #[tokio::test]
    async fn duplicate_entry_submission_rejected() {
        let (sim, _rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.submit_stop_entry_order(&intent, "grp:OCO", now())
            .await
            .unwrap();
        let err = sim
            .submit_stop_entry_order(&intent, "grp:OCO", now())
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::Duplicate);
    }

    #[tokio::test]
    async fn stop_entry_triggers_and_cancels_oco_sibling() {
        let (sim, mut rx) = adapter();
        let long = make_intent(Direction::Long, 4500.25);
        let short = make_intent(Direction::Short, 4494.75);
        sim.submit_stop_entry_order(&long, "grp:OCO", now())
            .await
            .unwrap();
        sim.submit_stop_entry_order(&short, "grp:OCO", now())
            .await
            .unwrap();

        sim.on_price("MES", 4500.50, now()).await;

        match rx.recv().await.unwrap() {
            ExecutionEvent::EntryFill {
                intent_id,
                delta_quantity,
                ..
            } => {
                assert_eq!(intent_id, long.intent_id);
                assert_eq!(delta_quantity, 1);
            }
            other => panic!("expected entry fill, got {other:?}"),
        }
        // The short leg was cancelled by the OCO group.
        assert_eq!(sim.open_order_count(&short.intent_id), 0);
        assert_eq!(sim.current_position("MES").await, 1);
    }

    #[tokio::test]
    async fn protective_resubmission_resizes_in_place() {
        let (sim, _rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);

        sim.submit_protective_stop(&intent, 4495.25, 1, "grp:PROT")
            .await
            .unwrap();
        sim.submit_target_order(&intent, 4510.0, 1, "grp:PROT")
            .await
            .unwrap();
        sim.submit_protective_stop(&intent, 4495.25, 2, "grp:PROT")
            .await
            .unwrap();
        sim.submit_target_order(&intent, 4510.0, 2, "grp:PROT")
            .await
            .unwrap();

        assert_eq!(sim.protective_order_count(&intent.intent_id), 2);
        assert_eq!(sim.protective_stop_quantity(&intent.intent_id), Some(2));
    }

    #[tokio::test]
    async fn protective_target_fill_cancels_stop() {
        let (sim, mut rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.submit_protective_stop(&intent, 4495.25, 1, "grp:PROT")
            .await
            .unwrap();
        sim.submit_target_order(&intent, 4510.0, 1, "grp:PROT")
            .await
            .unwrap();

        sim.on_price("MES", 4510.0, now()).await;

        match rx.recv().await.unwrap() {
            ExecutionEvent::ExitFill {
                exit_kind,
                exit_price,
                ..
            } => {
                assert_eq!(exit_kind, ExitKind::Target);
                assert!((exit_price - 4510.0).abs() < f64::EPSILON);
            }
            other => panic!("expected exit fill, got {other:?}"),
        }
        assert_eq!(sim.open_order_count(&intent.intent_id), 0);
    }

    #[tokio::test]
    async fn modify_stop_price_moves_the_stop() {
        let (sim, _rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.submit_protective_stop(&intent, 4495.25, 1, "grp:PROT")
            .await
            .unwrap();

        sim.modify_stop_price(&intent.intent_id, 4500.75)
            .await
            .unwrap();
        assert_eq!(sim.protective_stop_price(&intent.intent_id), Some(4500.75));
    }

    #[tokio::test]
    async fn tag_verification_failure_aborts_creation() {
        let (sim, _rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.set_fail_tag_verification(true);

        let err = sim
            .submit_stop_entry_order(&intent, "grp:OCO", now())
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Fatal(_)));
        // Fail closed: the aborted order is gone from the map.
        assert_eq!(sim.open_order_count(&intent.intent_id), 0);
    }

    #[tokio::test]
    async fn undecodable_tag_flattens_and_reports_untracked() {
        let (sim, mut rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.submit_stop_entry_order(&intent, "grp:OCO", now())
            .await
            .unwrap();
        sim.on_price("MES", 4500.50, now()).await;
        let _ = rx.recv().await; // entry fill
        assert_eq!(sim.current_position("MES").await, 1);

        sim.inject_execution("GARBAGE-TAG", "MES", 4501.0, 1, now())
            .await;

        match rx.recv().await.unwrap() {
            ExecutionEvent::UntrackedFill { raw_tag, .. } => {
                assert_eq!(raw_tag, "GARBAGE-TAG");
            }
            other => panic!("expected untracked fill, got {other:?}"),
        }
        assert_eq!(sim.current_position("MES").await, 0);
    }

    #[tokio::test]
    async fn foreign_instrument_callback_is_ignored() {
        let (sim, mut rx) = adapter();
        sim.inject_execution("GARBAGE-TAG", "MNQ", 100.0, 1, now())
            .await;
        // No event, no flatten: the callback belongs to another instance.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_race_resolves_after_retry() {
        let (sim, mut rx) = adapter();
        let intent = make_intent(Direction::Long, 4500.25);
        sim.set_hold_acceptance(true);
        sim.submit_stop_entry_order(&intent, "grp:OCO", now())
            .await
            .unwrap();

        let tag = encode_tag(&intent.intent_id, None);
        let inject = sim.inject_execution(&tag, "MES", 4500.50, 1, now());
        let release = async {
            tokio::time::sleep(StdDuration::from_millis(150)).await;
            sim.release_held_acceptances();
        };
        tokio::join!(inject, release);

        match rx.recv().await.unwrap() {
            ExecutionEvent::EntryFill { intent_id, .. } => {
                assert_eq!(intent_id, intent.intent_id);
            }
            other => panic!("expected entry fill after race, got {other:?}"),
        }
    }
}
