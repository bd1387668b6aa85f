// =============================================================================
// Execution — abstract broker adapter contract
// =============================================================================
//
// The core calls these operations; broker SDK glue lives behind them. Fill
// and rejection callbacks re-enter the core as ExecutionEvents on a bounded
// channel drained by the engine task, giving the state machines single-writer
// semantics.
// =============================================================================

pub mod sim;
pub mod tag;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Duration;
use tracing::warn;

use crate::journal::Intent;
use crate::types::{ExitKind, OrderKind};

/// Broker submission retry policy: transient failures retry up to 3 attempts
/// spaced 100 ms apart.
pub const MAX_SUBMIT_ATTEMPTS: u32 = 3;
pub const RETRY_SPACING: Duration = Duration::from_millis(100);

/// Successful submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResult {
    pub broker_order_id: String,
}

/// Typed submission failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// An active or filled order for this intent already exists. The core
    /// treats this as success (idempotent submission).
    Duplicate,
    /// Transient broker failure; eligible for retry.
    Transient(String),
    /// Non-retryable failure (validation, tag integrity, closed session).
    Fatal(String),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Duplicate => write!(f, "duplicate submission"),
            Self::Transient(msg) => write!(f, "transient broker failure: {msg}"),
            Self::Fatal(msg) => write!(f, "fatal broker failure: {msg}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// A broker callback, serialized onto the engine task.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    EntryFill {
        intent_id: String,
        fill_price: f64,
        /// Quantity filled in THIS callback (delta, never cumulative).
        delta_quantity: u32,
        utc_now: DateTime<Utc>,
    },
    ExitFill {
        intent_id: String,
        exit_price: f64,
        delta_quantity: u32,
        exit_kind: ExitKind,
        utc_now: DateTime<Utc>,
    },
    Rejected {
        intent_id: String,
        reason: String,
        utc_now: DateTime<Utc>,
    },
    /// A fill whose tag did not decode to any known intent. The adapter has
    /// already flattened; the engine raises the critical alert.
    UntrackedFill {
        instrument: String,
        raw_tag: String,
        utc_now: DateTime<Utc>,
    },
}

/// Abstract execution venue.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Submit an immediate (market/limit) entry for an intent. Must reject
    /// with [`SubmitError::Duplicate`] when an active or filled order for
    /// this intent id already exists.
    async fn submit_entry_order(
        &self,
        intent: &Intent,
        kind: OrderKind,
        utc_now: DateTime<Utc>,
    ) -> Result<SubmitResult, SubmitError>;

    /// Submit one stop-entry leg of a bracket pair, joined to its sibling by
    /// `oco_group_id`.
    async fn submit_stop_entry_order(
        &self,
        intent: &Intent,
        oco_group_id: &str,
        utc_now: DateTime<Utc>,
    ) -> Result<SubmitResult, SubmitError>;

    /// Submit or resize the protective stop for an intent to the cumulative
    /// filled quantity. Safe to call on every partial fill; implementations
    /// modify the existing order rather than stacking new ones.
    async fn submit_protective_stop(
        &self,
        intent: &Intent,
        stop_price: f64,
        cumulative_qty: u32,
        oco_group_id: &str,
    ) -> Result<SubmitResult, SubmitError>;

    /// Submit or resize the protective target. Same contract as the stop.
    async fn submit_target_order(
        &self,
        intent: &Intent,
        target_price: f64,
        cumulative_qty: u32,
        oco_group_id: &str,
    ) -> Result<SubmitResult, SubmitError>;

    /// Move an intent's protective stop to a new stop price (break-even).
    async fn modify_stop_price(
        &self,
        intent_id: &str,
        new_stop_price: f64,
    ) -> Result<(), SubmitError>;

    /// Cancel open orders tagged with this intent id. Never touches
    /// protective orders belonging to other intents.
    async fn cancel_intent_orders(&self, intent_id: &str) -> Result<(), SubmitError>;

    /// Emergency close of the position attributed to an intent. Used by
    /// fail-closed paths; must succeed even when order state is unclear.
    async fn flatten(
        &self,
        intent_id: &str,
        instrument: &str,
        utc_now: DateTime<Utc>,
    ) -> Result<(), SubmitError>;

    /// Signed net position for an instrument.
    async fn current_position(&self, instrument: &str) -> i64;
}

/// Drive a submission closure through the retry policy. `Duplicate` is
/// returned to the caller unchanged (it is treated as success upstream);
/// `Transient` retries with spacing; `Fatal` aborts immediately.
pub async fn submit_with_retries<F, Fut>(
    op_name: &str,
    mut attempt: F,
) -> Result<SubmitResult, SubmitError>
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = Result<SubmitResult, SubmitError>> + Send,
{
    let mut last_err = SubmitError::Transient("no attempt made".to_string());
    for n in 1..=MAX_SUBMIT_ATTEMPTS {
        match attempt().await {
            Ok(result) => return Ok(result),
            Err(SubmitError::Transient(msg)) => {
                warn!(op = op_name, attempt = n, error = %msg, "submission attempt failed");
                last_err = SubmitError::Transient(msg);
                if n < MAX_SUBMIT_ATTEMPTS {
                    tokio::time::sleep(RETRY_SPACING).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err)
}
