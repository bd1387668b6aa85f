// =============================================================================
// Intent — content-addressed trade specification
// =============================================================================
//
// An intent carries everything needed to attach protective orders after a
// fill without re-querying stream state. Its identity is a SHA-256 hash over
// the canonical field tuple, so two submission attempts for the same levels
// on the same (date, stream, slot) always collide in the journal.
// =============================================================================

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{Direction, OrderKind, SessionTag};

/// A canonical, content-addressed trade specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Deterministic hash of the identity tuple (lowercase hex).
    pub intent_id: String,

    // ── Identity tuple (hashed) ─────────────────────────────────────────
    pub trading_date: NaiveDate,
    pub stream_id: String,
    pub canonical_instrument: String,
    pub session: SessionTag,
    pub slot_time_local: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    /// Price at which the protective stop moves to break-even. Computed at
    /// construction so restart paths never need the range to derive it.
    pub be_trigger_price: f64,

    // ── Execution context (not hashed) ──────────────────────────────────
    pub execution_instrument: String,
    pub quantity: u32,
    pub tick_size: f64,
    pub contract_multiplier: f64,
    pub order_kind: OrderKind,
    /// Deterministic OCO group for the bracket pair this intent belongs to.
    pub oco_group_id: Option<String>,
    /// Stable slot identity carried across trading-day rollover.
    pub slot_instance_key: String,

    // ── P&L pass-through rates (per contract, default zero) ─────────────
    #[serde(default)]
    pub slippage_per_contract: f64,
    #[serde(default)]
    pub commission_per_contract: f64,
    #[serde(default)]
    pub fees_per_contract: f64,
}

/// Identity fields an intent is hashed over, in hash order.
pub struct IntentIdentity<'a> {
    pub trading_date: NaiveDate,
    pub stream_id: &'a str,
    pub canonical_instrument: &'a str,
    pub session: SessionTag,
    pub slot_time_local: &'a str,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_price: f64,
    pub be_trigger_price: f64,
}

/// Compute the deterministic intent id for an identity tuple.
pub fn intent_id(identity: &IntentIdentity<'_>) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{:.8}|{:.8}|{:.8}|{:.8}",
        identity.trading_date.format("%Y-%m-%d"),
        identity.stream_id,
        identity.canonical_instrument,
        identity.session,
        identity.slot_time_local,
        identity.direction,
        identity.entry_price,
        identity.stop_price,
        identity.target_price,
        identity.be_trigger_price,
    );
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// Deterministic id for the once-only market re-entry after a forced flatten.
pub fn reentry_intent_id(slot_instance_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(slot_instance_key.as_bytes());
    hasher.update(b"REENTRY");
    hex::encode(hasher.finalize())
}

/// Stable identifier for a slot instance:
/// `{stream_id}_{slot_time_local}_{original_trading_date}`.
pub fn slot_instance_key(
    stream_id: &str,
    slot_time_local: &str,
    original_trading_date: NaiveDate,
) -> String {
    format!(
        "{}_{}_{}",
        stream_id,
        slot_time_local,
        original_trading_date.format("%Y-%m-%d")
    )
}

impl Intent {
    /// True when every field required to attach protectives is present and
    /// sane. Submission of protective orders must not proceed otherwise.
    pub fn protectives_complete(&self) -> bool {
        self.stop_price.is_finite()
            && self.stop_price > 0.0
            && self.target_price.is_finite()
            && self.target_price > 0.0
    }
}
