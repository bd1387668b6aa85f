// =============================================================================
// Execution Journal — per-intent fill ledger with atomic persistence
// =============================================================================
//
// One JSON file per intent under `state/intents/`. Every write goes through
// the tmp + rename pattern so a crash can never leave a half-written entry.
//
// CONTRACT: Record* methods accept DELTA quantities (the quantity filled in
// this callback), never running totals. The journal maintains the cumulative
// state internally. Adapters converting broker cumulative totals must
// subtract before calling.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::journal::Intent;
use crate::types::ExitKind;

/// Persistent per-intent record of submission and fill progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub intent: Intent,

    // ── Submission ──────────────────────────────────────────────────────
    #[serde(default)]
    pub submitted: bool,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub submitted_at_utc: Option<DateTime<Utc>>,
    /// Limit or stop price the order was submitted at.
    #[serde(default)]
    pub submitted_price: Option<f64>,

    // ── Entry fills (cumulative, maintained from deltas) ────────────────
    #[serde(default)]
    pub entry_filled_qty_total: u32,
    #[serde(default)]
    pub entry_fill_notional: f64,
    #[serde(default)]
    pub entry_avg_fill_price: f64,
    #[serde(default)]
    pub first_entry_fill_at_utc: Option<DateTime<Utc>>,

    // ── Exit fills (cumulative, maintained from deltas) ─────────────────
    #[serde(default)]
    pub exit_filled_qty_total: u32,
    #[serde(default)]
    pub exit_fill_notional: f64,
    #[serde(default)]
    pub exit_avg_fill_price: f64,
    #[serde(default)]
    pub exit_kind: Option<ExitKind>,

    // ── Break-even ──────────────────────────────────────────────────────
    #[serde(default)]
    pub be_applied: bool,

    // ── Completion & P&L ────────────────────────────────────────────────
    #[serde(default)]
    pub trade_completed: bool,
    #[serde(default)]
    pub completion_reason: Option<String>,
    #[serde(default)]
    pub realized_points: f64,
    #[serde(default)]
    pub gross_pnl: f64,
    #[serde(default)]
    pub net_pnl: f64,
    #[serde(default)]
    pub slippage_total: f64,
    #[serde(default)]
    pub commission_total: f64,
    #[serde(default)]
    pub fees_total: f64,

    #[serde(default)]
    pub updated_at_utc: Option<DateTime<Utc>>,
}

impl JournalEntry {
    fn new(intent: Intent) -> Self {
        Self {
            intent,
            submitted: false,
            broker_order_id: None,
            submitted_at_utc: None,
            submitted_price: None,
            entry_filled_qty_total: 0,
            entry_fill_notional: 0.0,
            entry_avg_fill_price: 0.0,
            first_entry_fill_at_utc: None,
            exit_filled_qty_total: 0,
            exit_fill_notional: 0.0,
            exit_avg_fill_price: 0.0,
            exit_kind: None,
            be_applied: false,
            trade_completed: false,
            completion_reason: None,
            realized_points: 0.0,
            gross_pnl: 0.0,
            net_pnl: 0.0,
            slippage_total: 0.0,
            commission_total: 0.0,
            fees_total: 0.0,
            updated_at_utc: None,
        }
    }
}

/// File-backed journal keyed by intent id, with an advisory in-memory cache.
pub struct ExecutionJournal {
    dir: PathBuf,
    cache: RwLock<HashMap<String, JournalEntry>>,
}

impl ExecutionJournal {
    /// Open (and create if needed) the journal directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create journal dir {}", dir.display()))?;
        Ok(Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    fn entry_path(&self, intent_id: &str) -> PathBuf {
        self.dir.join(format!("{intent_id}.json"))
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Load an entry, preferring the cache. A file that exists but fails to
    /// parse is an error: the stream using this intent must stand down.
    pub fn load(&self, intent_id: &str) -> Result<Option<JournalEntry>> {
        if let Some(entry) = self.cache.read().get(intent_id) {
            return Ok(Some(entry.clone()));
        }

        let path = self.entry_path(intent_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read journal entry {}", path.display()))?;
        let entry: JournalEntry = serde_json::from_str(&content)
            .with_context(|| format!("corrupted journal entry {}", path.display()))?;

        self.cache
            .write()
            .insert(intent_id.to_string(), entry.clone());
        Ok(Some(entry))
    }

    /// Idempotency probe: has this intent already been recorded as submitted?
    pub fn is_intent_submitted(&self, intent_id: &str) -> Result<bool> {
        Ok(self.load(intent_id)?.map(|e| e.submitted).unwrap_or(false))
    }

    /// Restart probe: does any intent on (date, stream) carry an entry fill?
    /// Scans the journal directory; used once per stream at restore time.
    pub fn has_entry_fill_for_stream(
        &self,
        trading_date: NaiveDate,
        stream_id: &str,
    ) -> Result<bool> {
        for entry in self.scan_stream(trading_date, stream_id)? {
            if entry.entry_filled_qty_total > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// All journal entries for (date, stream), in no particular order.
    pub fn scan_stream(
        &self,
        trading_date: NaiveDate,
        stream_id: &str,
    ) -> Result<Vec<JournalEntry>> {
        let mut out = Vec::new();
        let read_dir = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list journal dir {}", self.dir.display()))?;

        for dirent in read_dir {
            let path = dirent?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(stem) {
                Ok(Some(entry))
                    if entry.intent.trading_date == trading_date
                        && entry.intent.stream_id == stream_id =>
                {
                    out.push(entry)
                }
                Ok(_) => {}
                Err(e) => {
                    // A corrupted sibling file must not mask this stream's
                    // own state, but the caller needs to know about it.
                    warn!(path = %path.display(), error = %e, "skipping unreadable journal entry during scan");
                }
            }
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Record an intent submission. Idempotent: a second call for the same
    /// intent id leaves the original submission record untouched.
    pub fn record_submission(
        &self,
        intent: &Intent,
        broker_order_id: &str,
        submitted_price: f64,
        utc_now: DateTime<Utc>,
    ) -> Result<JournalEntry> {
        let mut entry = self
            .load(&intent.intent_id)?
            .unwrap_or_else(|| JournalEntry::new(intent.clone()));

        if entry.submitted {
            debug!(
                intent_id = %intent.intent_id,
                "submission already journaled — skipping"
            );
            return Ok(entry);
        }

        entry.submitted = true;
        entry.broker_order_id = Some(broker_order_id.to_string());
        entry.submitted_at_utc = Some(utc_now);
        entry.submitted_price = Some(submitted_price);
        entry.updated_at_utc = Some(utc_now);

        self.persist(entry.clone())?;
        info!(
            intent_id = %intent.intent_id,
            broker_order_id,
            price = submitted_price,
            "intent submission journaled"
        );
        Ok(entry)
    }

    /// Record an entry fill. `delta_quantity` is the quantity filled in THIS
    /// callback only; the journal accumulates totals and the weighted-average
    /// fill price internally.
    pub fn record_entry_fill(
        &self,
        intent_id: &str,
        fill_price: f64,
        delta_quantity: u32,
        utc_now: DateTime<Utc>,
    ) -> Result<JournalEntry> {
        let mut entry = self
            .load(intent_id)?
            .with_context(|| format!("entry fill for unknown intent {intent_id}"))?;

        if delta_quantity == 0 {
            return Ok(entry);
        }
        if entry.trade_completed {
            // A fill callback after completion can only be a broker replay.
            warn!(intent_id, "entry fill after completion ignored");
            return Ok(entry);
        }

        entry.entry_filled_qty_total += delta_quantity;
        entry.entry_fill_notional += fill_price * f64::from(delta_quantity);
        entry.entry_avg_fill_price =
            entry.entry_fill_notional / f64::from(entry.entry_filled_qty_total);
        if entry.first_entry_fill_at_utc.is_none() {
            entry.first_entry_fill_at_utc = Some(utc_now);
        }
        entry.updated_at_utc = Some(utc_now);

        self.persist(entry.clone())?;
        info!(
            intent_id,
            fill_price,
            delta_quantity,
            total = entry.entry_filled_qty_total,
            avg = entry.entry_avg_fill_price,
            "entry fill journaled"
        );
        Ok(entry)
    }

    /// Record an exit fill (delta quantity). When cumulative exit quantity
    /// reaches cumulative entry quantity, realized P&L is finalized exactly
    /// once. An exit quantity exceeding the entry quantity is a fatal
    /// invariant violation and is refused.
    pub fn record_exit_fill(
        &self,
        intent_id: &str,
        exit_price: f64,
        delta_quantity: u32,
        exit_kind: ExitKind,
        utc_now: DateTime<Utc>,
    ) -> Result<JournalEntry> {
        let mut entry = self
            .load(intent_id)?
            .with_context(|| format!("exit fill for unknown intent {intent_id}"))?;

        if delta_quantity == 0 {
            return Ok(entry);
        }

        let new_exit_total = entry.exit_filled_qty_total + delta_quantity;
        if new_exit_total > entry.entry_filled_qty_total {
            bail!(
                "overfill invariant violated for intent {intent_id}: exit {} would exceed entry {}",
                new_exit_total,
                entry.entry_filled_qty_total
            );
        }

        entry.exit_filled_qty_total = new_exit_total;
        entry.exit_fill_notional += exit_price * f64::from(delta_quantity);
        entry.exit_avg_fill_price =
            entry.exit_fill_notional / f64::from(entry.exit_filled_qty_total);
        entry.exit_kind = Some(exit_kind);
        entry.updated_at_utc = Some(utc_now);

        if entry.exit_filled_qty_total == entry.entry_filled_qty_total {
            Self::finalize_pnl(&mut entry, exit_kind);
        }

        self.persist(entry.clone())?;
        info!(
            intent_id,
            exit_price,
            delta_quantity,
            exit_total = entry.exit_filled_qty_total,
            completed = entry.trade_completed,
            "exit fill journaled"
        );
        Ok(entry)
    }

    /// Persist the one-shot break-even flag. Returns false when BE was
    /// already applied, making retries idempotent.
    pub fn mark_be_applied(&self, intent_id: &str, utc_now: DateTime<Utc>) -> Result<bool> {
        let mut entry = self
            .load(intent_id)?
            .with_context(|| format!("break-even mark for unknown intent {intent_id}"))?;

        if entry.be_applied {
            return Ok(false);
        }
        entry.be_applied = true;
        entry.updated_at_utc = Some(utc_now);
        self.persist(entry)?;
        Ok(true)
    }

    fn finalize_pnl(entry: &mut JournalEntry, exit_kind: ExitKind) {
        let qty = f64::from(entry.entry_filled_qty_total);
        let sign = entry.intent.direction.sign();

        entry.realized_points = sign * (entry.exit_avg_fill_price - entry.entry_avg_fill_price);
        entry.gross_pnl = entry.realized_points * qty * entry.intent.contract_multiplier;
        entry.slippage_total = entry.intent.slippage_per_contract * qty;
        entry.commission_total = entry.intent.commission_per_contract * qty;
        entry.fees_total = entry.intent.fees_per_contract * qty;
        entry.net_pnl =
            entry.gross_pnl - entry.slippage_total - entry.commission_total - entry.fees_total;
        entry.trade_completed = true;
        entry.completion_reason = Some(exit_kind.to_string());
    }

    /// Atomic durable write: serialize to a tmp sibling, fsync, then rename
    /// over the target. The write completes before any fill callback returns
    /// success to the broker layer.
    fn persist(&self, entry: JournalEntry) -> Result<()> {
        let path = self.entry_path(&entry.intent.intent_id);
        let content = serde_json::to_string_pretty(&entry)
            .context("failed to serialize journal entry")?;

        let tmp_path = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create tmp journal entry {}", tmp_path.display())
            })?;
            file.write_all(content.as_bytes()).with_context(|| {
                format!("failed to write tmp journal entry {}", tmp_path.display())
            })?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename journal entry into {}", path.display()))?;

        self.cache
            .write()
            .insert(entry.intent.intent_id.clone(), entry);
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionJournal")
            .field("dir", &self.dir)
            .field("cached_entries", &self.cache.read().len())
            .finish()
    }
}
