// =============================================================================
// Hydration & Ranges Logs — per-day JSONL trail of range-lock events
// =============================================================================
//
// The hydration log is the restart source of truth for locked ranges; the
// ranges log is a redundant compact form kept alongside it. Both are
// append-only JSONL, one file per trading date.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One range-related hydration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydrationRecord {
    pub ts_utc: DateTime<Utc>,
    /// "range_locked" or "breakout_levels_computed".
    pub event: String,
    pub stream: String,
    pub range_high: Option<f64>,
    pub range_low: Option<f64>,
    pub freeze_close: Option<f64>,
    pub brk_long: Option<f64>,
    pub brk_short: Option<f64>,
}

/// Range values restored from a hydration (or ranges) log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestoredRange {
    pub range_high: f64,
    pub range_low: f64,
    pub freeze_close: f64,
    /// Absent in logs written before breakout levels were journaled; the
    /// restore layer recomputes them when missing.
    pub brk_long: Option<f64>,
    pub brk_short: Option<f64>,
}

fn append_jsonl(path: &PathBuf, record: &HydrationRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log dir {}", parent.display()))?;
    }
    let line = serde_json::to_string(record).context("failed to serialize hydration record")?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    Ok(())
}

/// Scan a JSONL file for the latest complete range record for `stream`.
/// Unparseable lines are skipped with a warning; older files without brk
/// levels still restore (the caller repairs them).
fn latest_range_in(path: &PathBuf, stream: &str) -> Result<Option<RestoredRange>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read log {}", path.display()))?;

    let mut latest = None;
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: HydrationRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), line = idx + 1, error = %e, "skipping unreadable hydration line");
                continue;
            }
        };
        if record.stream != stream {
            continue;
        }
        if let (Some(range_high), Some(range_low), Some(freeze_close)) =
            (record.range_high, record.range_low, record.freeze_close)
        {
            latest = Some(RestoredRange {
                range_high,
                range_low,
                freeze_close,
                brk_long: record.brk_long,
                brk_short: record.brk_short,
            });
        }
    }
    Ok(latest)
}

/// Per-day hydration log.
#[derive(Debug)]
pub struct HydrationLog {
    dir: PathBuf,
}

impl HydrationLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create hydration dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append a range-lock event with all four derived values.
    pub fn append(&self, date: NaiveDate, record: &HydrationRecord) -> Result<()> {
        append_jsonl(&self.day_path(date), record)
    }

    /// Latest restorable range for `stream` on `date`.
    pub fn latest_range_for(&self, date: NaiveDate, stream: &str) -> Result<Option<RestoredRange>> {
        latest_range_in(&self.day_path(date), stream)
    }
}

/// Per-day redundant compact ranges log.
#[derive(Debug)]
pub struct RangesLog {
    dir: PathBuf,
}

impl RangesLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create ranges dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn day_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub fn append(&self, date: NaiveDate, record: &HydrationRecord) -> Result<()> {
        append_jsonl(&self.day_path(date), record)
    }

    /// Fallback restore source when the hydration log is missing.
    pub fn latest_range_for(&self, date: NaiveDate, stream: &str) -> Result<Option<RestoredRange>> {
        latest_range_in(&self.day_path(date), stream)
    }
}
