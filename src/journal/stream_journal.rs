// =============================================================================
// Stream Journal — per (trading_date, stream) lifecycle flags
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted lifecycle record for one stream on one trading date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamJournalRecord {
    pub trading_date: NaiveDate,
    pub stream_id: String,
    /// Last observed state, as its display string (e.g. "RANGE_LOCKED").
    pub last_state: String,
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub stop_brackets_submitted_at_lock: bool,
    #[serde(default)]
    pub entry_detected: bool,
    #[serde(default)]
    pub execution_interrupted_by_close: bool,
    pub slot_instance_key: String,
    /// Journal key of the prior day's record when this slot was carried
    /// forward across a rollover.
    #[serde(default)]
    pub prior_journal_key: Option<String>,
    /// Set once the carry-forward market re-entry has been submitted.
    #[serde(default)]
    pub reentry_submitted: bool,
    #[serde(default)]
    pub updated_at_utc: Option<DateTime<Utc>>,
}

impl StreamJournalRecord {
    pub fn journal_key(trading_date: NaiveDate, stream_id: &str) -> String {
        format!("{}_{}", trading_date.format("%Y-%m-%d"), stream_id)
    }
}

/// File-backed store, one JSON file per (trading_date, stream).
#[derive(Debug)]
pub struct StreamJournalStore {
    dir: PathBuf,
}

impl StreamJournalStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create stream journal dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, trading_date: NaiveDate, stream_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}.json",
            StreamJournalRecord::journal_key(trading_date, stream_id)
        ))
    }

    /// Load the record, if one exists. Parse failure is an error (the
    /// restore layer treats it as unrestorable, fail closed).
    pub fn load(
        &self,
        trading_date: NaiveDate,
        stream_id: &str,
    ) -> Result<Option<StreamJournalRecord>> {
        let path = self.path_for(trading_date, stream_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read stream journal {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("corrupted stream journal {}", path.display()))?;
        Ok(Some(record))
    }

    /// Persist the record with the atomic tmp + rename pattern.
    pub fn save(&self, record: &StreamJournalRecord) -> Result<()> {
        let path = self.path_for(record.trading_date, &record.stream_id);
        let content = serde_json::to_string_pretty(record)
            .context("failed to serialize stream journal record")?;

        let tmp_path = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create tmp stream journal {}", tmp_path.display())
            })?;
            file.write_all(content.as_bytes()).with_context(|| {
                format!("failed to write tmp stream journal {}", tmp_path.display())
            })?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", tmp_path.display()))?;
        }
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename stream journal into {}", path.display()))?;

        debug!(
            stream = %record.stream_id,
            date = %record.trading_date,
            state = %record.last_state,
            "stream journal saved"
        );
        Ok(())
    }
}
