// =============================================================================
// Configuration — execution policy and timetable documents
// =============================================================================
//
// The execution policy is validated fail-closed at startup: any invalid
// per-instrument block refuses start. The timetable is polled and re-read at
// runtime; a document whose trading date does not match the current market
// day is rejected outright.
//
// Persistence uses the atomic tmp + rename pattern. All fields carry serde
// defaults so that adding new fields never breaks loading an older file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::time_service::parse_wall_time;
use crate::types::SessionTag;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "America/Chicago".to_string()
}

fn default_market_close() -> String {
    "15:00".to_string()
}

fn default_forced_flatten() -> String {
    "15:55".to_string()
}

fn default_rollover() -> String {
    "16:00".to_string()
}

fn default_market_open() -> String {
    "08:30".to_string()
}

fn default_stop_ratio() -> f64 {
    0.5
}

fn default_target_ratio() -> f64 {
    1.0
}

fn default_be_fraction() -> f64 {
    0.65
}

fn default_min_range_bars() -> usize {
    5
}

fn default_data_stall_minutes() -> i64 {
    5
}

fn default_data_root() -> String {
    "data/raw".to_string()
}

fn default_state_root() -> String {
    "state".to_string()
}

fn default_logs_root() -> String {
    "logs".to_string()
}

fn default_kill_switch_path() -> String {
    "state/KILL".to_string()
}

fn default_submit_deadline_ms() -> u64 {
    5_000
}

// =============================================================================
// Per-instrument policy
// =============================================================================

/// Execution parameters for one canonical instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tradable contract submitted to the broker (e.g. "MES" for "ES").
    pub execution_instrument: String,

    /// Contracts per entry.
    pub quantity: u32,
    /// Hard cap on contracts per entry.
    pub max_quantity: u32,

    pub tick_size: f64,
    pub contract_multiplier: f64,

    /// Base target distance in points; stop and target scale from it.
    pub base_target_points: f64,
    #[serde(default = "default_stop_ratio")]
    pub stop_ratio: f64,
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
    /// Fraction of the entry→target distance at which the stop moves to
    /// break-even.
    #[serde(default = "default_be_fraction")]
    pub be_fraction: f64,

    // P&L pass-through rates per contract; zero unless configured.
    #[serde(default)]
    pub slippage_per_contract: f64,
    #[serde(default)]
    pub commission_per_contract: f64,
    #[serde(default)]
    pub fees_per_contract: f64,
}

impl InstrumentPolicy {
    fn validate(&self, canonical: &str) -> Result<()> {
        if self.execution_instrument.trim().is_empty() {
            bail!("{canonical}: execution_instrument is empty");
        }
        if self.quantity == 0 {
            bail!("{canonical}: quantity must be positive");
        }
        if self.quantity > self.max_quantity {
            bail!(
                "{canonical}: quantity {} exceeds max_quantity {}",
                self.quantity,
                self.max_quantity
            );
        }
        if self.tick_size <= 0.0 || !self.tick_size.is_finite() {
            bail!("{canonical}: tick_size must be positive");
        }
        if self.contract_multiplier <= 0.0 || !self.contract_multiplier.is_finite() {
            bail!("{canonical}: contract_multiplier must be positive");
        }
        if self.base_target_points <= 0.0 || !self.base_target_points.is_finite() {
            bail!("{canonical}: base_target_points must be positive");
        }
        if self.stop_ratio <= 0.0 || self.target_ratio <= 0.0 {
            bail!("{canonical}: stop_ratio and target_ratio must be positive");
        }
        if !(0.0..1.0).contains(&self.be_fraction) || self.be_fraction == 0.0 {
            bail!(
                "{canonical}: be_fraction {} must lie in (0, 1)",
                self.be_fraction
            );
        }
        Ok(())
    }
}

// =============================================================================
// Execution policy
// =============================================================================

/// Top-level execution policy for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Broker account identifier; half of the duplicate-instance key.
    pub account: String,

    #[serde(default = "default_timezone")]
    pub market_timezone: String,

    #[serde(default = "default_market_open")]
    pub market_open_local: String,
    #[serde(default = "default_market_close")]
    pub market_close_local: String,
    #[serde(default = "default_forced_flatten")]
    pub forced_flatten_local: String,
    /// Wall-clock point at which the trading day rolls over.
    #[serde(default = "default_rollover")]
    pub rollover_local: String,

    /// Minimum bars required to recompute a previously locked range after a
    /// restart with no restorable hydration data.
    #[serde(default = "default_min_range_bars")]
    pub min_range_bars: usize,

    /// Minutes without a live bar before a data-stall warning is emitted.
    #[serde(default = "default_data_stall_minutes")]
    pub data_stall_minutes: i64,

    /// Deadline for a single broker submission attempt.
    #[serde(default = "default_submit_deadline_ms")]
    pub submit_deadline_ms: u64,

    #[serde(default = "default_data_root")]
    pub data_root: String,
    #[serde(default = "default_state_root")]
    pub state_root: String,
    #[serde(default = "default_logs_root")]
    pub logs_root: String,
    #[serde(default = "default_kill_switch_path")]
    pub kill_switch_path: String,

    /// Live bar feed WebSocket URL.
    #[serde(default)]
    pub feed_url: Option<String>,
    /// Optional alert webhook endpoint.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Per-canonical-instrument execution parameters.
    pub instruments: HashMap<String, InstrumentPolicy>,
}

impl ExecutionPolicy {
    /// Load the policy from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read execution policy from {}", path.display()))?;
        let policy: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse execution policy from {}", path.display()))?;

        info!(
            path = %path.display(),
            account = %policy.account,
            instruments = policy.instruments.len(),
            "execution policy loaded"
        );
        Ok(policy)
    }

    /// Validate the whole document; any failure refuses start.
    pub fn validate(&self) -> Result<()> {
        if self.account.trim().is_empty() {
            bail!("account is empty");
        }
        self.market_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid market_timezone {:?}: {e}", self.market_timezone))?;

        for wall in [
            &self.market_open_local,
            &self.market_close_local,
            &self.forced_flatten_local,
            &self.rollover_local,
        ] {
            parse_wall_time(wall)?;
        }

        if self.instruments.is_empty() {
            bail!("no instruments configured");
        }
        for (canonical, instrument) in &self.instruments {
            instrument.validate(canonical)?;
        }
        Ok(())
    }

    /// Policy for a canonical instrument.
    pub fn instrument(&self, canonical: &str) -> Option<&InstrumentPolicy> {
        self.instruments.get(canonical)
    }

    /// Map a raw feed/broker instrument name to its canonical identity.
    /// Canonical names map to themselves; execution instruments map back to
    /// their canonical (e.g. "MES" → "ES"). Unknown names yield `None`.
    pub fn canonicalize(&self, raw_instrument: &str) -> Option<String> {
        let raw = raw_instrument.to_uppercase();
        if self.instruments.contains_key(&raw) {
            return Some(raw);
        }
        self.instruments
            .iter()
            .find(|(_, p)| p.execution_instrument.eq_ignore_ascii_case(&raw))
            .map(|(canonical, _)| canonical.clone())
    }
}

// =============================================================================
// Timetable
// =============================================================================

/// One stream row in the timetable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimetableStream {
    pub stream: String,
    pub instrument: String,
    pub session: SessionTag,
    pub slot_time: String,
    pub enabled: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub decision_time: Option<String>,
}

/// The polled timetable document: the stream universe for one trading date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timetable {
    pub trading_date: NaiveDate,
    pub timezone: String,
    pub streams: Vec<TimetableStream>,
}

impl Timetable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read timetable from {}", path.display()))?;
        let timetable: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse timetable from {}", path.display()))?;
        Ok(timetable)
    }

    /// Reject documents for any day other than the current market day, and
    /// rows with unparseable slot times or unknown instruments.
    pub fn validate(&self, policy: &ExecutionPolicy, today: NaiveDate) -> Result<()> {
        if self.trading_date != today {
            bail!(
                "timetable trading_date {} does not match current market day {}",
                self.trading_date,
                today
            );
        }
        for row in &self.streams {
            parse_wall_time(&row.slot_time)
                .with_context(|| format!("stream {}: bad slot_time", row.stream))?;
            if policy.instrument(&row.instrument).is_none() {
                bail!(
                    "stream {}: instrument {} not present in execution policy",
                    row.stream,
                    row.instrument
                );
            }
        }
        Ok(())
    }
}
