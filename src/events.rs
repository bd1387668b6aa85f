// =============================================================================
// Event Bus — structured JSONL event stream
// =============================================================================
//
// One JSON object per line. Instrument-scoped events land in
// `logs/{canonical}.jsonl`; everything is mirrored to `logs/engine.jsonl`.
// Diagnostic categories that can fire every tick go through the rate-limited
// entry point.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Severity attached to every emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Context an event is emitted against.
#[derive(Debug, Clone, Default)]
pub struct EventScope {
    pub stream: Option<String>,
    pub instrument: Option<String>,
    pub trading_date: Option<NaiveDate>,
}

impl EventScope {
    pub fn engine() -> Self {
        Self::default()
    }

    pub fn stream(
        stream: impl Into<String>,
        instrument: impl Into<String>,
        trading_date: NaiveDate,
    ) -> Self {
        Self {
            stream: Some(stream.into()),
            instrument: Some(instrument.into()),
            trading_date: Some(trading_date),
        }
    }
}

#[derive(Serialize)]
struct EventLine<'a> {
    ts_utc: DateTime<Utc>,
    event: &'a str,
    level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instrument: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trading_date: Option<NaiveDate>,
    data: &'a serde_json::Value,
}

/// Append-only JSONL event writer.
pub struct EventBus {
    dir: PathBuf,
    rate_limits: Mutex<HashMap<String, Instant>>,
}

impl EventBus {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create logs dir {}", dir.display()))?;
        Ok(Self {
            dir,
            rate_limits: Mutex::new(HashMap::new()),
        })
    }

    /// Emit an event. Instrument-scoped events are written to the
    /// instrument's file and mirrored into the engine-wide file.
    pub fn emit(
        &self,
        level: EventLevel,
        event: &str,
        scope: &EventScope,
        data: serde_json::Value,
    ) {
        let line = EventLine {
            ts_utc: Utc::now(),
            event,
            level: level.to_string(),
            stream: scope.stream.as_deref(),
            instrument: scope.instrument.as_deref(),
            trading_date: scope.trading_date,
            data: &data,
        };

        let serialized = match serde_json::to_string(&line) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, event, "failed to serialize event line");
                return;
            }
        };

        if let Some(instrument) = &scope.instrument {
            self.append(&format!("{instrument}.jsonl"), &serialized);
        }
        self.append("engine.jsonl", &serialized);

        match level {
            EventLevel::Debug => debug!(event, data = %data, "event"),
            EventLevel::Info => info!(event, data = %data, "event"),
            EventLevel::Warn => warn!(event, data = %data, "event"),
            EventLevel::Error | EventLevel::Critical => {
                error!(event, level = %level, data = %data, "event")
            }
        }
    }

    /// Emit at most once per `min_interval` per category. Returns whether the
    /// event was actually emitted.
    pub fn emit_rate_limited(
        &self,
        category: &str,
        min_interval: Duration,
        level: EventLevel,
        event: &str,
        scope: &EventScope,
        data: serde_json::Value,
    ) -> bool {
        {
            let mut limits = self.rate_limits.lock();
            let now = Instant::now();
            if let Some(last) = limits.get(category) {
                if now.duration_since(*last) < min_interval {
                    return false;
                }
            }
            limits.insert(category.to_string(), now);
        }
        self.emit(level, event, scope, data);
        true
    }

    fn append(&self, file_name: &str, line: &str) {
        let path = self.dir.join(file_name);
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            // Log-append failure must never take the engine down.
            error!(path = %path.display(), error = %e, "event append failed");
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").field("dir", &self.dir).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_instrument_and_engine_files() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::open(dir.path().join("logs")).unwrap();
        let scope = EventScope::stream(
            "ES-0730",
            "ES",
            NaiveDate::from_ymd_opt(2024, 6, 11).unwrap(),
        );
        bus.emit(
            EventLevel::Info,
            "range_locked",
            &scope,
            serde_json::json!({ "range_high": 4500.0 }),
        );

        let es = std::fs::read_to_string(dir.path().join("logs/ES.jsonl")).unwrap();
        let engine = std::fs::read_to_string(dir.path().join("logs/engine.jsonl")).unwrap();
        assert_eq!(es.lines().count(), 1);
        assert_eq!(engine.lines().count(), 1);

        let parsed: serde_json::Value = serde_json::from_str(es.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["event"], "range_locked");
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["stream"], "ES-0730");
        assert_eq!(parsed["instrument"], "ES");
        assert_eq!(parsed["trading_date"], "2024-06-11");
        assert!((parsed["data"]["range_high"].as_f64().unwrap() - 4500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn engine_scope_writes_engine_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::open(dir.path().join("logs")).unwrap();
        bus.emit(
            EventLevel::Warn,
            "tick_drift",
            &EventScope::engine(),
            serde_json::json!({}),
        );
        assert!(dir.path().join("logs/engine.jsonl").exists());
        assert!(!dir.path().join("logs/ES.jsonl").exists());
    }

    #[test]
    fn rate_limit_suppresses_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::open(dir.path().join("logs")).unwrap();
        let scope = EventScope::engine();

        let first = bus.emit_rate_limited(
            "stall:ES",
            Duration::from_secs(60),
            EventLevel::Warn,
            "data_stall",
            &scope,
            serde_json::json!({}),
        );
        let second = bus.emit_rate_limited(
            "stall:ES",
            Duration::from_secs(60),
            EventLevel::Warn,
            "data_stall",
            &scope,
            serde_json::json!({}),
        );
        assert!(first);
        assert!(!second);

        let engine = std::fs::read_to_string(dir.path().join("logs/engine.jsonl")).unwrap();
        assert_eq!(engine.lines().count(), 1);
    }
}
