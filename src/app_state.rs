// =============================================================================
// Central Application State — Meridian Breakout Engine
// =============================================================================
//
// Ties the engine, kill switch, and run metadata together for the status
// API. The engine itself lives behind a tokio Mutex: the engine task and the
// API handlers serialize on it, which keeps stream mutation single-writer.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::engine::Engine;
use crate::risk::KillSwitch;

/// A recorded error event for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Shared across the engine task and the API via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation.
    pub state_version: AtomicU64,

    pub run_id: String,
    pub start_time: std::time::Instant,

    pub engine: Arc<Mutex<Engine>>,
    pub kill_switch: KillSwitch,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl AppState {
    pub fn new(run_id: String, engine: Arc<Mutex<Engine>>, kill_switch: KillSwitch) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            run_id,
            start_time: std::time::Instant::now(),
            engine,
            kill_switch,
            recent_errors: RwLock::new(Vec::new()),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error for the status API, capped at [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        });
        if errors.len() > MAX_RECENT_ERRORS {
            let overflow = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(..overflow);
        }
        drop(errors);
        self.increment_version();
    }

    /// Full status snapshot (locks the engine briefly).
    pub async fn build_snapshot(&self) -> serde_json::Value {
        let engine = self.engine.lock().await;
        serde_json::json!({
            "run_id": self.run_id,
            "uptime_secs": self.start_time.elapsed().as_secs(),
            "state_version": self.current_state_version(),
            "active_trading_date": engine.active_trading_date(),
            "kill_switch_engaged": self.kill_switch.engaged(),
            "streams": engine.stream_summaries(),
            "recent_errors": self.recent_errors.read().clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_ring_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let engine = crate::engine::test_rig::minimal_engine(dir.path());
        let state = AppState::new(
            "run-1".to_string(),
            Arc::new(Mutex::new(engine)),
            KillSwitch::new(dir.path().join("KILL")),
        );

        for i in 0..60 {
            state.push_error(format!("error {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors.last().unwrap().message, "error 59");
        assert_eq!(errors.first().unwrap().message, "error 10");
    }
}
