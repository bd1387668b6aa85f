// =============================================================================
// Notifications — whitelisted, deduplicated alert delivery
// =============================================================================
//
// Only a fixed whitelist of event types may leave the process as alerts.
// Standard alerts fire at most once per (event_type, run_id); emergency-class
// alerts may repeat but no more than once per five minutes per type.
// Everything else stays in the event log.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

/// Event types allowed to trigger external alerts.
pub const ALERT_WHITELIST: &[&str] = &[
    "connection-lost-sustained",
    "engine-tick-stall-detected",
    "execution-gate-invariant-violation",
    "disconnect-fail-closed-entered",
    "duplicate-instance-detected",
    "execution-policy-validation-failed",
];

/// Minimum spacing between repeats of one emergency event type.
const EMERGENCY_REPEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Delivery class of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertClass {
    Standard,
    Emergency,
}

/// A fully-formed alert handed to a sink.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub event_type: String,
    pub class: AlertClass,
    pub message: String,
    pub run_id: String,
    pub ts_utc: DateTime<Utc>,
}

/// Abstract alert transport.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;
}

/// Sink that only logs; the default when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        warn!(
            event_type = %alert.event_type,
            class = ?alert.class,
            message = %alert.message,
            "ALERT"
        );
        Ok(())
    }
}

/// Sink that POSTs the alert JSON to a webhook endpoint.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn deliver(&self, alert: &Alert) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("webhook POST failed")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("webhook returned {status}");
        }
        Ok(())
    }
}

/// Front-end enforcing the whitelist and delivery policy on top of a sink.
pub struct Notifier {
    sink: Box<dyn NotificationSink>,
    run_id: String,
    sent_this_run: Mutex<HashSet<String>>,
    emergency_last: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(sink: Box<dyn NotificationSink>, run_id: impl Into<String>) -> Self {
        Self {
            sink,
            run_id: run_id.into(),
            sent_this_run: Mutex::new(HashSet::new()),
            emergency_last: Mutex::new(HashMap::new()),
        }
    }

    /// Request an alert. Non-whitelisted types are log-only. Returns whether
    /// the sink was invoked.
    pub async fn notify(&self, event_type: &str, class: AlertClass, message: &str) -> bool {
        if !ALERT_WHITELIST.contains(&event_type) {
            info!(event_type, message, "alert suppressed (not whitelisted)");
            return false;
        }

        match class {
            AlertClass::Standard => {
                let mut sent = self.sent_this_run.lock();
                if !sent.insert(event_type.to_string()) {
                    info!(event_type, "alert suppressed (already sent this run)");
                    return false;
                }
            }
            AlertClass::Emergency => {
                let mut last = self.emergency_last.lock();
                let now = Instant::now();
                if let Some(prev) = last.get(event_type) {
                    if now.duration_since(*prev) < EMERGENCY_REPEAT_INTERVAL {
                        info!(event_type, "emergency alert suppressed (rate limit)");
                        return false;
                    }
                }
                last.insert(event_type.to_string(), now);
            }
        }

        let alert = Alert {
            event_type: event_type.to_string(),
            class,
            message: message.to_string(),
            run_id: self.run_id.clone(),
            ts_utc: Utc::now(),
        };

        if let Err(e) = self.sink.deliver(&alert).await {
            warn!(event_type, error = %e, "alert delivery failed");
        }
        true
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("run_id", &self.run_id)
            .field("sent_this_run", &self.sent_this_run.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn deliver(&self, _alert: &Alert) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notifier() -> (Arc<AtomicUsize>, Notifier) {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(Box::new(CountingSink(count.clone())), "run-1");
        (count, notifier)
    }

    #[tokio::test]
    async fn standard_alert_fires_once_per_run() {
        let (count, notifier) = notifier();
        assert!(
            notifier
                .notify("duplicate-instance-detected", AlertClass::Standard, "dup")
                .await
        );
        assert!(
            !notifier
                .notify("duplicate-instance-detected", AlertClass::Standard, "dup")
                .await
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_whitelisted_type_is_log_only() {
        let (count, notifier) = notifier();
        assert!(
            !notifier
                .notify("range-locked", AlertClass::Standard, "info")
                .await
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emergency_rate_limits_per_type() {
        let (count, notifier) = notifier();
        assert!(
            notifier
                .notify(
                    "disconnect-fail-closed-entered",
                    AlertClass::Emergency,
                    "down"
                )
                .await
        );
        // Immediately repeated: inside the 5-minute window.
        assert!(
            !notifier
                .notify(
                    "disconnect-fail-closed-entered",
                    AlertClass::Emergency,
                    "down"
                )
                .await
        );
        // A different emergency type is unaffected.
        assert!(
            notifier
                .notify(
                    "execution-gate-invariant-violation",
                    AlertClass::Emergency,
                    "overfill"
                )
                .await
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
