// =============================================================================
// Meridian Breakout Engine — Main Entry Point
// =============================================================================
//
// Startup is fail-closed: an invalid execution policy or a duplicate
// instance for (account, execution_instrument) refuses to run. The engine
// task owns all stream mutation; bar-feed and broker callbacks reach it over
// channels drained by the select loop below.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod engine;
mod events;
mod execution;
mod instance;
mod journal;
mod market_data;
mod notify;
mod restore;
mod risk;
mod stream;
mod time_service;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::{ExecutionPolicy, Timetable};
use crate::engine::Engine;
use crate::events::EventBus;
use crate::execution::sim::SimAdapter;
use crate::instance::{AcquireOutcome, InstanceRegistry};
use crate::journal::{ExecutionJournal, HydrationLog, RangesLog, StreamJournalStore};
use crate::notify::{AlertClass, LogNotifier, NotificationSink, Notifier, WebhookNotifier};
use crate::risk::{KillSwitch, RiskGate};
use crate::time_service::TimeService;

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let run_id = uuid::Uuid::new_v4().to_string();
    info!(run_id = %run_id, "Meridian Breakout Engine starting up");

    // ── 2. Execution policy (fail-closed validation) ─────────────────────
    let policy_path =
        std::env::var("MERIDIAN_POLICY").unwrap_or_else(|_| "execution_policy.json".into());
    let policy = match ExecutionPolicy::load(&policy_path).and_then(|p| {
        p.validate()?;
        Ok(p)
    }) {
        Ok(policy) => policy,
        Err(e) => {
            error!(path = %policy_path, error = %e, "execution policy rejected — refusing to start");
            let notifier = Notifier::new(Box::new(LogNotifier), run_id.clone());
            notifier
                .notify(
                    "execution-policy-validation-failed",
                    AlertClass::Standard,
                    &format!("refusing to start: {e}"),
                )
                .await;
            return Err(e);
        }
    };

    let time_service = TimeService::new(&policy.market_timezone)?;
    let state_root = std::path::PathBuf::from(&policy.state_root);

    // ── 3. Notifications ─────────────────────────────────────────────────
    let sink: Box<dyn NotificationSink> = match &policy.webhook_url {
        Some(url) => Box::new(WebhookNotifier::new(url.clone())?),
        None => Box::new(LogNotifier),
    };
    let notifier = Arc::new(Notifier::new(sink, run_id.clone()));

    // ── 4. Duplicate-instance guard ──────────────────────────────────────
    let registry = InstanceRegistry::open(state_root.join("instances"))?;
    let mut instance_guards = Vec::new();
    for (canonical, instrument) in policy.instruments.iter().filter(|(_, p)| p.enabled) {
        match registry.acquire(&policy.account, &instrument.execution_instrument, &run_id)? {
            AcquireOutcome::Acquired(guard) => instance_guards.push(guard),
            AcquireOutcome::Conflict(existing) => {
                error!(
                    instrument = %canonical,
                    execution_instrument = %instrument.execution_instrument,
                    existing = ?existing,
                    "another instance is active — standing down"
                );
                notifier
                    .notify(
                        "duplicate-instance-detected",
                        AlertClass::Standard,
                        &format!(
                            "duplicate instance for ({}, {})",
                            policy.account, instrument.execution_instrument
                        ),
                    )
                    .await;
                anyhow::bail!(
                    "duplicate instance for ({}, {})",
                    policy.account,
                    instrument.execution_instrument
                );
            }
        }
    }

    // ── 5. Journals, events, gate ────────────────────────────────────────
    let journal = Arc::new(ExecutionJournal::open(state_root.join("intents"))?);
    let stream_journals = Arc::new(StreamJournalStore::open(state_root.join("streams"))?);
    let hydration = Arc::new(HydrationLog::open(state_root.join("hydration"))?);
    let ranges = Arc::new(RangesLog::open(state_root.join("ranges"))?);
    let event_bus = Arc::new(EventBus::open(&policy.logs_root)?);
    let kill_switch = KillSwitch::new(&policy.kill_switch_path);
    let gate = Arc::new(RiskGate::new(kill_switch.clone()));

    // ── 6. Execution adapter ─────────────────────────────────────────────
    // The in-process simulated venue implements the full adapter contract;
    // a broker-SDK adapter slots in behind the same trait.
    let (exec_tx, mut exec_rx) = mpsc::channel(1024);
    let sim_instrument = policy
        .instruments
        .values()
        .find(|p| p.enabled)
        .map(|p| p.execution_instrument.clone())
        .context("no enabled instrument in policy")?;
    let adapter = Arc::new(SimAdapter::new(sim_instrument, exec_tx));

    // ── 7. Engine & initial timetable ────────────────────────────────────
    let mut engine = Engine::new(
        policy.clone(),
        time_service.clone(),
        journal,
        stream_journals,
        hydration,
        ranges,
        adapter.clone(),
        gate,
        event_bus.clone(),
        notifier.clone(),
    );

    let timetable_path =
        std::env::var("MERIDIAN_TIMETABLE").unwrap_or_else(|_| "timetable.json".into());
    let now = Utc::now();
    match Timetable::load(&timetable_path) {
        Ok(tt) => {
            engine.apply_timetable(&tt, now).await?;
            engine.seed_and_fetch(now).await;
        }
        Err(e) => {
            warn!(path = %timetable_path, error = %e, "no timetable applied at startup — polling");
        }
    }

    let engine = Arc::new(Mutex::new(engine));
    let state = Arc::new(AppState::new(run_id.clone(), engine.clone(), kill_switch));

    // ── 8. Live bar feed ─────────────────────────────────────────────────
    let (bar_tx, mut bar_rx) = mpsc::channel(1024);
    // Keep one sender alive so the select branch below never sees a closed
    // channel when no feed is configured.
    let _bar_tx_keepalive = bar_tx.clone();
    if let Some(feed_url) = policy.feed_url.clone() {
        let feed_notifier = notifier.clone();
        tokio::spawn(async move {
            let mut consecutive_failures: u32 = 0;
            loop {
                match market_data::feed::run_bar_stream(&feed_url, &bar_tx).await {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(error = %e, consecutive_failures, "bar feed error — reconnecting in 5s");
                        if consecutive_failures == 5 {
                            feed_notifier
                                .notify(
                                    "connection-lost-sustained",
                                    AlertClass::Emergency,
                                    &format!("bar feed down after {consecutive_failures} attempts: {e}"),
                                )
                                .await;
                        }
                    }
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
        info!("live bar feed launched");
    } else {
        warn!("no feed_url configured — running on historical/file bars only");
    }

    // ── 9. Status API ────────────────────────────────────────────────────
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let api_state = state.clone();
    let bind_addr_clone = bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app).await.expect("API server failed");
    });

    // ── 10. Engine loop ──────────────────────────────────────────────────
    info!("all subsystems running — Ctrl+C to stop");
    let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(1));
    let mut timetable_poll = tokio::time::interval(tokio::time::Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                engine.lock().await.tick(Utc::now()).await;
            }
            Some(feed_bar) = bar_rx.recv() => {
                engine
                    .lock()
                    .await
                    .route_bar(&feed_bar.raw_instrument, &feed_bar.bar, Utc::now())
                    .await;
                state.increment_version();
            }
            Some(event) = exec_rx.recv() => {
                engine.lock().await.handle_execution_event(event).await;
                state.increment_version();
            }
            _ = timetable_poll.tick() => {
                match Timetable::load(&timetable_path) {
                    Ok(tt) => {
                        let mut engine = engine.lock().await;
                        if let Err(e) = engine.apply_timetable(&tt, Utc::now()).await {
                            warn!(error = %e, "timetable poll rejected");
                            state.push_error(format!("timetable rejected: {e}"));
                        }
                    }
                    Err(e) => {
                        warn!(path = %timetable_path, error = %e, "timetable poll failed");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("shutdown signal received — stopping gracefully");
                break;
            }
        }
    }

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    for guard in instance_guards {
        guard.release();
    }
    info!("Meridian Breakout Engine shut down complete");
    Ok(())
}
