// =============================================================================
// Restore Layer — restart-aware reconstruction of stream state
// =============================================================================
//
// On startup, each configured stream with a journal record is rebuilt from
// persisted state instead of re-running its lifecycle:
//
//   * RANGE_LOCKED streams restore their range from the hydration log (or
//     the redundant ranges log) and jump straight back to RANGE_LOCKED.
//     Missing breakout levels in older logs are recomputed and re-journaled.
//   * entry_detected is restored by scanning the execution journal, never by
//     re-issuing intents.
//   * A previously locked stream with no restorable range may recompute from
//     refetched bars only above the configured bar minimum; below it the
//     stream suspends fail-closed.
//
// A previously locked range is never silently recomputed when restore data
// exists: restore-or-suspend, explicitly.
// =============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::events::{EventLevel, EventScope};
use crate::journal::{HydrationRecord, RestoredRange};
use crate::notify::AlertClass;
use crate::stream::{LockedRange, StreamCtx, StreamStateMachine};
use crate::types::{round_to_tick, StreamState};

/// What the restore pass did with one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreResult {
    /// No journal record: a fresh stream, nothing to restore.
    Fresh,
    /// Journal record found for a pre-lock state; restart flag set only.
    MarkedRestart,
    /// Range restored from the hydration/ranges log.
    Restored,
    /// No restore data, but enough bars to recompute the range.
    Recomputed,
    /// Slot already committed on a previous run.
    AlreadyCommitted,
    /// Unrestorable; stream suspended for manual intervention.
    Suspended,
}

pub struct RestoreLayer;

impl RestoreLayer {
    /// Restore one stream from its journals. `min_range_bars` gates the
    /// recompute fallback.
    pub async fn restore(
        stream: &mut StreamStateMachine,
        min_range_bars: usize,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) -> Result<RestoreResult> {
        let record = match ctx
            .stream_journals
            .load(stream.trading_date, &stream.stream_id)
        {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(RestoreResult::Fresh),
            Err(e) => {
                // Corrupted stream journal: fail closed.
                ctx.notifier
                    .notify(
                        "execution-gate-invariant-violation",
                        AlertClass::Emergency,
                        &format!("stream journal unreadable for {}: {e}", stream.stream_id),
                    )
                    .await;
                stream.suspend("stream_journal_corrupted", now, ctx);
                return Ok(RestoreResult::Suspended);
            }
        };

        stream.mark_restart();
        stream.restore_flags(&record);

        if record.committed {
            info!(stream = %stream.stream_id, "slot already committed — nothing to restore");
            return Ok(RestoreResult::AlreadyCommitted);
        }

        let was_locked = record.last_state == StreamState::RangeLocked.to_string();
        if !was_locked {
            return Ok(RestoreResult::MarkedRestart);
        }

        // Locked on the previous run: restore the exact range.
        let restored = Self::load_range(stream, ctx)?;

        let entry_detected = ctx
            .journal
            .has_entry_fill_for_stream(stream.trading_date, &stream.stream_id)?;
        let active_intent_id = if entry_detected {
            ctx.journal
                .scan_stream(stream.trading_date, &stream.stream_id)?
                .into_iter()
                .find(|e| e.entry_filled_qty_total > 0)
                .map(|e| e.intent.intent_id)
        } else {
            None
        };

        match restored {
            Some(range) => {
                let range = Self::repair_levels(stream, range, now, ctx);
                stream.restore_locked(
                    range,
                    entry_detected,
                    active_intent_id,
                    record.stop_brackets_submitted_at_lock,
                    now,
                    ctx,
                );
                info!(
                    stream = %stream.stream_id,
                    range_high = range.range_high,
                    range_low = range.range_low,
                    entry_detected,
                    "stream restored to RANGE_LOCKED"
                );
                Ok(RestoreResult::Restored)
            }
            None if stream.bar_count() >= min_range_bars => {
                warn!(
                    stream = %stream.stream_id,
                    bars = stream.bar_count(),
                    "no restore data — recomputing previously locked range from bars"
                );
                if stream.relock_from_bars(now, ctx).await {
                    Ok(RestoreResult::Recomputed)
                } else {
                    stream.suspend("range_recompute_failed", now, ctx);
                    Ok(RestoreResult::Suspended)
                }
            }
            None => {
                ctx.events.emit(
                    EventLevel::Critical,
                    "restore_data_insufficient",
                    &EventScope::stream(
                        stream.stream_id.clone(),
                        stream.canonical_instrument.clone(),
                        stream.trading_date,
                    ),
                    json!({
                        "bars": stream.bar_count(),
                        "min_range_bars": min_range_bars,
                    }),
                );
                stream.suspend("restore_failed_bars_insufficient", now, ctx);
                Ok(RestoreResult::Suspended)
            }
        }
    }

    /// Hydration log first, ranges log as the redundant fallback.
    fn load_range(
        stream: &StreamStateMachine,
        ctx: &StreamCtx,
    ) -> Result<Option<RestoredRange>> {
        if let Some(range) = ctx
            .hydration
            .latest_range_for(stream.trading_date, &stream.stream_id)?
        {
            return Ok(Some(range));
        }
        ctx.ranges
            .latest_range_for(stream.trading_date, &stream.stream_id)
    }

    /// Older logs carry the range without breakout levels; recompute them
    /// from the restored range and journal the repair.
    fn repair_levels(
        stream: &StreamStateMachine,
        restored: RestoredRange,
        now: DateTime<Utc>,
        ctx: &StreamCtx,
    ) -> LockedRange {
        let tick = stream.tick_size();
        match (restored.brk_long, restored.brk_short) {
            (Some(brk_long), Some(brk_short)) => LockedRange {
                range_high: restored.range_high,
                range_low: restored.range_low,
                freeze_close: restored.freeze_close,
                brk_long,
                brk_short,
            },
            _ => {
                let range = LockedRange {
                    range_high: restored.range_high,
                    range_low: restored.range_low,
                    freeze_close: restored.freeze_close,
                    brk_long: round_to_tick(restored.range_high + tick, tick),
                    brk_short: round_to_tick(restored.range_low - tick, tick),
                };
                ctx.events.emit(
                    EventLevel::Info,
                    "breakout_levels_computed",
                    &EventScope::stream(
                        stream.stream_id.clone(),
                        stream.canonical_instrument.clone(),
                        stream.trading_date,
                    ),
                    json!({ "brk_long": range.brk_long, "brk_short": range.brk_short }),
                );
                let record = HydrationRecord {
                    ts_utc: now,
                    event: "breakout_levels_computed".to_string(),
                    stream: stream.stream_id.clone(),
                    range_high: Some(range.range_high),
                    range_low: Some(range.range_low),
                    freeze_close: Some(range.freeze_close),
                    brk_long: Some(range.brk_long),
                    brk_short: Some(range.brk_short),
                };
                if let Err(e) = ctx.hydration.append(stream.trading_date, &record) {
                    warn!(stream = %stream.stream_id, error = %e, "failed to journal repaired levels");
                }
                range
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::StreamJournalRecord;
    use crate::stream::test_support::{bar_at, harness, make_stream};
    use chrono::{Duration, NaiveDate, TimeZone};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 11).unwrap()
    }

    fn slot_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 11, 12, 30, 0).unwrap()
    }

    fn locked_record(stop_brackets: bool) -> StreamJournalRecord {
        StreamJournalRecord {
            trading_date: date(),
            stream_id: "ES-0730".to_string(),
            last_state: "RANGE_LOCKED".to_string(),
            committed: false,
            stop_brackets_submitted_at_lock: stop_brackets,
            entry_detected: false,
            execution_interrupted_by_close: false,
            slot_instance_key: "ES-0730_07:30_2024-06-11".to_string(),
            prior_journal_key: None,
            reentry_submitted: false,
            updated_at_utc: Some(slot_utc()),
        }
    }

    fn hydration_record(with_brk: bool) -> HydrationRecord {
        HydrationRecord {
            ts_utc: slot_utc(),
            event: "range_locked".to_string(),
            stream: "ES-0730".to_string(),
            range_high: Some(4500.0),
            range_low: Some(4495.0),
            freeze_close: Some(4498.0),
            brk_long: with_brk.then_some(4500.25),
            brk_short: with_brk.then_some(4494.75),
        }
    }

    #[tokio::test]
    async fn fresh_stream_has_nothing_to_restore() {
        let h = harness(date());
        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, RestoreResult::Fresh);
        assert_eq!(stream.state(), StreamState::PreHydration);
    }

    #[tokio::test]
    async fn locked_stream_restores_identical_range() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(true)).unwrap();
        h.ctx.hydration.append(date(), &hydration_record(true)).unwrap();

        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc() + Duration::minutes(20), &h.ctx)
            .await
            .unwrap();

        assert_eq!(result, RestoreResult::Restored);
        assert_eq!(stream.state(), StreamState::RangeLocked);
        let range = stream.range().unwrap();
        assert!((range.range_high - 4500.0).abs() < 1e-9);
        assert!((range.brk_long - 4500.25).abs() < 1e-9);
        assert!(stream.stop_brackets_submitted());
    }

    #[tokio::test]
    async fn missing_breakout_levels_are_repaired() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(true)).unwrap();
        h.ctx
            .hydration
            .append(date(), &hydration_record(false))
            .unwrap();

        let mut stream = make_stream(&h, date());
        RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();

        let range = stream.range().unwrap();
        assert!((range.brk_long - 4500.25).abs() < 1e-9);
        assert!((range.brk_short - 4494.75).abs() < 1e-9);

        // The repair is journaled for the next restart.
        let restored = h
            .ctx
            .hydration
            .latest_range_for(date(), "ES-0730")
            .unwrap()
            .unwrap();
        assert_eq!(restored.brk_long, Some(4500.25));
    }

    #[tokio::test]
    async fn ranges_log_is_the_fallback_source() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(true)).unwrap();
        // No hydration log; only the compact ranges log.
        h.ctx.ranges.append(date(), &hydration_record(true)).unwrap();

        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, RestoreResult::Restored);
    }

    #[tokio::test]
    async fn entry_detected_restores_from_execution_journal() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(true)).unwrap();
        h.ctx.hydration.append(date(), &hydration_record(true)).unwrap();

        // Journal an entry fill under this (date, stream).
        let mut probe = make_stream(&h, date());
        let now = slot_utc() + Duration::minutes(1);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap();
        probe.on_bar(&bar_at(t0, 4500.0, 4495.0, 4498.0), now, &h.ctx);
        probe.tick(slot_utc() - Duration::hours(3), false, &h.ctx).await;
        probe.tick(slot_utc() - Duration::hours(2), false, &h.ctx).await;
        probe.tick(slot_utc(), false, &h.ctx).await;
        let long_id = probe.long_intent().unwrap().intent_id.clone();
        h.ctx
            .journal
            .record_entry_fill(&long_id, 4500.50, 1, now)
            .unwrap();

        let mut stream = make_stream(&h, date());
        RestoreLayer::restore(&mut stream, 5, now, &h.ctx).await.unwrap();
        assert!(stream.entry_detected());
    }

    #[tokio::test]
    async fn no_restore_data_and_few_bars_suspends() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(false)).unwrap();

        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, RestoreResult::Suspended);
        assert_eq!(stream.state(), StreamState::SuspendedDataInsufficient);
    }

    #[tokio::test]
    async fn no_restore_data_with_enough_bars_recomputes() {
        let h = harness(date());
        h.ctx.stream_journals.save(&locked_record(false)).unwrap();

        let mut stream = make_stream(&h, date());
        let now = slot_utc() + Duration::minutes(5);
        let t0 = Utc.with_ymd_and_hms(2024, 6, 11, 12, 0, 0).unwrap();
        for i in 0..5 {
            stream.on_bar(
                &bar_at(t0 + Duration::minutes(i), 4500.0, 4495.0, 4498.0),
                now,
                &h.ctx,
            );
        }

        let result = RestoreLayer::restore(&mut stream, 5, now, &h.ctx).await.unwrap();
        assert_eq!(result, RestoreResult::Recomputed);
        assert_eq!(stream.state(), StreamState::RangeLocked);
        assert!((stream.range().unwrap().brk_long - 4500.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn committed_record_short_circuits() {
        let h = harness(date());
        let mut record = locked_record(true);
        record.committed = true;
        record.last_state = "DONE".to_string();
        h.ctx.stream_journals.save(&record).unwrap();

        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, RestoreResult::AlreadyCommitted);
        assert_eq!(stream.state(), StreamState::Done);
    }

    #[tokio::test]
    async fn pre_lock_record_only_marks_restart() {
        let h = harness(date());
        let mut record = locked_record(false);
        record.last_state = "RANGE_BUILDING".to_string();
        h.ctx.stream_journals.save(&record).unwrap();

        let mut stream = make_stream(&h, date());
        let result = RestoreLayer::restore(&mut stream, 5, slot_utc(), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result, RestoreResult::MarkedRestart);
        assert_eq!(stream.state(), StreamState::PreHydration);
    }
}
