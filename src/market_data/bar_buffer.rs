// =============================================================================
// Bar Buffer — per-stream ordered set of one-minute bars with source
// precedence
// =============================================================================
//
// Bars are keyed by their minute-aligned open time (UTC). Dedup precedence is
// LIVE > HISTORICAL > FILE: a higher-precedence bar replaces a lower one at
// the same key; anything else at an occupied key is dropped. A bar accepted
// at a key is otherwise immutable.
//
// The buffer is owned by exactly one stream and mutated only on the engine
// task, so it carries no lock of its own.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::BarSource;

/// A single immutable one-minute OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time_utc: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub source: BarSource,
}

/// What happened to a bar offered to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Stored at a previously empty key.
    Admitted,
    /// Replaced a lower-precedence bar at the same key.
    Replaced(BarSource),
    /// Dropped: a bar of equal or higher precedence already holds the key.
    DroppedLowerPrecedence(BarSource),
    /// Rejected: open time is not aligned to a minute boundary.
    RejectedMisaligned,
    /// Rejected: the bar would still be in progress at `now`.
    RejectedInProgress,
    /// Rejected: open time falls outside the admission window.
    RejectedOutsideWindow,
}

impl AdmissionOutcome {
    /// True when the offered bar is now the bar stored at its key.
    pub fn accepted(self) -> bool {
        matches!(self, Self::Admitted | Self::Replaced(_))
    }
}

/// The raw range computed from admitted bars at lock time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRange {
    pub high: f64,
    pub low: f64,
    pub freeze_close: f64,
    pub bar_count: usize,
}

/// Ordered, deduplicated store of one-minute bars for a single stream.
#[derive(Debug)]
pub struct BarBuffer {
    bars: BTreeMap<DateTime<Utc>, Bar>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

impl BarBuffer {
    /// Create a buffer admitting bars whose open time lies in
    /// `[window_start, window_end]`, inclusive on both ends.
    pub fn new(window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self {
            bars: BTreeMap::new(),
            window_start,
            window_end,
        }
    }

    /// Offer a bar to the buffer.
    ///
    /// Admission requires, in order: a minute-aligned open time, an open time
    /// no later than `now - 60s` (the bar must have closed), and an open time
    /// inside the admission window. Surviving bars then go through source
    /// precedence dedup.
    pub fn admit(&mut self, bar: Bar, now_utc: DateTime<Utc>) -> AdmissionOutcome {
        let key = bar.open_time_utc;

        if key.second() != 0 || key.nanosecond() != 0 {
            return AdmissionOutcome::RejectedMisaligned;
        }
        if key > now_utc - Duration::seconds(60) {
            return AdmissionOutcome::RejectedInProgress;
        }
        if key < self.window_start || key > self.window_end {
            return AdmissionOutcome::RejectedOutsideWindow;
        }

        match self.bars.get(&key) {
            None => {
                self.bars.insert(key, bar);
                AdmissionOutcome::Admitted
            }
            Some(existing) if bar.source > existing.source => {
                let replaced = existing.source;
                self.bars.insert(key, bar);
                AdmissionOutcome::Replaced(replaced)
            }
            Some(existing) => AdmissionOutcome::DroppedLowerPrecedence(existing.source),
        }
    }

    /// Number of admitted bars.
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// True when no bar has been admitted.
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// The source currently stored at a minute key, if any.
    pub fn source_at(&self, key: DateTime<Utc>) -> Option<BarSource> {
        self.bars.get(&key).map(|b| b.source)
    }

    /// Iterate admitted bars in open-time order.
    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.bars.values()
    }

    /// Compute the locked range from all admitted bars: max high, min low,
    /// and the close of the latest admitted bar. Returns `None` when the
    /// buffer is empty.
    pub fn compute_range(&self) -> Option<RawRange> {
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut freeze_close = None;

        for bar in self.bars.values() {
            high = high.max(bar.high);
            low = low.min(bar.low);
            freeze_close = Some(bar.close);
        }

        freeze_close.map(|freeze_close| RawRange {
            high,
            low,
            freeze_close,
            bar_count: self.bars.len(),
        })
    }
}
