// =============================================================================
// Historical Bar Store — one CSV file per instrument and trading day
// =============================================================================
//
// Layout: data/raw/{canonical}/1m/{yyyy}/{MM}/{CANONICAL}_1m_{yyyy-MM-dd}.csv
// Header: timestamp_utc,open,high,low,close,volume
//
// The retrospective fetch reads from this store tagged HISTORICAL; the warm
// startup seed reads the same files tagged FILE so that a later fetch (or the
// live feed) can supersede it under buffer precedence.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

use crate::market_data::Bar;
use crate::types::BarSource;

/// Path of the day file for `canonical` on `date` under `root`.
pub fn day_file_path(root: &Path, canonical: &str, date: NaiveDate) -> PathBuf {
    root.join(canonical)
        .join("1m")
        .join(format!("{}", date.format("%Y")))
        .join(format!("{}", date.format("%m")))
        .join(format!(
            "{}_1m_{}.csv",
            canonical.to_uppercase(),
            date.format("%Y-%m-%d")
        ))
}

/// Load one day of bars for `canonical`, tagged with `source`.
///
/// A missing day file is not an error (holidays, not-yet-synced data): it
/// yields an empty vector. A present but malformed file is an error.
///
/// `end` caps the loaded bars (`open_time_utc <= end`); restart paths use it
/// to fetch up to `min(slot_time, now)`.
pub fn load_day(
    root: &Path,
    canonical: &str,
    date: NaiveDate,
    end: Option<DateTime<Utc>>,
    source: BarSource,
) -> Result<Vec<Bar>> {
    let path = day_file_path(root, canonical, date);
    if !path.exists() {
        debug!(path = %path.display(), "no historical day file");
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    parse_day_csv(&content, end, source)
        .with_context(|| format!("malformed historical file {}", path.display()))
}

/// Parse the CSV body. Exposed separately so tests can feed literals.
fn parse_day_csv(
    content: &str,
    end: Option<DateTime<Utc>>,
    source: BarSource,
) -> Result<Vec<Bar>> {
    let mut lines = content.lines().enumerate();

    match lines.next() {
        Some((_, header)) if header.trim() == "timestamp_utc,open,high,low,close,volume" => {}
        Some((_, header)) => bail!("unexpected CSV header: {header:?}"),
        None => bail!("empty CSV file"),
    }

    let mut bars = Vec::new();
    for (idx, line) in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let bar =
            parse_day_line(line, source).with_context(|| format!("CSV line {}", idx + 1))?;
        if let Some(end) = end {
            if bar.open_time_utc > end {
                continue;
            }
        }
        bars.push(bar);
    }
    Ok(bars)
}

fn parse_day_line(line: &str, source: BarSource) -> Result<Bar> {
    let mut fields = line.split(',');
    let mut next = |name: &str| {
        fields
            .next()
            .with_context(|| format!("missing field {name}"))
    };

    let ts = next("timestamp_utc")?;
    let open_time_utc = DateTime::parse_from_rfc3339(ts)
        .with_context(|| format!("invalid timestamp_utc {ts:?}"))?
        .with_timezone(&Utc);

    let open: f64 = next("open")?.parse().context("invalid open")?;
    let high: f64 = next("high")?.parse().context("invalid high")?;
    let low: f64 = next("low")?.parse().context("invalid low")?;
    let close: f64 = next("close")?.parse().context("invalid close")?;
    let volume: u64 = next("volume")?.parse().context("invalid volume")?;

    Ok(Bar {
        open_time_utc,
        open,
        high,
        low,
        close,
        volume,
        source,
    })
}
