// =============================================================================
// Time Service — market-timezone wall time to UTC resolution
// =============================================================================
//
// All scheduling inputs (range start, slot time, market close, forced
// flatten) are wall times in the single configured market timezone. This
// service resolves them against a trading date into UTC instants exactly
// once; callers never recompute them.
// =============================================================================

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Resolves market-local wall times to UTC instants.
#[derive(Debug, Clone)]
pub struct TimeService {
    tz: Tz,
}

impl TimeService {
    /// Build a service for the named IANA timezone (e.g. "America/Chicago").
    pub fn new(timezone: &str) -> Result<Self> {
        let tz: Tz = timezone
            .parse()
            .map_err(|e| anyhow!("invalid market timezone {timezone:?}: {e}"))?;
        Ok(Self { tz })
    }

    /// The configured market timezone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Resolve a local wall time ("HH:MM") on `trading_date` to a UTC instant.
    ///
    /// DST policy: an ambiguous local time resolves to the earlier instant; a
    /// local time inside a spring-forward gap resolves to one hour later.
    pub fn resolve_local(&self, trading_date: NaiveDate, wall_time: &str) -> Result<DateTime<Utc>> {
        let time = parse_wall_time(wall_time)?;
        let naive = trading_date.and_time(time);

        let local = match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(earliest, _latest) => earliest,
            LocalResult::None => {
                let shifted = naive + chrono::Duration::hours(1);
                self.tz
                    .from_local_datetime(&shifted)
                    .earliest()
                    .ok_or_else(|| {
                        anyhow!("wall time {wall_time} on {trading_date} is unresolvable in {}", self.tz)
                    })?
            }
        };

        Ok(local.with_timezone(&Utc))
    }

    /// The calendar date in the market timezone at `utc_now`.
    pub fn trading_date_at(&self, utc_now: DateTime<Utc>) -> NaiveDate {
        utc_now.with_timezone(&self.tz).date_naive()
    }
}

/// Parse "HH:MM" into a `NaiveTime`.
pub fn parse_wall_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("invalid wall time {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chicago() -> TimeService {
        TimeService::new("America/Chicago").unwrap()
    }

    #[test]
    fn resolves_cst_winter() {
        // January: Chicago is UTC-6.
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let utc = chicago().resolve_local(date, "07:30").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-01-15T13:30:00+00:00");
    }

    #[test]
    fn resolves_cdt_summer() {
        // July: Chicago is UTC-5.
        let date = NaiveDate::from_ymd_opt(2024, 7, 15).unwrap();
        let utc = chicago().resolve_local(date, "07:30").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-07-15T12:30:00+00:00");
    }

    #[test]
    fn spring_forward_gap_shifts_one_hour() {
        // 2024-03-10 02:30 does not exist in Chicago; resolves as 03:30 CDT.
        let date = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let utc = chicago().resolve_local(date, "02:30").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-03-10T08:30:00+00:00");
    }

    #[test]
    fn fall_back_ambiguity_takes_earlier() {
        // 2024-11-03 01:30 occurs twice; the CDT (earlier) instant wins.
        let date = NaiveDate::from_ymd_opt(2024, 11, 3).unwrap();
        let utc = chicago().resolve_local(date, "01:30").unwrap();
        assert_eq!(utc.to_rfc3339(), "2024-11-03T06:30:00+00:00");
    }

    #[test]
    fn rejects_bad_wall_time() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert!(chicago().resolve_local(date, "7:3x").is_err());
    }

    #[test]
    fn rejects_bad_timezone() {
        assert!(TimeService::new("America/Nowhere").is_err());
    }

    #[test]
    fn trading_date_rolls_with_market_tz() {
        // 02:00 UTC is still the previous evening in Chicago.
        let utc = DateTime::parse_from_rfc3339("2024-06-12T02:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let date = chicago().trading_date_at(utc);
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 6, 11).unwrap());
    }
}
