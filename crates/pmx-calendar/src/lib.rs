//! Trading calendars at business-date granularity.
//!
//! Deterministic, pure logic. No IO, no wall-clock, no randomness.
//!
//! [`CalendarSpec`] answers `is_trading_day` / `next_trading_day` for a
//! region. Holidays are computed from the exchanges' published rules
//! (nth-weekday observances, Easter-derived closures, weekend observation
//! shifts) rather than a static table, so any year works. The pipeline only
//! ever asks date-level questions; intraday session times are out of scope
//! here.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Specifies which dates are trading days for a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalendarSpec {
    /// Every calendar date is a trading day. Used by tests and 24/7 venues.
    AlwaysOn,

    /// US equities: Monday–Friday, closed on the NYSE full-day holidays
    /// (rule-derived, including Saturday→Friday / Sunday→Monday observation
    /// shifts).
    UsEquity,

    /// European equities: Monday–Friday, closed on the holidays the major
    /// pan-European venues share (fixed-date, no observation shifts, plus
    /// the Easter closures).
    EuEquity,
}

impl CalendarSpec {
    /// Resolve from the spec name stored on a `Market` row.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ALWAYS_ON" => Some(CalendarSpec::AlwaysOn),
            "US_EQUITY" => Some(CalendarSpec::UsEquity),
            "EU_EQUITY" => Some(CalendarSpec::EuEquity),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalendarSpec::AlwaysOn => "ALWAYS_ON",
            CalendarSpec::UsEquity => "US_EQUITY",
            CalendarSpec::EuEquity => "EU_EQUITY",
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        match self {
            CalendarSpec::AlwaysOn => true,
            CalendarSpec::UsEquity => is_weekday(date) && !is_us_holiday(date),
            CalendarSpec::EuEquity => is_weekday(date) && !is_eu_holiday(date),
        }
    }

    /// First trading day strictly after `date`.
    ///
    /// Bounded walk: the longest closed stretch in any supported calendar is
    /// a few days, so the 30-day cap is unreachable in practice; hitting it
    /// means the holiday rules are broken and we fail loudly via panic in
    /// debug, saturating in release.
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date + Duration::days(1);
        for _ in 0..30 {
            if self.is_trading_day(d) {
                return d;
            }
            d += Duration::days(1);
        }
        debug_assert!(false, "no trading day within 30 days of {date}");
        d
    }

    /// All trading days in `[start, end]` inclusive, ascending.
    pub fn trading_days_between(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        let mut d = start;
        while d <= end {
            if self.is_trading_day(d) {
                out.push(d);
            }
            d += Duration::days(1);
        }
        out
    }

    /// Most recent trading day at or before `date`.
    pub fn trading_day_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        let mut d = date;
        for _ in 0..30 {
            if self.is_trading_day(d) {
                return d;
            }
            d -= Duration::days(1);
        }
        debug_assert!(false, "no trading day within 30 days before {date}");
        d
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

// ---------------------------------------------------------------------------
// US full-day holiday rules
// ---------------------------------------------------------------------------

/// NYSE full-day closures, derived from the exchange's rules:
/// - New Year's Day (Jan 1; a Sunday shifts to Monday, a Saturday is simply
///   not observed — the prior trading year absorbs it)
/// - Martin Luther King Jr. Day (third Monday of January)
/// - Washington's Birthday (third Monday of February)
/// - Good Friday (two days before Easter Sunday)
/// - Memorial Day (last Monday of May)
/// - Juneteenth (Jun 19, observed by the exchange from 2022)
/// - Independence Day (Jul 4), Christmas (Dec 25) — both with the usual
///   Saturday→Friday / Sunday→Monday shift
/// - Labor Day (first Monday of September)
/// - Thanksgiving (fourth Thursday of November)
fn is_us_holiday(date: NaiveDate) -> bool {
    let year = date.year();

    // Fixed-date holidays with observation shifts.
    if date == shift_weekend(ymd(year, 7, 4)) || date == shift_weekend(ymd(year, 12, 25)) {
        return true;
    }
    if year >= 2022 && date == shift_weekend(ymd(year, 6, 19)) {
        return true;
    }
    // New Year's Day only shifts forward; a Saturday Jan 1 is unobserved.
    let new_year = ymd(year, 1, 1);
    let observed_new_year = match new_year.weekday() {
        Weekday::Sat => None,
        Weekday::Sun => Some(new_year + Duration::days(1)),
        _ => Some(new_year),
    };
    if observed_new_year == Some(date) {
        return true;
    }

    // Floating weekday holidays.
    date == nth_weekday(year, 1, Weekday::Mon, 3)
        || date == nth_weekday(year, 2, Weekday::Mon, 3)
        || date == last_weekday(year, 5, Weekday::Mon)
        || date == nth_weekday(year, 9, Weekday::Mon, 1)
        || date == nth_weekday(year, 11, Weekday::Thu, 4)
        // Easter-derived.
        || date == easter_sunday(year) - Duration::days(2)
}

// ---------------------------------------------------------------------------
// EU shared holiday rules
// ---------------------------------------------------------------------------

/// Closures shared by the major pan-European venues: New Year's Day,
/// Good Friday, Easter Monday, Labour Day (May 1), Christmas and Boxing Day.
/// No observation shifts — a weekend holiday is just a weekend.
fn is_eu_holiday(date: NaiveDate) -> bool {
    let year = date.year();
    let easter = easter_sunday(year);

    date == ymd(year, 1, 1)
        || date == easter - Duration::days(2)
        || date == easter + Duration::days(1)
        || date == ymd(year, 5, 1)
        || date == ymd(year, 12, 25)
        || date == ymd(year, 12, 26)
}

// ---------------------------------------------------------------------------
// Date rule helpers
// ---------------------------------------------------------------------------

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("holiday rules use valid civil dates")
}

/// Saturday observes on the preceding Friday, Sunday on the following
/// Monday; weekdays observe on the day itself.
fn shift_weekend(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// The `n`-th `weekday` of a month (n is 1-based).
fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u32) -> NaiveDate {
    let first = ymd(year, month, 1);
    let offset = (7 + weekday.num_days_from_monday() as i64
        - first.weekday().num_days_from_monday() as i64)
        % 7;
    first + Duration::days(offset + 7 * (n as i64 - 1))
}

/// The last `weekday` of a month.
fn last_weekday(year: i32, month: u32, weekday: Weekday) -> NaiveDate {
    let next_month_first = if month == 12 {
        ymd(year + 1, 1, 1)
    } else {
        ymd(year, month + 1, 1)
    };
    let mut d = next_month_first - Duration::days(1);
    while d.weekday() != weekday {
        d -= Duration::days(1);
    }
    d
}

/// Gregorian Easter Sunday (anonymous computus).
fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}

/// Region → calendar mapping used when a market row does not carry an
/// explicit spec name.
pub fn default_for_region(region: &str) -> CalendarSpec {
    match region {
        "US" => CalendarSpec::UsEquity,
        "EU" => CalendarSpec::EuEquity,
        _ => CalendarSpec::AlwaysOn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn weekday_is_trading_weekend_is_not() {
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2025-03-10"))); // Monday
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2025-03-08"))); // Saturday
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2025-03-09"))); // Sunday
    }

    #[test]
    fn computus_places_easter_derived_closures() {
        // Good Friday across several years exercises the computus directly.
        for gf in ["2023-04-07", "2024-03-29", "2025-04-18", "2026-04-03"] {
            assert!(!CalendarSpec::UsEquity.is_trading_day(d(gf)), "{gf}");
            assert!(!CalendarSpec::EuEquity.is_trading_day(d(gf)), "{gf}");
        }
    }

    #[test]
    fn floating_weekday_holidays() {
        // Third Monday of January (MLK) and of February, last Monday of May,
        // first Monday of September, fourth Thursday of November.
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2024-01-15")));
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2025-02-17")));
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2023-05-29")));
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2026-09-07")));
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2025-11-27")));
        // The Mondays on either side of MLK 2024 trade normally.
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2024-01-08")));
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2024-01-22")));
    }

    #[test]
    fn weekend_observation_shifts() {
        // Jul 4 2026 falls on a Saturday: Friday Jul 3 is closed instead.
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2026-07-03")));
        // Dec 25 2021 fell on a Saturday: Friday Dec 24 was closed.
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2021-12-24")));
        // Jan 1 2023 fell on a Sunday: Monday Jan 2 was closed.
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2023-01-02")));
        // Jan 1 2022 fell on a Saturday: not observed, Dec 31 2021 traded.
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2021-12-31")));
    }

    #[test]
    fn juneteenth_observed_from_2022() {
        assert!(!CalendarSpec::UsEquity.is_trading_day(d("2023-06-19")));
        // Jun 19 2021 fell on a Saturday; the exchange did not yet observe
        // it, so the preceding Friday traded.
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2021-06-18")));
    }

    #[test]
    fn eu_has_easter_monday_us_does_not() {
        assert!(!CalendarSpec::EuEquity.is_trading_day(d("2025-04-21")));
        assert!(CalendarSpec::UsEquity.is_trading_day(d("2025-04-21")));
    }

    #[test]
    fn eu_fixed_dates_do_not_shift() {
        assert!(!CalendarSpec::EuEquity.is_trading_day(d("2025-05-01")));
        assert!(!CalendarSpec::EuEquity.is_trading_day(d("2024-12-26")));
        // Boxing Day 2026 falls on a Saturday; the following Monday trades.
        assert!(CalendarSpec::EuEquity.is_trading_day(d("2026-12-28")));
    }

    #[test]
    fn next_trading_day_skips_weekend_and_holiday() {
        // Friday 2025-04-18 is Good Friday; Thursday's next trading day is Monday.
        assert_eq!(
            CalendarSpec::UsEquity.next_trading_day(d("2025-04-17")),
            d("2025-04-21")
        );
        // Plain Friday → Monday.
        assert_eq!(
            CalendarSpec::UsEquity.next_trading_day(d("2025-03-07")),
            d("2025-03-10")
        );
    }

    #[test]
    fn trading_days_between_inclusive() {
        let days =
            CalendarSpec::UsEquity.trading_days_between(d("2025-03-07"), d("2025-03-12"));
        assert_eq!(
            days,
            vec![d("2025-03-07"), d("2025-03-10"), d("2025-03-11"), d("2025-03-12")]
        );
    }

    #[test]
    fn trading_day_on_or_before_rolls_back() {
        assert_eq!(
            CalendarSpec::UsEquity.trading_day_on_or_before(d("2025-03-09")),
            d("2025-03-07")
        );
        assert_eq!(
            CalendarSpec::UsEquity.trading_day_on_or_before(d("2025-03-10")),
            d("2025-03-10")
        );
    }

    #[test]
    fn always_on_includes_weekend() {
        assert!(CalendarSpec::AlwaysOn.is_trading_day(d("2025-03-08")));
        assert_eq!(
            CalendarSpec::AlwaysOn.next_trading_day(d("2025-03-07")),
            d("2025-03-08")
        );
    }

    #[test]
    fn spec_names_round_trip() {
        for spec in [CalendarSpec::AlwaysOn, CalendarSpec::UsEquity, CalendarSpec::EuEquity] {
            assert_eq!(CalendarSpec::from_name(spec.name()), Some(spec));
        }
        assert_eq!(CalendarSpec::from_name("LUNAR"), None);
    }
}
