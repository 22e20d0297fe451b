// =============================================================================
// Session Calendar — market-open boundary
// =============================================================================
//
// The Korean market-calendar oracle (holiday schedule) is an external
// collaborator (out of scope). This module models the trait boundary plus
// the explicit fallback spec.md names: weekday + time-window only.
// =============================================================================

use chrono::{Datelike, NaiveDate, NaiveTime, Timelike, Weekday};

const SESSION_OPEN: (u32, u32, u32) = (9, 0, 0);
const SESSION_CLOSE: (u32, u32, u32) = (15, 20, 0);

pub trait SessionCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
}

/// Weekday-only fallback: every Monday-Friday is a trading day. This is the
/// calendar's default behavior absent an external holiday oracle.
pub struct WeekdayCalendar;

impl SessionCalendar for WeekdayCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }
}

/// Stands in for the out-of-scope external holiday oracle; simply defers to
/// the weekday fallback.
pub struct NullCalendarOracle {
    fallback: WeekdayCalendar,
}

impl NullCalendarOracle {
    pub fn new() -> Self {
        Self { fallback: WeekdayCalendar }
    }
}

impl Default for NullCalendarOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCalendar for NullCalendarOracle {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.fallback.is_trading_day(date)
    }
}

/// Market is open iff local time is in [09:00:00, 15:20:00] and the
/// calendar considers the date a session.
pub fn is_market_open(now: chrono::DateTime<chrono::Local>, calendar: &dyn SessionCalendar) -> bool {
    if !calendar.is_trading_day(now.date_naive()) {
        return false;
    }
    let open = NaiveTime::from_hms_opt(SESSION_OPEN.0, SESSION_OPEN.1, SESSION_OPEN.2).unwrap();
    let close = NaiveTime::from_hms_opt(SESSION_CLOSE.0, SESSION_CLOSE.1, SESSION_CLOSE.2).unwrap();
    let t = now.time();
    t >= open && t <= close
}

/// Minutes-since-midnight helper used by time-window checks across the
/// Scheduler and Position Manager special cycles.
pub fn minutes_since_midnight(now: chrono::DateTime<chrono::Local>) -> u32 {
    now.hour() * 60 + now.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn weekday_calendar_rejects_weekends() {
        let cal = WeekdayCalendar;
        let saturday = NaiveDate::from_ymd_opt(2026, 8, 1).unwrap();
        assert_eq!(saturday.weekday(), Weekday::Sat);
        assert!(!cal.is_trading_day(saturday));
    }

    #[test]
    fn weekday_calendar_accepts_weekdays() {
        let cal = WeekdayCalendar;
        let tuesday = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        assert_eq!(tuesday.weekday(), Weekday::Tue);
        assert!(cal.is_trading_day(tuesday));
    }

    #[test]
    fn market_open_window_boundaries() {
        let cal = NullCalendarOracle::new();
        let open_edge = chrono::Local.with_ymd_and_hms(2026, 7, 28, 9, 0, 0).unwrap();
        let close_edge = chrono::Local.with_ymd_and_hms(2026, 7, 28, 15, 20, 0).unwrap();
        let before = chrono::Local.with_ymd_and_hms(2026, 7, 28, 8, 59, 59).unwrap();
        let after = chrono::Local.with_ymd_and_hms(2026, 7, 28, 15, 20, 1).unwrap();

        assert!(is_market_open(open_edge, &cal));
        assert!(is_market_open(close_edge, &cal));
        assert!(!is_market_open(before, &cal));
        assert!(!is_market_open(after, &cal));
    }

    #[test]
    fn market_closed_on_weekend_regardless_of_time() {
        let cal = NullCalendarOracle::new();
        let saturday_noon = chrono::Local.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        assert!(!is_market_open(saturday_noon, &cal));
    }
}
