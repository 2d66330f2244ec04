//! Market-hours calendar: the monitor asks once per tick and skips
//! evaluation entirely while the market is closed.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Market-hours contract.
pub trait TradingCalendar {
    fn is_market_open(&self, now: DateTime<Utc>) -> bool;
}

/// Regular-session calendar: fixed UTC open/close, weekends off, plus a
/// holiday date list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCalendar {
    /// Session open, UTC
    pub open: NaiveTime,

    /// Session close, UTC
    pub close: NaiveTime,

    /// Full-day market holidays
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for SessionCalendar {
    fn default() -> Self {
        Self {
            // NYSE regular session, 9:30-16:00 Eastern, expressed in UTC
            open: NaiveTime::from_hms_opt(14, 30, 0).expect("valid session open"),
            close: NaiveTime::from_hms_opt(21, 0, 0).expect("valid session close"),
            holidays: Vec::new(),
        }
    }
}

impl TradingCalendar for SessionCalendar {
    fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        let weekday = now.weekday();
        if weekday == Weekday::Sat || weekday == Weekday::Sun {
            return false;
        }
        if self.holidays.contains(&now.date_naive()) {
            return false;
        }
        let time = now.time();
        time >= self.open && time < self.close
    }
}

/// Calendar that is always open; for paper sessions and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl TradingCalendar for AlwaysOpen {
    fn is_market_open(&self, _now: DateTime<Utc>) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_hours() {
        let calendar = SessionCalendar::default();

        // Tuesday mid-session
        let open = Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap();
        assert!(calendar.is_market_open(open));

        // Tuesday pre-market
        let early = Utc.with_ymd_and_hms(2024, 3, 5, 13, 0, 0).unwrap();
        assert!(!calendar.is_market_open(early));

        // Tuesday after the close
        let late = Utc.with_ymd_and_hms(2024, 3, 5, 21, 30, 0).unwrap();
        assert!(!calendar.is_market_open(late));
    }

    #[test]
    fn test_weekend_closed() {
        let calendar = SessionCalendar::default();
        let saturday = Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap();
        assert!(!calendar.is_market_open(saturday));
    }

    #[test]
    fn test_holiday_closed() {
        let mut calendar = SessionCalendar::default();
        calendar
            .holidays
            .push(NaiveDate::from_ymd_opt(2024, 7, 4).unwrap());

        let independence_day = Utc.with_ymd_and_hms(2024, 7, 4, 15, 0, 0).unwrap();
        assert!(!calendar.is_market_open(independence_day));
    }
}
