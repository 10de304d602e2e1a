use std::fmt;

use chrono::{Datelike, Duration, NaiveDate};

use crate::campaign::Campaign;
use crate::date_util::{last_day_of_month, Month};
use crate::error::Result;

/// Days Search Console needs before a date's numbers stop moving.
pub const DEFAULT_REPORTING_LAG_DAYS: i64 = 3;

/// Days before the campaign start that define its baseline position.
pub const INITIAL_POSITION_DAYS: i64 = 7;

/// Months of fully elapsed traffic kept in the rolling window.
pub const TRAFFIC_HISTORY_MONTHS: u32 = 12;

/// A half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day + Duration::days(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, d: NaiveDate) -> bool {
        d >= self.start && d < self.end
    }

    /// Last day inside the window.
    pub fn last_day(&self) -> NaiveDate {
        self.end - Duration::days(1)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d < self.end)
    }

    pub fn num_days(&self) -> i64 {
        (self.end - self.start).num_days().max(0)
    }

    /// Month the window starts in. Month windows never straddle two months.
    pub fn month(&self) -> Month {
        Month::of(self.start)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Windows for the rolling traffic sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficWindows {
    /// The fully elapsed months, oldest first.
    pub months: Vec<Month>,
    /// One window spanning all of `months`, clipped to the lag boundary.
    pub history: DateWindow,
    /// First of the current month through the lag boundary, if any day of
    /// the current month is already reportable.
    pub current_month: Option<DateWindow>,
}

/// Computes every fetch window relative to a fixed "today" and reporting lag.
/// No window extends past `today - lag`.
#[derive(Debug, Clone, Copy)]
pub struct RangeFetchCoordinator {
    today: NaiveDate,
    lag_days: i64,
}

impl RangeFetchCoordinator {
    pub fn new(today: NaiveDate, lag_days: i64) -> Self {
        Self {
            today,
            lag_days,
        }
    }

    /// Last reportable day (inclusive).
    pub fn boundary(&self) -> NaiveDate {
        (self.today - Duration::days(self.lag_days)).min(self.today)
    }

    /// The single day the daily incremental sync targets.
    pub fn daily_target_window(&self) -> DateWindow {
        DateWindow::single_day(self.boundary())
    }

    /// Month-bounded windows from the campaign's start through the lag
    /// boundary, ascending, with the first and last months clipped.
    pub fn monthly_backfill_windows(&self, campaign: &Campaign) -> Result<Vec<DateWindow>> {
        let start = campaign.require_start_date()?;
        Ok(split_into_months(start, self.boundary()))
    }

    /// The seven days immediately before the campaign start.
    pub fn initial_position_window(&self, campaign: &Campaign) -> Result<DateWindow> {
        let start = campaign.require_start_date()?;
        let window = DateWindow::new(start - Duration::days(INITIAL_POSITION_DAYS), start);
        Ok(self.clip(window))
    }

    /// The last twelve fully elapsed calendar months plus the current month
    /// to date.
    pub fn traffic_windows(&self) -> TrafficWindows {
        let current = Month::of(self.today);
        let mut first = current;
        for _ in 0..TRAFFIC_HISTORY_MONTHS {
            first = first.pred();
        }

        let mut months = Vec::with_capacity(TRAFFIC_HISTORY_MONTHS as usize);
        let mut m = first;
        while m < current {
            // A month is over once its last day is behind us.
            if m.last_day() < self.today {
                months.push(m);
            }
            m = m.succ();
        }

        let history = self.clip(DateWindow::new(first.first_day(), current.first_day()));
        let current_month = {
            let w = self.clip(DateWindow::new(current.first_day(), current.succ().first_day()));
            (!w.is_empty()).then_some(w)
        };

        TrafficWindows {
            months,
            history,
            current_month,
        }
    }

    fn clip(&self, window: DateWindow) -> DateWindow {
        let limit = self.boundary() + Duration::days(1);
        DateWindow {
            start: window.start,
            end: window.end.min(limit),
        }
    }
}

/// Split `[start, end]` (inclusive) into half-open month windows.
fn split_into_months(start: NaiveDate, end: NaiveDate) -> Vec<DateWindow> {
    let mut batches = Vec::new();
    let mut cursor = start;

    while cursor <= end {
        let month_end = last_day_of_month(cursor.year(), cursor.month());
        let batch_end = month_end.min(end);

        batches.push(DateWindow::new(cursor, batch_end + Duration::days(1)));

        cursor = batch_end + Duration::days(1);
    }

    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn campaign(start: Option<NaiveDate>) -> Campaign {
        Campaign {
            campaign_id: "c1".into(),
            site_url: "sc-domain:example.com".into(),
            keywords_raw: "shoes".into(),
            start_date: start,
            linked_account: Some("acct".into()),
        }
    }

    #[test]
    fn test_daily_target_is_today_minus_lag() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 10), 3);
        assert_eq!(c.daily_target_window(), DateWindow::new(d(2025, 3, 7), d(2025, 3, 8)));
    }

    #[test]
    fn test_backfill_clips_first_and_last_month() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 13), 3);
        let windows = c.monthly_backfill_windows(&campaign(Some(d(2025, 1, 15)))).unwrap();
        assert_eq!(
            windows,
            vec![
                DateWindow::new(d(2025, 1, 15), d(2025, 2, 1)),
                DateWindow::new(d(2025, 2, 1), d(2025, 3, 1)),
                DateWindow::new(d(2025, 3, 1), d(2025, 3, 11)),
            ]
        );
        assert!(windows.iter().all(|w| w.last_day() <= c.boundary()));
    }

    #[test]
    fn test_backfill_empty_when_start_after_boundary() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 10), 3);
        let windows = c.monthly_backfill_windows(&campaign(Some(d(2025, 3, 9)))).unwrap();
        assert!(windows.is_empty());
    }

    #[test]
    fn test_missing_start_date_produces_no_windows() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 10), 3);
        let err = c.monthly_backfill_windows(&campaign(None)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(c.initial_position_window(&campaign(None)).is_err());
    }

    #[test]
    fn test_initial_position_window_precedes_start() {
        let c = RangeFetchCoordinator::new(d(2025, 6, 1), 3);
        let w = c.initial_position_window(&campaign(Some(d(2025, 3, 3)))).unwrap();
        assert_eq!(w, DateWindow::new(d(2025, 2, 24), d(2025, 3, 3)));
        assert_eq!(w.num_days(), 7);
        assert!(!w.contains(d(2025, 3, 3)));
    }

    #[test]
    fn test_traffic_windows_skip_current_month() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 20), 3);
        let t = c.traffic_windows();
        assert_eq!(t.months.len(), 12);
        assert_eq!(t.months[0], Month { year: 2024, month: 3 });
        assert_eq!(t.months[11], Month { year: 2025, month: 2 });
        assert_eq!(t.history, DateWindow::new(d(2024, 3, 1), d(2025, 3, 1)));
        assert_eq!(t.current_month, Some(DateWindow::new(d(2025, 3, 1), d(2025, 3, 18))));
    }

    #[test]
    fn test_traffic_current_month_absent_early_in_month() {
        let c = RangeFetchCoordinator::new(d(2025, 3, 2), 3);
        let t = c.traffic_windows();
        assert_eq!(t.current_month, None);
        // February is over but its last days are still inside the lag.
        assert_eq!(t.history.end, d(2025, 2, 28));
    }

    #[test]
    fn test_split_into_months() {
        let batches = split_into_months(d(2025, 1, 15), d(2025, 3, 10));
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], DateWindow::new(d(2025, 1, 15), d(2025, 2, 1)));
        assert_eq!(batches[1], DateWindow::new(d(2025, 2, 1), d(2025, 3, 1)));
        assert_eq!(batches[2], DateWindow::new(d(2025, 3, 1), d(2025, 3, 11)));
    }

    #[test]
    fn test_window_days() {
        let w = DateWindow::new(d(2025, 2, 27), d(2025, 3, 2));
        let days: Vec<_> = w.days().collect();
        assert_eq!(days, vec![d(2025, 2, 27), d(2025, 2, 28), d(2025, 3, 1)]);
    }
}
