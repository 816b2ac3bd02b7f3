//! Billing period arithmetic. Pure functions over UTC timestamps.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Utc};

/// First instant of the calendar month containing `now`, and of the next month.
pub fn calendar_month_containing(now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)?;
    let next = first.checked_add_months(Months::new(1))?;
    Some((
        Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?),
        Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?),
    ))
}

/// One calendar month after `start`, landing on `anchor_day` or the last day
/// of the target month when it is shorter. Time of day is preserved.
///
/// Jan 31 → Feb 28 (or 29), and with anchor 31 the next step is Mar 31.
pub fn advance_one_month(start: DateTime<Utc>, anchor_day: u32) -> Option<DateTime<Utc>> {
    let date = start.date_naive();
    let target = date.with_day(1)?.checked_add_months(Months::new(1))?;
    let day = anchor_day.clamp(1, days_in_month(target)?);
    let next = target.with_day(day)?;
    Some(Utc.from_utc_datetime(&next.and_time(start.time())))
}

fn days_in_month(date: NaiveDate) -> Option<u32> {
    let first = date.with_day(1)?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
    Some(last.day())
}
