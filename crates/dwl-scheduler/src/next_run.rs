//! Next fire-time computation.
//!
//! Pure over (schedule, now, tz). Time-of-day is interpreted in the
//! configured zone; results are UTC. The contract: the returned instant is
//! `>= max(now-ish, start_date)`, strictly after `last_run_at`, and `None`
//! once the window is complete (past `end_date`) or the frequency is NA.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use dwl_schemas::codes::FrequencyCode;
use dwl_schemas::{parse_weekday, Schedule};

pub fn next_run_at(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let candidate = match schedule.frequency_code {
        FrequencyCode::None => return None,
        FrequencyCode::Interval => interval_next(schedule, now)?,
        FrequencyCode::Daily => stepped_next(schedule, now, tz, |d| d.succ_opt(), |d| Some(d))?,
        FrequencyCode::Weekly => {
            let weekday = parse_weekday(schedule.frequency_day.as_deref()?)?;
            stepped_next(
                schedule,
                now,
                tz,
                |d| d.succ_opt(),
                move |d| (d.weekday() == weekday).then_some(d),
            )?
        }
        FrequencyCode::Fortnightly => fortnight_next(schedule, now, tz)?,
        FrequencyCode::Monthly => month_step_next(schedule, now, tz, 1)?,
        FrequencyCode::HalfYearly => month_step_next(schedule, now, tz, 6)?,
        FrequencyCode::Yearly => month_step_next(schedule, now, tz, 12)?,
    };

    // Promote to the start date, then re-check the window.
    let candidate = if local_date(candidate, tz) < schedule.start_date {
        at_local(tz, schedule.start_date, schedule.hour_of_day, schedule.minute_of_hour)
    } else {
        candidate
    };

    if let Some(end) = schedule.end_date {
        if local_date(candidate, tz) > end {
            return None;
        }
    }
    Some(candidate)
}

/// The instant candidates must exceed: strictly after the last run, never
/// before "now" minus nothing: a candidate equal to `now` is due and
/// valid.
fn floor_instant(schedule: &Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    match schedule.last_run_at {
        Some(last) if last >= now => last,
        Some(last) => last.max(now - Duration::seconds(1)),
        None => now - Duration::seconds(1),
    }
}

fn interval_next(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let minutes: i64 = schedule.frequency_day.as_deref()?.parse().ok()?;
    let minutes = minutes.max(1);
    let next = match schedule.last_run_at {
        Some(last) => last + Duration::minutes(minutes),
        None => now,
    };
    Some(next.max(now))
}

/// Walk candidate dates with `step`, keeping those `accept` admits, until
/// the local (h, m) instant clears the floor.
fn stepped_next(
    schedule: &Schedule,
    now: DateTime<Utc>,
    tz: Tz,
    step: impl Fn(NaiveDate) -> Option<NaiveDate>,
    accept: impl Fn(NaiveDate) -> Option<NaiveDate>,
) -> Option<DateTime<Utc>> {
    let floor = floor_instant(schedule, now);
    let mut date = local_date(floor, tz).max(schedule.start_date);
    // Bounded walk: a week of days covers WK, one day covers DL.
    for _ in 0..9 {
        if let Some(d) = accept(date) {
            let candidate = at_local(tz, d, schedule.hour_of_day, schedule.minute_of_hour);
            if candidate > floor {
                return Some(candidate);
            }
        }
        date = step(date)?;
    }
    None
}

fn fortnight_next(schedule: &Schedule, now: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
    let floor = floor_instant(schedule, now);
    match schedule.last_run_at {
        Some(last) => {
            let mut date = local_date(last, tz) + Duration::days(14);
            let mut candidate =
                at_local(tz, date, schedule.hour_of_day, schedule.minute_of_hour);
            while candidate <= floor {
                date += Duration::days(14);
                candidate = at_local(tz, date, schedule.hour_of_day, schedule.minute_of_hour);
            }
            Some(candidate)
        }
        // First fire behaves like a daily anchor on/after the start date.
        None => stepped_next(schedule, now, tz, |d| d.succ_opt(), |d| Some(d)),
    }
}

fn month_step_next(
    schedule: &Schedule,
    now: DateTime<Utc>,
    tz: Tz,
    step_months: u32,
) -> Option<DateTime<Utc>> {
    let dom: u32 = schedule.frequency_day.as_deref()?.parse().ok()?;
    let floor = floor_instant(schedule, now);
    let anchor = local_date(floor, tz).max(schedule.start_date);

    let (mut year, mut month) = (anchor.year(), anchor.month());
    // At most a full cycle of extra steps past the first candidate.
    for _ in 0..=(12 / step_months.min(12) + 2) {
        let date = clamped_dom(year, month, dom);
        let candidate = at_local(tz, date, schedule.hour_of_day, schedule.minute_of_hour);
        if candidate > floor {
            return Some(candidate);
        }
        let total = (month - 1) + step_months;
        year += (total / 12) as i32;
        month = (total % 12) + 1;
    }
    None
}

/// Day-of-month clamped to the month's last day (31 -> Feb 28/29, etc.).
fn clamped_dom(year: i32, month: u32, dom: u32) -> NaiveDate {
    let last = last_day_of_month(year, month);
    NaiveDate::from_ymd_opt(year, month, dom.min(last)).expect("clamped day is valid")
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("first of month is valid")
        .pred_opt()
        .expect("previous day exists")
        .day()
}

fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// Resolve a local wall-clock time to UTC. Ambiguous times (fall-back) take
/// the earlier instant; nonexistent times (spring-forward gap) slide one
/// hour later.
fn at_local(tz: Tz, date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .expect("validated hour/minute");
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let shifted = naive + Duration::hours(1);
            tz.from_local_datetime(&shifted)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
        }
    }
}

/// A schedule is due when its computed fire time has arrived.
pub fn is_due(next: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(next, Some(t) if t <= now)
}

#[cfg(test)]
mod tests {
    use chrono_tz::UTC;
    use dwl_schemas::codes::StatusFlag;

    use super::*;

    fn schedule(code: FrequencyCode, day: Option<&str>) -> Schedule {
        Schedule {
            id: 1,
            job_flow_id: 1,
            mapping_reference: "M1".into(),
            frequency_code: code,
            frequency_day: day.map(str::to_string),
            hour_of_day: 9,
            minute_of_hour: 30,
            start_date: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
            end_date: None,
            status_flag: StatusFlag::Active,
            last_run_at: None,
            next_run_at: None,
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekly_from_wednesday_lands_next_monday() {
        // 2026-07-29 is a Wednesday.
        let s = schedule(FrequencyCode::Weekly, Some("MON"));
        let now = utc(2026, 7, 29, 10, 0);
        let next = next_run_at(&s, now, UTC).unwrap();
        assert_eq!(next, utc(2026, 8, 3, 9, 30));
        assert!(!is_due(Some(next), now));
    }

    #[test]
    fn daily_same_day_when_time_not_yet_passed() {
        let s = schedule(FrequencyCode::Daily, None);
        let now = utc(2026, 7, 29, 8, 0);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2026, 7, 29, 9, 30));
    }

    #[test]
    fn daily_rolls_to_tomorrow_after_time_passed() {
        let s = schedule(FrequencyCode::Daily, None);
        let now = utc(2026, 7, 29, 10, 0);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2026, 7, 30, 9, 30));
    }

    #[test]
    fn candidate_is_strictly_after_last_run() {
        let mut s = schedule(FrequencyCode::Daily, None);
        s.last_run_at = Some(utc(2026, 7, 29, 9, 30));
        let now = utc(2026, 7, 29, 9, 30);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2026, 7, 30, 9, 30));
    }

    #[test]
    fn promoted_to_start_date() {
        let mut s = schedule(FrequencyCode::Daily, None);
        s.start_date = NaiveDate::from_ymd_opt(2026, 9, 1).unwrap();
        let now = utc(2026, 7, 29, 8, 0);
        let next = next_run_at(&s, now, UTC).unwrap();
        assert_eq!(next, utc(2026, 9, 1, 9, 30));
        assert!(next >= now);
    }

    #[test]
    fn complete_past_end_date() {
        let mut s = schedule(FrequencyCode::Daily, None);
        s.end_date = NaiveDate::from_ymd_opt(2026, 7, 29);
        let now = utc(2026, 7, 29, 10, 0);
        assert_eq!(next_run_at(&s, now, UTC), None);
    }

    #[test]
    fn monthly_day_clamps_to_last_of_february() {
        let mut s = schedule(FrequencyCode::Monthly, Some("31"));
        s.start_date = NaiveDate::from_ymd_opt(2028, 1, 1).unwrap();
        s.last_run_at = Some(utc(2028, 1, 31, 9, 30));
        let now = utc(2028, 1, 31, 9, 31);
        // 2028 is a leap year.
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2028, 2, 29, 9, 30));
    }

    #[test]
    fn interval_runs_every_n_minutes_from_last_run() {
        let mut s = schedule(FrequencyCode::Interval, Some("15"));
        s.last_run_at = Some(utc(2026, 7, 29, 9, 0));
        let now = utc(2026, 7, 29, 9, 5);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2026, 7, 29, 9, 15));
        // Overdue intervals fire immediately, not in the past.
        let now = utc(2026, 7, 29, 9, 40);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), now);
    }

    #[test]
    fn fortnightly_steps_fourteen_days() {
        let mut s = schedule(FrequencyCode::Fortnightly, None);
        s.last_run_at = Some(utc(2026, 7, 1, 9, 30));
        let now = utc(2026, 7, 2, 0, 0);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2026, 7, 15, 9, 30));
    }

    #[test]
    fn half_yearly_and_yearly_step_months() {
        let mut s = schedule(FrequencyCode::HalfYearly, Some("15"));
        s.last_run_at = Some(utc(2026, 7, 15, 9, 30));
        let now = utc(2026, 7, 16, 0, 0);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2027, 1, 15, 9, 30));

        let mut s = schedule(FrequencyCode::Yearly, Some("1"));
        s.last_run_at = Some(utc(2026, 7, 1, 9, 30));
        let now = utc(2026, 7, 2, 0, 0);
        assert_eq!(next_run_at(&s, now, UTC).unwrap(), utc(2027, 7, 1, 9, 30));
    }

    #[test]
    fn na_never_fires() {
        let s = schedule(FrequencyCode::None, None);
        assert_eq!(next_run_at(&s, utc(2026, 7, 29, 10, 0), UTC), None);
    }

    #[test]
    fn time_of_day_respects_zone() {
        let s = schedule(FrequencyCode::Daily, None);
        let tz: Tz = "Australia/Sydney".parse().unwrap();
        // 09:30 in Sydney (AEST, +10) is 23:30 UTC the previous day.
        let now = utc(2026, 7, 28, 20, 0);
        assert_eq!(next_run_at(&s, now, tz).unwrap(), utc(2026, 7, 28, 23, 30));
    }

    #[test]
    fn invariant_window_bounds_hold() {
        // I5: next >= max(last_run, start) and next <= end when set.
        let mut s = schedule(FrequencyCode::Daily, None);
        s.last_run_at = Some(utc(2026, 7, 28, 9, 30));
        s.end_date = NaiveDate::from_ymd_opt(2026, 12, 31);
        let now = utc(2026, 7, 29, 8, 0);
        let next = next_run_at(&s, now, UTC).unwrap();
        assert!(next > s.last_run_at.unwrap());
        assert!(local_date(next, UTC) >= s.start_date);
        assert!(local_date(next, UTC) <= s.end_date.unwrap());
    }
}
