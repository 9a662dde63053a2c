// =============================================================================
// Session rules — CME futures calendar (America/New_York)
// =============================================================================
//
// Weekly window: Sunday 18:00 ET -> Friday 17:00 ET.
// Daily maintenance: 17:00-18:00 ET Monday-Thursday (no new entries, no
// liquidation; positions ride through).
// Holidays: FULL_DAY_CLOSURE (closed all day, no evening session),
// PARTIAL (day closed, evening opens 18:00 ET), EARLY_CLOSE (session ends
// 13:00 ET).  The evening before a full-day closure does not open.
//
// All boundaries are evaluated in Eastern time so DST shifts fall out of
// the tz database instead of hand-rolled offsets.
// =============================================================================

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::Serialize;

use crate::runtime_config::{HolidayKind, HolidayRule};
use crate::types::SessionState;

/// Calendar days scanned ahead for full-day closures when computing the
/// flatten boundary. Covers three-day weekends with a day to spare.
const CLOSURE_LOOKAHEAD_DAYS: i64 = 4;

/// Session verdict for one instant.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Minutes until the next hard session close (weekly close, early
    /// close, or the last trade before a full-day closure). `None` when
    /// the market is not open.
    pub minutes_until_close: Option<i64>,
}

fn holiday_on(holidays: &[HolidayRule], date: chrono::NaiveDate) -> Option<HolidayKind> {
    holidays.iter().find(|h| h.date == date).map(|h| h.kind)
}

/// Evaluate the session state at `now`.
pub fn evaluate_session(now: DateTime<Utc>, holidays: &[HolidayRule]) -> SessionSnapshot {
    let et = now.with_timezone(&New_York);
    let state = session_state(&et, holidays);
    let minutes_until_close = if state == SessionState::Active {
        minutes_until_session_close(&et, holidays)
    } else {
        None
    };
    SessionSnapshot {
        state,
        minutes_until_close,
    }
}

fn session_state(et: &DateTime<chrono_tz::Tz>, holidays: &[HolidayRule]) -> SessionState {
    let date = et.date_naive();
    let weekday = et.weekday();
    let hour = et.hour();
    let today = holiday_on(holidays, date);

    // Evening block, 18:00-24:00.
    if hour >= 18 {
        if weekday == Weekday::Fri || weekday == Weekday::Sat {
            return SessionState::Closed;
        }
        if today == Some(HolidayKind::FullDayClosure) {
            return SessionState::Closed;
        }
        // The evening before a full-day closure stays dark.
        if holiday_on(holidays, date + Duration::days(1)) == Some(HolidayKind::FullDayClosure) {
            return SessionState::Closed;
        }
        return SessionState::Active;
    }

    // Maintenance block, 17:00-18:00.
    if hour == 17 {
        return match weekday {
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu => {
                if today == Some(HolidayKind::FullDayClosure) {
                    SessionState::Closed
                } else {
                    SessionState::Maintenance
                }
            }
            // Friday 17:00 is the weekly close, not maintenance.
            _ => SessionState::Closed,
        };
    }

    // Day block, 00:00-17:00 (overnight continuation plus the day session).
    match weekday {
        Weekday::Sat | Weekday::Sun => SessionState::Closed,
        _ => match today {
            Some(HolidayKind::FullDayClosure) | Some(HolidayKind::Partial) => SessionState::Closed,
            Some(HolidayKind::EarlyClose) if hour >= 13 => SessionState::Closed,
            _ => SessionState::Active,
        },
    }
}

fn at(date: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<chrono_tz::Tz>> {
    New_York
        .from_local_datetime(&date.and_time(time))
        .earliest()
}

fn minutes_until_session_close(
    et: &DateTime<chrono_tz::Tz>,
    holidays: &[HolidayRule],
) -> Option<i64> {
    let date = et.date_naive();
    let five_pm = NaiveTime::from_hms_opt(17, 0, 0).expect("valid time");
    let one_pm = NaiveTime::from_hms_opt(13, 0, 0).expect("valid time");

    let mut candidates: Vec<DateTime<chrono_tz::Tz>> = Vec::new();

    // Early close today.
    if holiday_on(holidays, date) == Some(HolidayKind::EarlyClose) {
        if let Some(boundary) = at(date, one_pm) {
            candidates.push(boundary);
        }
    }

    // Next Friday 17:00 within the horizon.
    for d in 0..=CLOSURE_LOOKAHEAD_DAYS {
        let day = date + Duration::days(d);
        if day.weekday() == Weekday::Fri {
            if let Some(boundary) = at(day, five_pm) {
                candidates.push(boundary);
            }
            break;
        }
    }

    // Last trade before any upcoming full-day closure: 17:00 on the prior
    // day (its evening never opens).
    for d in 1..=CLOSURE_LOOKAHEAD_DAYS {
        let day = date + Duration::days(d);
        if holiday_on(holidays, day) == Some(HolidayKind::FullDayClosure) {
            if let Some(boundary) = at(day - Duration::days(1), five_pm) {
                candidates.push(boundary);
            }
            break;
        }
    }

    candidates
        .into_iter()
        .filter(|b| *b > *et)
        .min()
        .map(|boundary| (boundary - *et).num_minutes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// 2025-03-03 is a Monday (EST, UTC-5).
    fn et(y: i32, m: u32, d: u32, hour: u32, min: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, hour, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn holiday(y: i32, m: u32, d: u32, kind: HolidayKind) -> HolidayRule {
        HolidayRule {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            kind,
        }
    }

    #[test]
    fn weekday_day_session_is_active() {
        let snap = evaluate_session(et(2025, 3, 3, 10, 30), &[]);
        assert_eq!(snap.state, SessionState::Active);
        // Next hard close is Friday 17:00 — four days plus change away.
        assert!(snap.minutes_until_close.unwrap() > 4 * 24 * 60);
    }

    #[test]
    fn maintenance_window_monday_through_thursday() {
        // Exactly at 17:00 Monday: maintenance begins.
        let snap = evaluate_session(et(2025, 3, 3, 17, 0), &[]);
        assert_eq!(snap.state, SessionState::Maintenance);

        let snap = evaluate_session(et(2025, 3, 6, 17, 59), &[]);
        assert_eq!(snap.state, SessionState::Maintenance);

        // 18:00 reopens the evening session.
        let snap = evaluate_session(et(2025, 3, 3, 18, 0), &[]);
        assert_eq!(snap.state, SessionState::Active);
    }

    #[test]
    fn friday_close_and_sunday_reopen() {
        // Exactly at Friday 17:00: closed, not maintenance.
        let snap = evaluate_session(et(2025, 3, 7, 17, 0), &[]);
        assert_eq!(snap.state, SessionState::Closed);

        let snap = evaluate_session(et(2025, 3, 7, 20, 0), &[]);
        assert_eq!(snap.state, SessionState::Closed);

        let snap = evaluate_session(et(2025, 3, 8, 12, 0), &[]);
        assert_eq!(snap.state, SessionState::Closed);

        // Sunday 17:59 still closed; 18:00 opens.
        let snap = evaluate_session(et(2025, 3, 9, 17, 59), &[]);
        assert_eq!(snap.state, SessionState::Closed);
        let snap = evaluate_session(et(2025, 3, 9, 18, 0), &[]);
        assert_eq!(snap.state, SessionState::Active);
    }

    #[test]
    fn friday_afternoon_counts_down_to_close() {
        let snap = evaluate_session(et(2025, 3, 7, 16, 55), &[]);
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.minutes_until_close, Some(5));
    }

    #[test]
    fn full_day_closure_darkens_day_and_prior_evening() {
        // 2025-07-04 is a Friday.
        let holidays = vec![holiday(2025, 7, 4, HolidayKind::FullDayClosure)];

        // The holiday itself.
        let snap = evaluate_session(et(2025, 7, 4, 11, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        // Thursday evening before it never opens.
        let snap = evaluate_session(et(2025, 7, 3, 19, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        // Thursday afternoon is open and counts down to 17:00.
        let snap = evaluate_session(et(2025, 7, 3, 16, 50), &holidays);
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.minutes_until_close, Some(10));
    }

    #[test]
    fn partial_holiday_opens_evening_only() {
        // 2025-12-25 Thursday full closure; 12-26 partial pattern check on
        // a Wednesday partial instead.
        let holidays = vec![holiday(2025, 3, 5, HolidayKind::Partial)];

        let snap = evaluate_session(et(2025, 3, 5, 11, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        let snap = evaluate_session(et(2025, 3, 5, 18, 30), &holidays);
        assert_eq!(snap.state, SessionState::Active);
    }

    #[test]
    fn early_close_ends_at_one_pm() {
        let holidays = vec![holiday(2025, 3, 4, HolidayKind::EarlyClose)];

        let snap = evaluate_session(et(2025, 3, 4, 12, 45), &holidays);
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.minutes_until_close, Some(15));

        let snap = evaluate_session(et(2025, 3, 4, 13, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        // Evening reopens normally (Tuesday).
        let snap = evaluate_session(et(2025, 3, 4, 18, 15), &holidays);
        assert_eq!(snap.state, SessionState::Active);
    }

    #[test]
    fn three_day_closure_flattens_before_first_dark_day() {
        // Closure Tuesday through Thursday (2025-03-11..13).
        let holidays = vec![
            holiday(2025, 3, 11, HolidayKind::FullDayClosure),
            holiday(2025, 3, 12, HolidayKind::FullDayClosure),
            holiday(2025, 3, 13, HolidayKind::FullDayClosure),
        ];

        // Monday 16:30: close boundary is Monday 17:00, not Friday.
        let snap = evaluate_session(et(2025, 3, 10, 16, 30), &holidays);
        assert_eq!(snap.state, SessionState::Active);
        assert_eq!(snap.minutes_until_close, Some(30));

        // Monday evening never opens.
        let snap = evaluate_session(et(2025, 3, 10, 19, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        // All three closure days are dark.
        for day in 11..=13 {
            let snap = evaluate_session(et(2025, 3, day, 11, 0), &holidays);
            assert_eq!(snap.state, SessionState::Closed, "day {day}");
        }

        // The final closure day has no evening session either.
        let snap = evaluate_session(et(2025, 3, 13, 19, 0), &holidays);
        assert_eq!(snap.state, SessionState::Closed);

        // Friday morning resumes.
        let snap = evaluate_session(et(2025, 3, 14, 10, 0), &holidays);
        assert_eq!(snap.state, SessionState::Active);
    }

    #[test]
    fn saturday_always_closed() {
        let snap = evaluate_session(et(2025, 3, 8, 19, 0), &[]);
        assert_eq!(snap.state, SessionState::Closed);
    }
}
