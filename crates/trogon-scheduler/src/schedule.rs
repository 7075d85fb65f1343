use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::config::Schedule;
use crate::error::{Result, SchedulerError};

/// A schedule whose expression has already been checked.
///
/// Parsing happens when a job is defined, so malformed expressions never
/// reach the trigger loop.
#[derive(Debug, Clone)]
pub enum ParsedSchedule {
    Interval(chrono::Duration),
    Cron(Box<cron::Schedule>),
}

impl ParsedSchedule {
    pub fn parse(schedule: &Schedule) -> Result<Self> {
        match schedule {
            Schedule::Interval { interval_sec } => {
                if *interval_sec == 0 {
                    return Err(SchedulerError::validation("interval_sec must be >= 1"));
                }
                let secs = i64::try_from(*interval_sec)
                    .map_err(|_| SchedulerError::validation("interval_sec is too large"))?;
                chrono::Duration::try_seconds(secs)
                    .map(Self::Interval)
                    .ok_or_else(|| SchedulerError::validation("interval_sec is too large"))
            }
            Schedule::Cron { expr } => parse_cron(expr).map(|s| Self::Cron(Box::new(s))),
        }
    }

    /// Earliest fire instant strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => from.checked_add_signed(*every),
            Self::Cron(schedule) => schedule.after(&from).find(|t| *t > from),
        }
    }

    /// Where the next cycle starts once the cycle opened at `cycle_fire` is closed.
    ///
    /// Missed instants collapse: if the first instant after `cycle_fire` is
    /// already in the past, the job resumes at the first instant after `now`
    /// instead of replaying the backlog.
    pub fn advance(
        &self,
        cycle_fire: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.next_after(cycle_fire) {
            Some(next) if next > now => Some(next),
            Some(_) => self.next_after(now),
            None => None,
        }
    }
}

fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    let normalized = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        n => {
            return Err(SchedulerError::InvalidCronExpression {
                expr: expr.to_string(),
                reason: format!("expected 5, 6 or 7 fields, got {n}"),
            })
        }
    };
    let schedule =
        cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCronExpression {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
    if schedule.upcoming(Utc).next().is_none() {
        return Err(SchedulerError::InvalidCronExpression {
            expr: expr.to_string(),
            reason: "expression never fires".into(),
        });
    }
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Timelike};
    use proptest::prelude::*;

    use super::*;

    fn cron(expr: &str) -> ParsedSchedule {
        ParsedSchedule::parse(&Schedule::Cron { expr: expr.into() }).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn every_five_seconds() {
        let s = cron("*/5 * * * * *");
        assert_eq!(s.next_after(at(10, 0, 1)), Some(at(10, 0, 5)));
    }

    #[test]
    fn next_after_is_strict() {
        let s = cron("*/5 * * * * *");
        assert_eq!(s.next_after(at(10, 0, 5)), Some(at(10, 0, 10)));
    }

    #[test]
    fn next_after_ignores_subsecond_offset() {
        let s = cron("*/5 * * * * *");
        let from = at(10, 0, 5) + Duration::milliseconds(300);
        assert_eq!(s.next_after(from), Some(at(10, 0, 10)));
    }

    #[test]
    fn five_field_expression_fires_on_second_zero() {
        let s = cron("30 8 * * *");
        let next = s.next_after(at(0, 0, 0)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (8, 30, 0));
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let err = ParsedSchedule::parse(&Schedule::Cron {
            expr: "* * *".into(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("expected 5, 6 or 7 fields"));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ParsedSchedule::parse(&Schedule::Cron {
            expr: "a b c d e f".into()
        })
        .is_err());
    }

    #[test]
    fn interval_zero_is_rejected() {
        assert!(ParsedSchedule::parse(&Schedule::Interval { interval_sec: 0 }).is_err());
    }

    #[test]
    fn interval_adds_period() {
        let s = ParsedSchedule::parse(&Schedule::Interval { interval_sec: 30 }).unwrap();
        assert_eq!(s.next_after(at(10, 0, 0)), Some(at(10, 0, 30)));
    }

    #[test]
    fn advance_uses_original_cycle_instant() {
        let s = cron("0 0 * * * *");
        // Cycle opened at 10:00, retries ran until 10:00:07; next is still 11:00.
        assert_eq!(s.advance(at(10, 0, 0), at(10, 0, 7)), Some(at(11, 0, 0)));
    }

    #[test]
    fn advance_collapses_backlog_to_single_future_fire() {
        let s = cron("0 * * * * *");
        // Cycle opened at 10:00:00 but the process was down until 10:05:30.
        assert_eq!(s.advance(at(10, 0, 0), at(10, 5, 30)), Some(at(10, 6, 0)));
    }

    proptest! {
        #[test]
        fn next_fire_strictly_increases(
            secs in 0i64..4_000_000_000,
            expr in prop::sample::select(vec![
                "*/5 * * * * *",
                "0 */15 * * * *",
                "0 0 8 * * *",
                "0 30 9 * * Mon-Fri",
                "15 10 * * *",
                "0 0 0 1 * *",
            ]),
        ) {
            let s = cron(expr);
            let t = Utc.timestamp_opt(secs, 0).unwrap();
            let first = s.next_after(t).unwrap();
            let second = s.next_after(first).unwrap();
            prop_assert!(first > t);
            prop_assert!(second > first);
        }

        #[test]
        fn interval_next_fire_strictly_increases(
            secs in 0i64..4_000_000_000,
            every in 1u64..100_000,
        ) {
            let s = ParsedSchedule::parse(&Schedule::Interval { interval_sec: every }).unwrap();
            let t = Utc.timestamp_opt(secs, 0).unwrap();
            let first = s.next_after(t).unwrap();
            prop_assert!(s.next_after(first).unwrap() > first);
        }
    }
}
