use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::{category::Category, session::SessionRecord};

pub const TOP_DOMAINS: usize = 5;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainStat {
    pub domain: String,
    pub time: i64,
    pub visits: usize,
    pub category: Category,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentSessionView {
    #[serde(flatten)]
    pub session: SessionRecord,
    pub elapsed_seconds: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TodaySummary {
    pub device_id: String,
    pub total_sessions: usize,
    /// Closed sessions only; the open session is reported separately.
    pub total_time_seconds: i64,
    pub top_domains: Vec<DomainStat>,
    pub current_session: Option<CurrentSessionView>,
}

/// UTC bounds of the calendar day in `tz` containing `now`. Each midnight is resolved
/// on its own, so the offset in force at `now` never shifts the other boundary.
pub fn local_day_bounds<Tz: TimeZone>(now: DateTime<Utc>, tz: &Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.with_timezone(tz).date_naive();
    let start = midnight_utc(today, tz).unwrap_or(now);
    let end = today
        .succ_opt()
        .and_then(|next| midnight_utc(next, tz))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

fn midnight_utc<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<DateTime<Utc>> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    // A DST jump can skip midnight itself; the day then starts at the first hour that exists.
    tz.from_local_datetime(&midnight)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|t| t.with_timezone(&Utc))
}

/// Folds the records whose start falls in `day` (UTC start inclusive, end exclusive).
pub fn todays_summary(
    device_id: &str,
    buffered: &[SessionRecord],
    current: Option<&SessionRecord>,
    now: DateTime<Utc>,
    day: (DateTime<Utc>, DateTime<Utc>),
) -> TodaySummary {
    let (day_start, day_end) = day;
    let today: Vec<&SessionRecord> = buffered
        .iter()
        .filter(|r| r.start_time >= day_start && r.start_time < day_end)
        .collect();

    let total_time_seconds = today.iter().map(|r| r.duration_seconds).sum();

    let mut by_domain: HashMap<&str, DomainStat> = HashMap::new();
    for r in &today {
        let stat = by_domain
            .entry(r.domain.as_str())
            .or_insert_with(|| DomainStat {
                domain: r.domain.clone(),
                time: 0,
                visits: 0,
                category: r.category,
            });
        stat.time += r.duration_seconds;
        stat.visits += 1;
    }

    let mut top_domains: Vec<DomainStat> = by_domain.into_values().collect();
    top_domains.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| a.domain.cmp(&b.domain)));
    top_domains.truncate(TOP_DOMAINS);

    TodaySummary {
        device_id: device_id.to_string(),
        total_sessions: today.len(),
        total_time_seconds,
        top_domains,
        current_session: current.map(|s| CurrentSessionView {
            session: s.clone(),
            elapsed_seconds: s.elapsed_seconds(now),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, LocalResult, NaiveDateTime};
    use pretty_assertions::assert_eq;

    /// Central European zone around the 2026-03-29 switch: +01:00 until 01:00 UTC,
    /// +02:00 after, local 02:00..03:00 does not exist.
    #[derive(Clone, Copy, Debug)]
    struct SpringForward;

    impl SpringForward {
        fn switch_utc() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2026, 3, 29).unwrap().and_hms_opt(1, 0, 0).unwrap()
        }

        fn winter() -> FixedOffset {
            FixedOffset::east_opt(3600).unwrap()
        }

        fn summer() -> FixedOffset {
            FixedOffset::east_opt(2 * 3600).unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let gap_start = Self::switch_utc() + Duration::hours(1);
            if *local < gap_start {
                LocalResult::Single(Self::winter())
            } else if *local < gap_start + Duration::hours(1) {
                LocalResult::None
            } else {
                LocalResult::Single(Self::summer())
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if *utc < Self::switch_utc() {
                Self::winter()
            } else {
                Self::summer()
            }
        }
    }

    fn closed(domain: &str, start: DateTime<Utc>, secs: i64, category: Category) -> SessionRecord {
        SessionRecord::open(
            "dev",
            domain.to_string(),
            format!("https://{domain}/"),
            category,
            1,
            start,
        )
        .close(start + Duration::seconds(secs))
    }

    #[test]
    fn day_bounds_follow_local_offset() {
        let now = Utc.with_ymd_and_hms(2026, 2, 15, 1, 30, 0).unwrap();
        let utc8 = FixedOffset::east_opt(8 * 3600).unwrap();
        let (start, end) = local_day_bounds(now, &utc8);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 14, 16, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 15, 16, 0, 0).unwrap());

        let utc_minus5 = FixedOffset::west_opt(5 * 3600).unwrap();
        let (start, _) = local_day_bounds(now, &utc_minus5);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 2, 14, 5, 0, 0).unwrap());
    }

    #[test]
    fn dst_change_day_is_23_hours() {
        // Afternoon of the switch day, when the summer offset is already in force.
        let now = Utc.with_ymd_and_hms(2026, 3, 29, 12, 0, 0).unwrap();
        let (start, end) = local_day_bounds(now, &SpringForward);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 28, 23, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 3, 29, 22, 0, 0).unwrap());

        // A session started at 23:30 UTC is 00:30 local on the switch day.
        let early = SessionRecord::open(
            "dev",
            "github.com".to_string(),
            "https://github.com/".to_string(),
            Category::Productive,
            1,
            Utc.with_ymd_and_hms(2026, 3, 28, 23, 30, 0).unwrap(),
        )
        .close(Utc.with_ymd_and_hms(2026, 3, 28, 23, 40, 0).unwrap());
        let summary = todays_summary("dev", &[early], None, now, (start, end));
        assert_eq!(summary.total_sessions, 1);
        assert_eq!(summary.total_time_seconds, 600);
    }

    #[test]
    fn summary_folds_today_by_domain() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let day = |h: u32, m: u32| Utc.with_ymd_and_hms(2026, 3, 2, h, m, 0).unwrap();
        let yesterday = Utc.with_ymd_and_hms(2026, 3, 1, 23, 0, 0).unwrap();

        let buffered = vec![
            closed("old.com", yesterday, 9999, Category::Neutral),
            closed("github.com", day(9, 0), 600, Category::Productive),
            closed("youtube.com", day(9, 10), 300, Category::Unproductive),
            closed("github.com", day(9, 15), 120, Category::Productive),
            closed("a.com", day(10, 0), 10, Category::Neutral),
            closed("b.com", day(10, 1), 10, Category::Neutral),
            closed("c.com", day(10, 2), 5, Category::Neutral),
            closed("d.com", day(10, 3), 1, Category::Neutral),
        ];
        let current = SessionRecord::open(
            "dev",
            "docs.rs".to_string(),
            "https://docs.rs/".to_string(),
            Category::Productive,
            3,
            day(11, 0),
        );

        let summary = todays_summary(
            "dev",
            &buffered,
            Some(&current),
            day(11, 5),
            local_day_bounds(day(11, 5), &utc),
        );
        assert_eq!(summary.total_sessions, 7);
        assert_eq!(summary.total_time_seconds, 600 + 300 + 120 + 10 + 10 + 5 + 1);

        let top: Vec<(&str, i64, usize)> = summary
            .top_domains
            .iter()
            .map(|d| (d.domain.as_str(), d.time, d.visits))
            .collect();
        assert_eq!(
            top,
            vec![
                ("github.com", 720, 2),
                ("youtube.com", 300, 1),
                ("a.com", 10, 1),
                ("b.com", 10, 1),
                ("c.com", 5, 1),
            ]
        );

        let live = summary.current_session.unwrap();
        assert_eq!(live.session.domain, "docs.rs");
        assert_eq!(live.elapsed_seconds, 300);
    }

    #[test]
    fn empty_buffer_gives_zero_summary() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        let s = todays_summary("dev", &[], None, now, local_day_bounds(now, &utc));
        assert_eq!(s.total_sessions, 0);
        assert_eq!(s.total_time_seconds, 0);
        assert!(s.top_domains.is_empty());
        assert!(s.current_session.is_none());
    }
}
