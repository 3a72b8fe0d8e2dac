use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::{Map, Value};

use crate::errors::{ConveyorError, Result};

/// When a periodic entry fires: a fixed interval or a crontab expression.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Interval(Duration),
    Cron(Box<Schedule>),
}

impl ScheduleSpec {
    pub fn interval(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(ConveyorError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self::Interval(every))
    }

    pub fn cron(expr: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expr).map_err(|e| ConveyorError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::Cron(Box::new(schedule)))
    }

    /// First boundary strictly after `after`.
    pub fn next_boundary(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Interval(every) => {
                let step = chrono::Duration::from_std(*every).ok()?;
                after.checked_add_signed(step)
            }
            ScheduleSpec::Cron(schedule) => schedule.after(&after).next(),
        }
    }
}

/// Parse a human-entered duration: `"500ms"`, `"90s"`, `"5m"`, `"12h"`,
/// `"1d"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let parse = |digits: &str, unit_ms: u64| -> Result<Duration> {
        let n: u64 = digits
            .parse()
            .map_err(|_| ConveyorError::InvalidSchedule(format!("invalid duration: {s}")))?;
        Ok(Duration::from_millis(n * unit_ms))
    };
    if let Some(digits) = s.strip_suffix("ms") {
        parse(digits, 1)
    } else if let Some(digits) = s.strip_suffix('s') {
        parse(digits, 1_000)
    } else if let Some(digits) = s.strip_suffix('m') {
        parse(digits, 60_000)
    } else if let Some(digits) = s.strip_suffix('h') {
        parse(digits, 3_600_000)
    } else if let Some(digits) = s.strip_suffix('d') {
        parse(digits, 86_400_000)
    } else {
        parse(s, 1_000)
    }
}

/// One row of the periodic schedule table. Owned exclusively by the beat
/// scheduler; nothing else mutates `last_run_at`.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub name: String,
    pub task_name: String,
    pub schedule: ScheduleSpec,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Option<String>,
    /// The boundary most recently fired, or the anchor set when the
    /// scheduler adopted the entry. Never "now" at fire time.
    pub last_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn new(name: impl Into<String>, task_name: impl Into<String>, schedule: ScheduleSpec) -> Self {
        Self {
            name: name.into(),
            task_name: task_name.into(),
            schedule,
            args: Vec::new(),
            kwargs: Map::new(),
            queue: None,
            last_run_at: None,
            enabled: true,
        }
    }

    /// Anchor the entry so boundaries are counted from `now`, discarding
    /// any earlier position. A scheduler adopting an entry must not trust
    /// its own stale history.
    pub fn anchor(&mut self, now: DateTime<Utc>) {
        self.last_run_at = Some(now);
    }

    /// The boundary to fire at `now`, if one is due.
    ///
    /// Without catch-up, elapsed boundaries beyond the most recent one are
    /// skipped (missed boundaries during downtime are not backfilled). With
    /// catch-up, the earliest elapsed boundary is returned and successive
    /// calls drain the backlog one boundary at a time.
    pub fn next_due(&self, now: DateTime<Utc>, catch_up: bool) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        let anchor = self.last_run_at?;
        let mut boundary = self.schedule.next_boundary(anchor)?;
        if boundary > now {
            return None;
        }
        if !catch_up {
            while let Some(next) = self.schedule.next_boundary(boundary) {
                if next > now {
                    break;
                }
                boundary = next;
            }
        }
        Some(boundary)
    }

    /// Record a fired boundary. Advancing to the boundary itself (not to
    /// "now") is what makes a delayed tick unable to skip or double-fire.
    pub fn advance(&mut self, boundary: DateTime<Utc>) {
        self.last_run_at = Some(boundary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn interval_entry(every_secs: u64) -> ScheduleEntry {
        ScheduleEntry::new(
            "tick",
            "tasks.tick",
            ScheduleSpec::interval(Duration::from_secs(every_secs)).unwrap(),
        )
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(ScheduleSpec::interval(Duration::ZERO).is_err());
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = ScheduleSpec::cron("not a cron").unwrap_err();
        assert!(matches!(err, ConveyorError::InvalidCron { .. }));
    }

    #[test]
    fn unanchored_entry_is_never_due() {
        let entry = interval_entry(60);
        assert!(entry.next_due(at(1_000), false).is_none());
    }

    #[test]
    fn interval_boundaries_fire_once_each() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));

        // Not yet due just before the boundary.
        assert!(entry.next_due(at(59), false).is_none());

        // Exactly one fire per boundary across a 3-minute window.
        let mut fired = Vec::new();
        for secs in 0..=180 {
            if let Some(boundary) = entry.next_due(at(secs), false) {
                entry.advance(boundary);
                fired.push(boundary);
            }
        }
        assert_eq!(fired, vec![at(60), at(120), at(180)]);
    }

    #[test]
    fn delayed_tick_does_not_double_fire() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));

        // Tick arrives 5 seconds late; boundary fired is still t=60.
        let boundary = entry.next_due(at(65), false).unwrap();
        assert_eq!(boundary, at(60));
        entry.advance(boundary);

        // The same boundary never fires again, and the next one is on time.
        assert!(entry.next_due(at(70), false).is_none());
        assert_eq!(entry.next_due(at(120), false), Some(at(120)));
    }

    #[test]
    fn missed_boundaries_are_skipped_by_default() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));

        // Scheduler was down for 5 minutes; only the latest boundary fires.
        let boundary = entry.next_due(at(310), false).unwrap();
        assert_eq!(boundary, at(300));
        entry.advance(boundary);
        assert!(entry.next_due(at(310), false).is_none());
    }

    #[test]
    fn catch_up_drains_missed_boundaries_in_order() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));

        let mut fired = Vec::new();
        while let Some(boundary) = entry.next_due(at(310), true) {
            entry.advance(boundary);
            fired.push(boundary);
        }
        assert_eq!(fired, vec![at(60), at(120), at(180), at(240), at(300)]);
    }

    #[test]
    fn re_anchoring_discards_the_previous_position() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));
        entry.advance(at(60));

        // Re-anchored at t=125: the t=120 boundary is behind the new
        // anchor and never fires, the next one is t=185.
        entry.anchor(at(125));
        assert!(entry.next_due(at(130), false).is_none());
        assert_eq!(entry.next_due(at(185), false), Some(at(185)));
    }

    #[test]
    fn disabled_entry_never_fires() {
        let mut entry = interval_entry(60);
        entry.anchor(at(0));
        entry.enabled = false;
        assert!(entry.next_due(at(600), false).is_none());
    }

    #[test]
    fn cron_boundaries_follow_the_expression() {
        // Top of every hour, in cron's 7-field form.
        let spec = ScheduleSpec::cron("0 0 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let next = spec.next_boundary(start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap());
    }
}
