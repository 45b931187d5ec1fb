//! Cron schedules synthesised from a pipeline's duration.
//!
//! Only the minute and hour fields are ever restricted; day of month, month
//! and day of week are always `*`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, DurationRound, Timelike, Utc};

/// Search horizon for the next firing; every schedule built here fires daily.
const SEARCH_HORIZON_MINUTES: i64 = 2 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    /// `*`
    Any,
    /// `*/n`
    Step(u32),
    /// `n`
    At(u32),
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(step) => *step != 0 && value % step == 0,
            CronField::At(at) => value == *at,
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronField::Any => write!(f, "*"),
            CronField::Step(step) => write!(f, "*/{step}"),
            CronField::At(at) => write!(f, "{at}"),
        }
    }
}

impl FromStr for CronField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = s.strip_prefix("*/") {
            return match step.parse() {
                Ok(0) | Err(_) => Err(format!("invalid step {s:?}")),
                Ok(step) => Ok(CronField::Step(step)),
            };
        }
        s.parse().map(CronField::At).map_err(|_| format!("invalid cron field {s:?}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    pub minute: CronField,
    pub hour: CronField,
}

impl CronSpec {
    /// Schedule firing every `minutes` minutes.
    ///
    /// Up to 59 minutes this is `*/m * * * *`. Beyond, the hour field takes
    /// the whole hours and the minute field the remainder: 61 becomes
    /// `*/1 */1 * * *` and a whole number of hours fires on minute 0.
    /// Zero is treated as one minute.
    ///
    /// A non-zero remainder makes the schedule fire every `remainder` minutes
    /// throughout each matching hour, which is more often than `minutes`:
    /// 61 fires every minute and 90 every half hour. Only whole hours keep
    /// the configured period.
    pub fn from_duration_minutes(minutes: u32) -> Self {
        let minutes = minutes.max(1);
        if minutes <= 59 {
            return Self { minute: CronField::Step(minutes), hour: CronField::Any };
        }

        let hours = minutes / 60;
        let remainder = minutes % 60;
        let minute = if remainder == 0 { CronField::At(0) } else { CronField::Step(remainder) };
        Self { minute, hour: CronField::Step(hours) }
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minute.matches(at.minute()) && self.hour.matches(at.hour())
    }

    /// First firing strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.duration_trunc(Duration::minutes(1)).ok()? + Duration::minutes(1);
        for _ in 0..SEARCH_HORIZON_MINUTES {
            if self.matches(candidate) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} * * *", self.minute, self.hour)
    }
}

impl FromStr for CronSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let [minute, hour, "*", "*", "*"] = fields.as_slice() else {
            return Err(format!("unsupported cron spec {s:?}"));
        };
        Ok(Self { minute: minute.parse()?, hour: hour.parse()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(minutes: u32) -> String {
        CronSpec::from_duration_minutes(minutes).to_string()
    }

    #[test]
    fn test_boundary_durations() {
        assert_eq!(spec(1), "*/1 * * * *");
        assert_eq!(spec(59), "*/59 * * * *");
        assert_eq!(spec(60), "0 */1 * * *");
        assert_eq!(spec(61), "*/1 */1 * * *");
    }

    #[test]
    fn test_other_durations() {
        assert_eq!(spec(0), "*/1 * * * *");
        assert_eq!(spec(5), "*/5 * * * *");
        assert_eq!(spec(90), "*/30 */1 * * *");
        assert_eq!(spec(120), "0 */2 * * *");
        assert_eq!(spec(1440), "0 */24 * * *");
    }

    #[test]
    fn test_display_parses_back() {
        for minutes in [1, 7, 59, 60, 61, 125] {
            let original = CronSpec::from_duration_minutes(minutes);
            assert_eq!(original.to_string().parse::<CronSpec>().unwrap(), original);
        }
        assert!("*/0 * * * *".parse::<CronSpec>().is_err());
        assert!("* * 1 * *".parse::<CronSpec>().is_err());
    }

    #[test]
    fn test_next_firing() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap();

        let every_five = CronSpec::from_duration_minutes(5);
        assert_eq!(every_five.next_after(at(10, 3, 20)), Some(at(10, 5, 0)));
        assert_eq!(every_five.next_after(at(10, 5, 0)), Some(at(10, 10, 0)));
        assert_eq!(every_five.next_after(at(10, 58, 0)), Some(at(11, 0, 0)));

        let two_hours = CronSpec::from_duration_minutes(120);
        assert_eq!(two_hours.next_after(at(10, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(two_hours.next_after(at(23, 30, 0)), Some(at(0, 0, 0) + Duration::days(1)));
    }

    #[test]
    fn test_remainder_fires_within_every_matching_hour() {
        let at = |h, m| Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap();
        let firings_per_day = |spec: CronSpec| (0..24 * 60).filter(|m| spec.matches(at(m / 60, m % 60))).count();

        let sixty_one = CronSpec::from_duration_minutes(61);
        assert_eq!(sixty_one.next_after(at(10, 0)), Some(at(10, 1)));
        assert_eq!(firings_per_day(sixty_one), 1440);

        let ninety = CronSpec::from_duration_minutes(90);
        assert_eq!(ninety.next_after(at(10, 0)), Some(at(10, 30)));
        assert_eq!(ninety.next_after(at(10, 30)), Some(at(11, 0)));
        assert_eq!(firings_per_day(ninety), 48);

        let two_and_a_half = CronSpec::from_duration_minutes(150);
        assert_eq!(two_and_a_half.next_after(at(10, 30)), Some(at(12, 0)));
        assert_eq!(firings_per_day(two_and_a_half), 24);

        assert_eq!(firings_per_day(CronSpec::from_duration_minutes(120)), 12);
    }
}
