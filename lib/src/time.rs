use std::{fmt, ops};

use serde::{Deserialize, Serialize};
use time::Duration;

/// Length of a Kerbin solar day, in seconds.
pub const KERBIN_DAY: i64 = 6 * 60 * 60;
/// Length of a Kerbin year, in Kerbin days.
pub const KERBIN_YEAR_DAYS: i64 = 426;

/// Absolute universal time, as reported by the host simulation.
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct UT(Duration);

impl UT {
    pub fn new_seconds(sec: f64) -> UT {
        UT::from_duration(Duration::seconds_f64(sec))
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn into_duration(self) -> Duration {
        self.0
    }

    pub fn as_seconds_f64(self) -> f64 {
        self.0.as_seconds_f64()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_negative()
    }

    /// Whole Kerbin years since the epoch, starting at year 1.
    pub fn year(self) -> i64 {
        self.0.whole_seconds().div_euclid(KERBIN_DAY * KERBIN_YEAR_DAYS) + 1
    }

    /// Day of the Kerbin year, starting at day 1.
    pub fn day(self) -> i64 {
        self.0
            .whole_seconds()
            .rem_euclid(KERBIN_DAY * KERBIN_YEAR_DAYS)
            .div_euclid(KERBIN_DAY)
            + 1
    }

    pub fn hours(self) -> u8 {
        (self.0.whole_seconds().rem_euclid(KERBIN_DAY) / 3600) as u8
    }

    pub fn minutes(self) -> u8 {
        (self.0.whole_seconds().rem_euclid(3600) / 60) as u8
    }

    pub fn seconds(self) -> u8 {
        self.0.whole_seconds().rem_euclid(60) as u8
    }
}

impl ops::Sub<UT> for UT {
    type Output = Duration;

    fn sub(self, rhs: UT) -> Self::Output {
        self.0 - rhs.0
    }
}

impl ops::Sub<Duration> for UT {
    type Output = UT;

    fn sub(self, rhs: Duration) -> Self::Output {
        UT(self.0 - rhs)
    }
}

impl ops::Add<Duration> for UT {
    type Output = UT;

    fn add(self, rhs: Duration) -> Self::Output {
        UT(self.0 + rhs)
    }
}

impl ops::AddAssign<Duration> for UT {
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

/// `{}` prints raw seconds, `{:#}` prints a Kerbin calendar date.
impl fmt::Display for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            write!(
                f,
                "Y{}, D{}, {}:{:02}:{:02}",
                self.year(),
                self.day(),
                self.hours(),
                self.minutes(),
                self.seconds()
            )
        } else {
            write!(f, "UT({}s)", self.0.as_seconds_f64())
        }
    }
}

impl fmt::Debug for UT {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Format a duration as `Nd HH:MM:SS` using Kerbin days.
pub fn format_duration(duration: Duration) -> String {
    let sign = if duration.is_negative() { "-" } else { "" };
    let secs = duration.whole_seconds().unsigned_abs() as i64;
    let days = secs / KERBIN_DAY;
    let rem = secs % KERBIN_DAY;
    if days > 0 {
        format!(
            "{sign}{days}d {:02}:{:02}:{:02}",
            rem / 3600,
            (rem % 3600) / 60,
            rem % 60
        )
    } else {
        format!("{sign}{:02}:{:02}:{:02}", rem / 3600, (rem % 3600) / 60, rem % 60)
    }
}
