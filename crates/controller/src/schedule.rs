//! Daily watering targets and next-trigger calculation.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use time::{Duration, OffsetDateTime, Time};

use crate::error::ControllerError;

// ---------------------------------------------------------------------------
// Time-of-day target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay(Time);

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> Result<Self, ControllerError> {
        Time::from_hms(hour, minute, 0).map(Self).map_err(|_| {
            ControllerError::InvalidSchedule(format!("{hour:02}:{minute:02} is not a time of day"))
        })
    }

    pub fn as_time(self) -> Time {
        self.0
    }
}

/// Parses `"HH:MM"` (`"7:00"` is accepted too).
impl FromStr for TimeOfDay {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ControllerError::InvalidSchedule(format!("'{s}' is not HH:MM"));

        let (h, m) = s.trim().split_once(':').ok_or_else(invalid)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
            return Err(invalid());
        }
        let hour: u8 = h.parse().map_err(|_| invalid())?;
        let minute: u8 = m.parse().map_err(|_| invalid())?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0.hour(), self.0.minute())
    }
}

// ---------------------------------------------------------------------------
// Daily schedule
// ---------------------------------------------------------------------------

/// Non-empty set of daily targets, kept in the order given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySchedule(Vec<TimeOfDay>);

impl DailySchedule {
    pub fn new(targets: Vec<TimeOfDay>) -> Result<Self, ControllerError> {
        if targets.is_empty() {
            return Err(ControllerError::InvalidSchedule(
                "at least one daily target is required".to_string(),
            ));
        }
        Ok(Self(targets))
    }

    pub fn parse<S: AsRef<str>>(targets: &[S]) -> Result<Self, ControllerError> {
        let parsed = targets
            .iter()
            .map(|t| t.as_ref().parse())
            .collect::<Result<Vec<TimeOfDay>, _>>()?;
        Self::new(parsed)
    }

    /// Interpret the schedule node of the store. `null` means "not set" and
    /// yields `Ok(None)`; anything else must be an array of `"HH:MM"` strings.
    pub fn from_store(value: &Value) -> Result<Option<Self>, ControllerError> {
        match value {
            Value::Null => Ok(None),
            Value::Array(items) => {
                let strings = items
                    .iter()
                    .map(|v| {
                        v.as_str().ok_or_else(|| {
                            ControllerError::InvalidSchedule(format!("{v} is not a string"))
                        })
                    })
                    .collect::<Result<Vec<&str>, _>>()?;
                Self::parse(&strings).map(Some)
            }
            other => Err(ControllerError::InvalidSchedule(format!(
                "expected a list of HH:MM strings, got {other}"
            ))),
        }
    }

    pub fn targets(&self) -> &[TimeOfDay] {
        &self.0
    }

    fn earliest(&self) -> TimeOfDay {
        // Non-empty by construction.
        self.0.iter().copied().min().unwrap_or(TimeOfDay(Time::MIDNIGHT))
    }
}

impl Default for DailySchedule {
    /// 07:00, 12:00 and 17:00.
    fn default() -> Self {
        Self(
            [7, 12, 17]
                .into_iter()
                .map(|h| TimeOfDay(Time::from_hms(h, 0, 0).unwrap_or(Time::MIDNIGHT)))
                .collect(),
        )
    }
}

impl fmt::Display for DailySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Earliest instant strictly after `now` that falls on one of the daily
/// targets. Targets are applied in `now`'s UTC offset.
pub fn next_trigger(now: OffsetDateTime, schedule: &DailySchedule) -> OffsetDateTime {
    let later_today = schedule
        .targets()
        .iter()
        .map(|t| now.replace_time(t.as_time()))
        .filter(|at| *at > now)
        .min();

    match later_today {
        Some(at) => at,
        None => now
            .replace_time(schedule.earliest().as_time())
            .saturating_add(Duration::DAY),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
