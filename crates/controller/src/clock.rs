//! Wall-clock source. Everything the scheduler computes is expressed in the
//! site's fixed UTC offset, so "07:00" means 07:00 on the farm.

use time::{OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

/// Clock pinned to a start instant that moves with tokio's (pausable) timer
/// clock, so tests can advance wall time and timers together.
#[cfg(test)]
pub(crate) struct TestClock {
    start: OffsetDateTime,
    anchor: tokio::time::Instant,
}

#[cfg(test)]
impl TestClock {
    pub(crate) fn at(start: OffsetDateTime) -> Self {
        Self {
            start,
            anchor: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for TestClock {
    fn now(&self) -> OffsetDateTime {
        self.start + self.anchor.elapsed()
    }
}
