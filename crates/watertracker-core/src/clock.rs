//! Wall-clock port.
//!
//! Ad expiry and the daily limit both depend on "now". The controller reads
//! it through [`Clock`] so tests can move time explicitly.

use chrono::{DateTime, Local, NaiveDate, Utc};
use std::fmt::Debug;

/// Port for obtaining the current time.
pub trait Clock: Send + Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar date of `now()` in the device's local timezone.
    fn today(&self) -> NaiveDate {
        local_date(self.now())
    }
}

/// Local calendar date of an instant.
pub fn local_date(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn mock_clock_clones_share_time() {
        let start = Utc::now();
        let clock = MockClock::new(start);
        let other = clock.clone();

        other.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));

        clock.set(start);
        assert_eq!(other.now(), start);
    }

    #[test]
    fn today_uses_local_calendar() {
        let clock = SystemClock;
        assert_eq!(clock.today(), Local::now().date_naive());
    }
}
