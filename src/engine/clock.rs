//! # engine::clock
//!
//! Market-local wall clock, injected into the reactors so tests can move time.

use chrono::{FixedOffset, NaiveDateTime, Utc};

pub trait Clock: Send + Sync {
    /// Current exchange-local date and time.
    fn now(&self) -> NaiveDateTime;
}

/// Real clock at a fixed UTC offset (IST = +05:30).
#[derive(Debug, Clone, Copy)]
pub struct MarketClock {
    offset: FixedOffset,
}

impl MarketClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }
}

impl Clock for MarketClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use chrono::{NaiveDate, NaiveDateTime};

    use super::*;

    /// Test clock that only moves when told to.
    pub(crate) struct ManualClock(Mutex<NaiveDateTime>);

    impl ManualClock {
        pub(crate) fn at(date: (i32, u32, u32), time: (u32, u32, u32)) -> Self {
            Self(Mutex::new(datetime(date, time)))
        }

        pub(crate) fn set(&self, date: (i32, u32, u32), time: (u32, u32, u32)) {
            *self.0.lock().unwrap() = datetime(date, time);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> NaiveDateTime {
            *self.0.lock().unwrap()
        }
    }

    fn datetime((y, m, d): (i32, u32, u32), (hh, mm, ss): (u32, u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|date| date.and_hms_opt(hh, mm, ss))
            .unwrap()
    }

    #[test]
    fn market_clock_applies_offset() {
        let ist = MarketClock::new(FixedOffset::east_opt(330 * 60).unwrap());
        let utc = MarketClock::new(FixedOffset::east_opt(0).unwrap());
        let drift = ist.now() - utc.now();
        assert!((drift.num_minutes() - 330).abs() <= 1);
    }
}
