//! Daily show/click limits shared by every placement.
//!
//! The counters belong to one calendar day. The first access on a new day
//! starts a fresh record, so a stale record never leaks counts forward.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::AdConfig;
use crate::clock::local_date;

/// Storage key of the persisted counters.
pub const LIMIT_KEY: &str = "adLimited";

/// Which counter an ad event feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitEvent {
    Show,
    Click,
}

/// Counters for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitState {
    pub show_count: u32,
    pub click_count: u32,
    pub date: DateTime<Utc>,
}

impl RateLimitState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            show_count: 0,
            click_count: 0,
            date: now,
        }
    }

    pub fn is_today(&self, today: NaiveDate) -> bool {
        local_date(self.date) == today
    }

    /// Reset the counters if the record belongs to an earlier day.
    ///
    /// Returns `true` when a reset happened.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_today(local_date(now)) {
            return false;
        }
        *self = Self::fresh(now);
        true
    }

    pub fn is_limited(&self, today: NaiveDate, config: &AdConfig) -> bool {
        self.is_today(today)
            && (self.show_count >= config.show_limit() || self.click_count >= config.click_limit())
    }

    pub fn record(&mut self, event: LimitEvent) {
        match event {
            LimitEvent::Show => self.show_count = self.show_count.saturating_add(1),
            LimitEvent::Click => self.click_count = self.click_count.saturating_add(1),
        }
    }
}

/// Snapshot of the limit for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitStatus {
    pub show_count: u32,
    pub show_limit: u32,
    pub click_count: u32,
    pub click_limit: u32,
    pub date: NaiveDate,
    pub limited: bool,
}

impl LimitStatus {
    pub fn new(state: &RateLimitState, config: &AdConfig, today: NaiveDate) -> Self {
        Self {
            show_count: state.show_count,
            show_limit: config.show_limit(),
            click_count: state.click_count,
            click_limit: config.click_limit(),
            date: local_date(state.date),
            limited: state.is_limited(today, config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limits(show: u32, click: u32) -> AdConfig {
        AdConfig {
            show_limit: Some(show),
            click_limit: Some(click),
            ..AdConfig::default()
        }
    }

    #[test]
    fn yesterday_resets_on_first_access() {
        let now = Utc::now();
        let mut state = RateLimitState {
            show_count: 7,
            click_count: 2,
            date: now - Duration::days(1),
        };

        assert!(state.roll_over(now));
        assert_eq!(state.show_count, 0);
        assert_eq!(state.click_count, 0);
        assert!(!state.roll_over(now));
    }

    #[test]
    fn limited_once_show_limit_reached() {
        let now = Utc::now();
        let today = local_date(now);
        let config = limits(3, 10);
        let mut state = RateLimitState::fresh(now);

        for _ in 0..2 {
            state.record(LimitEvent::Show);
            assert!(!state.is_limited(today, &config));
        }
        state.record(LimitEvent::Show);
        assert!(state.is_limited(today, &config));
    }

    #[test]
    fn limited_once_click_limit_reached() {
        let now = Utc::now();
        let config = limits(10, 1);
        let mut state = RateLimitState::fresh(now);
        state.record(LimitEvent::Click);
        assert!(state.is_limited(local_date(now), &config));
    }

    #[test]
    fn stale_record_is_never_limited() {
        let now = Utc::now();
        let state = RateLimitState {
            show_count: 100,
            click_count: 100,
            date: now - Duration::days(2),
        };
        assert!(!state.is_limited(local_date(now), &limits(1, 1)));
    }

    #[test]
    fn missing_limits_mean_limited() {
        let now = Utc::now();
        let state = RateLimitState::fresh(now);
        assert!(state.is_limited(local_date(now), &AdConfig::default()));
    }

    #[test]
    fn serializes_camel_case() {
        let state = RateLimitState::fresh(Utc::now());
        let json = serde_json::to_value(&state).unwrap();
        assert!(json.get("showCount").is_some());
        assert!(json.get("clickCount").is_some());
        assert!(json.get("date").is_some());
    }
}
