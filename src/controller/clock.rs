//! Clock abstraction for testable time-dependent logic
//!
//! Production code uses `SystemClock` which delegates to `chrono::Utc::now()`.
//! Tests use `MockClock` to control time deterministically.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Trait for getting the current time
///
/// Injected via `Context` so interval gating can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to `chrono::Utc::now()`
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Time left until `last + interval`, or None when already elapsed
///
/// A missing or unparseable timestamp counts as elapsed.
pub fn remaining_wait(last: Option<&str>, interval: Duration, now: DateTime<Utc>) -> Option<Duration> {
    let last = DateTime::parse_from_rfc3339(last?).ok()?.with_timezone(&Utc);
    let interval = chrono::Duration::from_std(interval).ok()?;
    let due = last + interval;
    if now < due {
        (due - now).to_std().ok()
    } else {
        None
    }
}

/// Seconds elapsed since an RFC3339 timestamp, 0 when unparseable or in the future
pub fn seconds_since(timestamp: Option<&str>, now: DateTime<Utc>) -> u64 {
    timestamp
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| (now - t.with_timezone(&Utc)).num_seconds().max(0) as u64)
        .unwrap_or(0)
}

/// Mock clock for testing with controllable time
#[cfg(test)]
#[allow(clippy::expect_used)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    #[allow(dead_code)]
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("MockClock lock poisoned") = now;
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut now = self.now.lock().expect("MockClock lock poisoned");
        *now += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
