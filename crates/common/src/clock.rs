//! Injectable wall clock.
//!
//! Quota windows and cache TTLs are computed from a [`Clock`] so tests can
//! move time forward deterministically with [`MockClock`].

use std::ops::Add;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64 {
        epoch_ms(self.now())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug)]
pub struct MockClock {
    now: RwLock<SystemTime>,
}

impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl MockClock {
    pub fn with_time(time: SystemTime) -> Self {
        Self {
            now: RwLock::new(time),
        }
    }

    /// Start at a fixed number of milliseconds after the epoch.
    pub fn at_ms(ms: u64) -> Self {
        Self::with_time(UNIX_EPOCH + Duration::from_millis(ms))
    }

    pub fn new() -> Self {
        Self::with_time(SystemTime::now())
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.write().unwrap_or_else(|e| e.into_inner());
        *now = now.add(duration);
    }

    pub fn set_time(&self, time: SystemTime) {
        *self.now.write().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch; times before the epoch clamp to zero.
pub fn epoch_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Render a millisecond timestamp as a UTC calendar day, `YYYY-MM-DD`.
pub fn format_day(ms: u64) -> String {
    let days = (ms / 86_400_000) as i64;
    // Civil-from-days over 400-year eras.
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    format!("{:04}-{:02}-{:02}", year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_clock_advance() {
        let clock = MockClock::at_ms(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_ms(), 61_000);
    }

    #[test]
    fn test_mock_clock_set_time() {
        let clock = MockClock::at_ms(0);
        clock.set_time(UNIX_EPOCH + Duration::from_secs(3));
        assert_eq!(clock.now_ms(), 3_000);
    }

    #[test]
    fn test_format_day() {
        assert_eq!(format_day(0), "1970-01-01");
        // 2024-02-29T12:00:00Z
        assert_eq!(format_day(1_709_208_000_000), "2024-02-29");
        // 2000-03-01T00:00:00Z
        assert_eq!(format_day(951_868_800_000), "2000-03-01");
        // Last millisecond of 1999
        assert_eq!(format_day(946_684_799_999), "1999-12-31");
    }
}
