// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::time::{Duration, Instant};

/// Minimum time between two progress reports.
pub const PUBLISH_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Rate limiter for percentage-based progress reporting. A value is only let
/// through if it is larger than the last reported value and the interval has
/// elapsed since the last report. The implicit initial report is 0% at the
/// time of construction.
#[derive(Clone, Debug)]
pub struct ProgressThrottle {
    last_percent: u8,
    last_publish: Instant,
    interval: Duration,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_percent: 0,
            last_publish: Instant::now(),
            interval,
        }
    }

    /// Returns whether `percent` should be reported. If so, it becomes the new
    /// baseline for later calls.
    pub fn update(&mut self, percent: u8) -> bool {
        self.update_at(percent, Instant::now())
    }

    fn update_at(&mut self, percent: u8, now: Instant) -> bool {
        if percent > self.last_percent && now.duration_since(self.last_publish) >= self.interval {
            self.last_percent = percent;
            self.last_publish = now;
            true
        } else {
            false
        }
    }

    pub fn last_percent(&self) -> u8 {
        self.last_percent
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PUBLISH_PROGRESS_INTERVAL)
    }
}

/// Compute `done / total` as a whole percentage, rounded down. An empty total
/// is considered complete.
pub fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }

    (u128::from(done.min(total)) * 100 / u128::from(total)) as u8
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn throttle_requires_increase_and_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle {
            last_percent: 0,
            last_publish: start,
            interval: Duration::from_millis(500),
        };

        // Too soon.
        assert!(!throttle.update_at(10, start + Duration::from_millis(100)));
        assert!(throttle.update_at(10, start + Duration::from_millis(500)));
        assert_eq!(throttle.last_percent(), 10);

        // Not an increase.
        assert!(!throttle.update_at(10, start + Duration::from_secs(5)));
        assert!(!throttle.update_at(5, start + Duration::from_secs(5)));

        // The interval is measured from the last report.
        assert!(!throttle.update_at(20, start + Duration::from_millis(900)));
        assert!(throttle.update_at(20, start + Duration::from_millis(1000)));
    }

    #[test]
    fn zero_interval() {
        let mut throttle = ProgressThrottle::new(Duration::ZERO);

        assert!(!throttle.update(0));
        assert!(throttle.update(1));
        assert!(throttle.update(2));
        assert!(!throttle.update(2));
    }

    #[test]
    fn percentages() {
        assert_eq!(percent(0, 200), 0);
        assert_eq!(percent(1, 200), 0);
        assert_eq!(percent(199, 200), 99);
        assert_eq!(percent(200, 200), 100);
        assert_eq!(percent(u64::MAX, u64::MAX), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
