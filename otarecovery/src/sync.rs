// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    sync::{
        Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// How often a waiting thread checks the cancel signal.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitResult {
    Completed,
    TimedOut,
    Interrupted,
}

/// A count-down latch. Waiters are released once [`Self::count_down()`] has
/// been called as many times as the initial count. Completion callbacks can
/// count down from any thread.
#[derive(Debug)]
pub struct Latch {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            condvar: Condvar::new(),
        }
    }

    // The counter stays valid even if another thread panicked while holding
    // the lock.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn count_down(&self) {
        let mut count = self.lock();

        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.condvar.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.lock()
    }

    /// Block until the count reaches zero with no time limit.
    pub fn wait_indefinitely(&self) {
        let mut count = self.lock();

        while *count > 0 {
            count = self.condvar.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the count reaches zero, `timeout` elapses, or
    /// `cancel_signal` is set. The cancel signal is left untouched.
    pub fn wait(&self, timeout: Duration, cancel_signal: &AtomicBool) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();

        loop {
            if *count == 0 {
                return WaitResult::Completed;
            } else if cancel_signal.load(Ordering::SeqCst) {
                return WaitResult::Interrupted;
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitResult::TimedOut;
            }

            let slice = (deadline - now).min(CANCEL_POLL_INTERVAL);
            count = self
                .condvar
                .wait_timeout(count, slice)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use super::*;

    #[test]
    fn zero_count_completes_immediately() {
        let cancel_signal = AtomicBool::new(false);
        let latch = Latch::new(0);

        assert_eq!(
            latch.wait(Duration::ZERO, &cancel_signal),
            WaitResult::Completed
        );
        latch.wait_indefinitely();
    }

    #[test]
    fn completes_from_other_threads() {
        let cancel_signal = AtomicBool::new(false);
        let latch = Arc::new(Latch::new(3));

        let threads = (0..3)
            .map(|_| {
                let latch = latch.clone();
                thread::spawn(move || latch.count_down())
            })
            .collect::<Vec<_>>();

        assert_eq!(
            latch.wait(Duration::from_secs(30), &cancel_signal),
            WaitResult::Completed
        );

        for t in threads {
            t.join().unwrap();
        }

        // Extra count downs are ignored.
        latch.count_down();
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn times_out() {
        let cancel_signal = AtomicBool::new(false);
        let latch = Latch::new(2);
        latch.count_down();

        let start = Instant::now();
        assert_eq!(
            latch.wait(Duration::from_millis(100), &cancel_signal),
            WaitResult::TimedOut
        );
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(latch.count(), 1);
    }

    #[test]
    fn interrupted() {
        let cancel_signal = AtomicBool::new(true);
        let latch = Latch::new(1);

        assert_eq!(
            latch.wait(Duration::from_secs(30), &cancel_signal),
            WaitResult::Interrupted
        );
        assert!(cancel_signal.load(Ordering::SeqCst));
    }
}
