// Copyright (c) The shtest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The test runner: dispatcher, per-test executors and the process
//! plumbing underneath them.

mod dispatcher;
mod executor;
mod imp;
mod internal_events;
pub(crate) mod unix;

pub use imp::{RunSummary, TestRunner, TestRunnerBuilder};
pub use unix::RusageSnapshot;

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

/// Hands out slot indices `[0, jobs)`. At most one running test holds a
/// given slot at any instant; the executor fan-out is bounded by `jobs`,
/// so a free slot always exists when a test starts.
#[derive(Clone, Debug)]
pub(crate) struct SlotPool {
    free: Arc<Mutex<Vec<bool>>>,
}

impl SlotPool {
    pub(crate) fn new(jobs: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(vec![true; jobs.max(1)])),
        }
    }

    pub(crate) fn take(&self) -> usize {
        let mut free = self.free.lock().expect("slot pool lock never poisons");
        let slot = free
            .iter()
            .position(|&is_free| is_free)
            .expect("a free slot exists while at most `jobs` tests run");
        free[slot] = false;
        slot
    }

    pub(crate) fn release(&self, slot: usize) {
        let mut free = self.free.lock().expect("slot pool lock never poisons");
        free[slot] = true;
    }
}

/// The decaying interrupt flag.
///
/// The dispatcher arms it on SIGINT; executors consult it when a child
/// dies on SIGINT/SIGTERM to classify the death as `Interrupted`. The
/// deadline is an atomic millisecond offset from a fixed origin; it takes
/// the place of the classic `alarm(1)` flag-clearing dance.
#[derive(Debug)]
pub(crate) struct InterruptWindow {
    origin: Instant,
    deadline_ms: AtomicU64,
}

impl InterruptWindow {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn arm(&self, window: Duration) {
        let deadline = self.origin.elapsed() + window;
        self.deadline_ms
            .store(deadline.as_millis() as u64, Ordering::Release);
    }

    pub(crate) fn active(&self) -> bool {
        let deadline = self.deadline_ms.load(Ordering::Acquire);
        deadline != 0 && (self.origin.elapsed().as_millis() as u64) < deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_pool_hands_out_lowest_free_slot() {
        let pool = SlotPool::new(2);
        let a = pool.take();
        let b = pool.take();
        assert_eq!((a, b), (0, 1));
        pool.release(0);
        assert_eq!(pool.take(), 0);
    }

    #[test]
    fn interrupt_window_decays() {
        let window = InterruptWindow::new();
        assert!(!window.active());
        window.arm(Duration::from_millis(40));
        assert!(window.active());
        std::thread::sleep(Duration::from_millis(60));
        assert!(!window.active());
    }
}
