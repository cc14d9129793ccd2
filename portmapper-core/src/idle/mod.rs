use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Counts supervisor ticks since the last successful relay in either direction.
#[derive(Debug)]
pub struct IdleCounter {
    ticks: AtomicU32,
    threshold: u32,
}

impl IdleCounter {
    pub fn new(threshold: u32) -> IdleCounter {
        Self {
            ticks: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }
    /// Record one tick, returns true once the threshold is reached.
    pub fn tick(&self) -> bool {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1 >= self.threshold
    }
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Release);
    }
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

/// The supervisor's clock. The first tick fires one full period after creation.
pub fn idle_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
