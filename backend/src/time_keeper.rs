//! Fixed-period cycle pacing on the monotonic clock.
//!
//! Every periodic task in the backend — the state-machine main loop and one
//! command scheduler per board — paces itself with a `TimeKeeper`. Deadlines
//! are absolute (`statechange_epoch + (cycle + 1) * cycle_time`), so a loop
//! that runs long does not drift: an overrun returns immediately and the loop
//! free-runs until it catches back up with the schedule. Cycles are never
//! skipped.
//!
//! Uses `tokio::time::Instant` throughout so the paused test clock applies.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

struct Pacing {
    cycle_time: Duration,
    statechange: Instant,
}

pub struct TimeKeeper {
    name: String,
    /// Emit a cycle-count debug line roughly this often. `None` disables.
    debug_every: Option<Duration>,
    start: Instant,
    pacing: Mutex<Pacing>,
    cycle: AtomicU64,
}

impl TimeKeeper {
    pub fn new(name: impl Into<String>, cycle_time: Duration, debug_every: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            debug_every,
            start: now,
            pacing: Mutex::new(Pacing {
                cycle_time,
                statechange: now,
            }),
            cycle: AtomicU64::new(0),
        }
    }

    fn pacing(&self) -> std::sync::MutexGuard<'_, Pacing> {
        // Short critical sections with no panics inside; recover anyway.
        self.pacing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn cycle_start(&self) {
        let Some(debug_every) = self.debug_every else {
            return;
        };
        let cycle_time = self.pacing().cycle_time;
        let per = (debug_every.as_secs_f64() / cycle_time.as_secs_f64()).max(1.0) as u64;
        let cycle = self.cycle.load(Ordering::Relaxed);
        if cycle % per == 0 {
            debug!(
                "TimeKeeper {} is at cycle {} at {:.5} seconds",
                self.name,
                cycle,
                self.time_since_start()
            );
        }
    }

    /// Suspends until the next scheduled tick. Past deadlines return
    /// immediately; the schedule itself is never shifted.
    pub async fn cycle_end(&self) {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let deadline = {
            let pacing = self.pacing();
            pacing.statechange + pacing.cycle_time.mul_f64((cycle + 1) as f64)
        };
        tokio::time::sleep_until(deadline).await;
    }

    /// Resets the cycle counter and the state-change epoch to now.
    pub fn statechange(&self) {
        self.cycle.store(0, Ordering::Relaxed);
        self.pacing().statechange = Instant::now();
    }

    /// Replaces the cycle period; resets the counter and epoch like a
    /// state change.
    pub fn set_interval(&self, cycle_time: Duration) {
        let mut pacing = self.pacing();
        pacing.cycle_time = cycle_time;
        pacing.statechange = Instant::now();
        drop(pacing);
        self.cycle.store(0, Ordering::Relaxed);
    }

    pub fn time_since_start(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn time_since_statechange(&self) -> f64 {
        self.pacing().statechange.elapsed().as_secs_f64()
    }

    pub fn get_cycle(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }
}
