//! Cooperative top-level scheduler.
//!
//! Nothing in a pipeline progresses unless it is pumped. The [`Scheduler`]
//! pairs a [`TickSource`] (how long to wait between pumps) with whatever
//! [`Pollable`] targets the caller hands it, so the pump can run from a
//! plain loop in the binary or step by step in a test.

use crate::backend::StageHost;
use crate::state::StateDb;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::executor::Pipeline;

/// Something that needs periodic `process_messages()` calls.
pub trait Pollable {
    fn poll(&mut self);
}

impl Pollable for StageHost {
    fn poll(&mut self) {
        self.process_messages();
    }
}

impl Pollable for StateDb {
    fn poll(&mut self) {
        self.process_messages();
    }
}

impl Pollable for Pipeline {
    fn poll(&mut self) {
        self.process_messages();
    }
}

/// Paces the pump.
pub trait TickSource: Send {
    /// Block until the next tick is due.
    fn wait_tick(&mut self);
}

/// Fixed cadence that compensates for time spent polling.
#[derive(Debug)]
pub struct IntervalTicks {
    interval: Duration,
    next: Instant,
}

impl IntervalTicks {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
        }
    }
}

impl TickSource for IntervalTicks {
    fn wait_tick(&mut self) {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
            self.next += self.interval;
        } else {
            // Fell behind; don't try to catch up with a burst.
            self.next = now + self.interval;
        }
    }
}

/// Tick source that never sleeps. Tests drive it as fast as they like.
#[derive(Debug, Default)]
pub struct ManualTicks {
    ticks: u64,
}

impl ManualTicks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl TickSource for ManualTicks {
    fn wait_tick(&mut self) {
        self.ticks += 1;
        std::thread::yield_now();
    }
}

pub struct Scheduler {
    ticks: Box<dyn TickSource>,
    pumps: u64,
}

impl Scheduler {
    pub fn new(ticks: impl TickSource + 'static) -> Self {
        Self {
            ticks: Box::new(ticks),
            pumps: 0,
        }
    }

    /// Scheduler pumping every `interval`.
    pub fn interval(interval: Duration) -> Self {
        Self::new(IntervalTicks::new(interval))
    }

    pub fn manual() -> Self {
        Self::new(ManualTicks::new())
    }

    /// Number of pumps performed.
    pub fn pumps(&self) -> u64 {
        self.pumps
    }

    /// Poll every target once, then wait for the next tick.
    pub fn pump(&mut self, targets: &mut [&mut dyn Pollable]) {
        for target in targets.iter_mut() {
            target.poll();
        }
        self.pumps += 1;
        self.ticks.wait_tick();
    }

    /// Pump `target` until `done` holds or `timeout` elapses.
    ///
    /// Returns whether `done` held. The predicate is checked after each poll,
    /// and once before the first one.
    pub fn run_until<P, F>(&mut self, target: &mut P, mut done: F, timeout: Duration) -> bool
    where
        P: Pollable + ?Sized,
        F: FnMut(&P) -> bool,
    {
        let deadline = Instant::now() + timeout;
        if done(target) {
            return true;
        }
        loop {
            target.poll();
            self.pumps += 1;
            if done(target) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            self.ticks.wait_tick();
        }
    }

    /// Pump `target` while `running` is set.
    pub fn run_while<P: Pollable + ?Sized>(&mut self, target: &mut P, running: &AtomicBool) {
        while running.load(Ordering::SeqCst) {
            target.poll();
            self.pumps += 1;
            self.ticks.wait_tick();
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pumps", &self.pumps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter {
        polls: u32,
    }

    impl Pollable for Counter {
        fn poll(&mut self) {
            self.polls += 1;
        }
    }

    #[test]
    fn test_run_until_stops_when_done() {
        let mut scheduler = Scheduler::manual();
        let mut counter = Counter::default();
        let done = scheduler.run_until(&mut counter, |c| c.polls >= 3, Duration::from_secs(1));
        assert!(done);
        assert_eq!(counter.polls, 3);
        assert_eq!(scheduler.pumps(), 3);
    }

    #[test]
    fn test_run_until_times_out() {
        let mut scheduler = Scheduler::interval(Duration::from_millis(1));
        let mut counter = Counter::default();
        let start = Instant::now();
        assert!(!scheduler.run_until(&mut counter, |_| false, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(counter.polls > 1);
    }

    #[test]
    fn test_already_done_does_not_poll() {
        let mut scheduler = Scheduler::manual();
        let mut counter = Counter::default();
        assert!(scheduler.run_until(&mut counter, |_| true, Duration::ZERO));
        assert_eq!(counter.polls, 0);
    }

    #[test]
    fn test_pump_polls_all_targets() {
        let mut scheduler = Scheduler::manual();
        let mut a = Counter::default();
        let mut b = Counter::default();
        scheduler.pump(&mut [&mut a, &mut b]);
        scheduler.pump(&mut [&mut a]);
        assert_eq!((a.polls, b.polls), (2, 1));
    }

    #[test]
    fn test_run_while_exits_on_flag() {
        let mut scheduler = Scheduler::manual();
        let mut counter = Counter::default();
        let running = AtomicBool::new(false);
        scheduler.run_while(&mut counter, &running);
        assert_eq!(counter.polls, 0);
    }

    #[test]
    fn test_interval_ticks_pace() {
        let mut ticks = IntervalTicks::new(Duration::from_millis(5));
        let start = Instant::now();
        for _ in 0..4 {
            ticks.wait_tick();
        }
        assert!(start.elapsed() >= Duration::from_millis(15));
    }
}
