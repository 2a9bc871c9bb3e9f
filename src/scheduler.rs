//! Fixed-period tick driver.
//!
//! Deadlines sit on a fixed grid anchored at start, so jitter in one tick
//! does not push the following ones back. A tick whose deadline passes
//! while the previous one is still running is skipped and counted; it is
//! never run late.

use log::{debug, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// About 58.8 ticks per second.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(17);

/// Lets at most one tick run at a time.
#[derive(Debug, Default)]
pub struct TickGate {
    busy: AtomicBool,
}

/// Holds the [`TickGate`] closed until dropped.
#[derive(Debug)]
pub struct TickGuard<'a> {
    gate: &'a TickGate,
}

impl TickGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a tick is already running.
    pub fn try_enter(&self) -> Option<TickGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TickGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Default)]
pub struct TickStats {
    ran: AtomicU64,
    skipped: AtomicU64,
}

impl TickStats {
    pub fn ran(&self) -> u64 {
        self.ran.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

pub struct Scheduler {
    stop: Arc<AtomicBool>,
    stats: Arc<TickStats>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Calls `work` every `period` on a new thread until stopped. `gate`
    /// is shared with anyone else who may run a tick by hand.
    pub fn spawn<F>(period: Duration, gate: Arc<TickGate>, mut work: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(TickStats::default());
        let period = period.max(Duration::from_millis(1));

        let th_stop = Arc::clone(&stop);
        let th_stats = Arc::clone(&stats);
        let handle = thread::spawn(move || {
            info!("Scheduler : ticking every {:?}", period);
            let mut next_tick = Instant::now();
            while !th_stop.load(Ordering::Acquire) {
                match gate.try_enter() {
                    Some(_guard) => {
                        work();
                        th_stats.ran.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        th_stats.skipped.fetch_add(1, Ordering::Relaxed);
                        debug!("Scheduler : previous tick still running, skipped");
                    }
                }

                next_tick += period;
                let now = Instant::now();
                if next_tick > now {
                    spin_sleep::sleep(next_tick - now);
                } else {
                    let behind = now.duration_since(next_tick).as_nanos();
                    let missed = (behind / period.as_nanos()) as u32 + 1;
                    th_stats.skipped.fetch_add(missed as u64, Ordering::Relaxed);
                    debug!("Scheduler : tick overran, skipped {} deadline(s)", missed);
                    next_tick += period * missed;
                    spin_sleep::sleep(next_tick - now);
                }
            }
            info!("Scheduler : terminated.");
        });

        Self {
            stop,
            stats,
            handle: Some(handle),
        }
    }

    pub fn stats(&self) -> Arc<TickStats> {
        Arc::clone(&self.stats)
    }

    /// Stops ticking. Returns once the tick in progress, if any, is done.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Scheduler : tick thread panicked.");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_one_at_a_time() {
        let gate = TickGate::new();
        let first = gate.try_enter();
        assert!(first.is_some());
        assert!(gate.try_enter().is_none());
        assert!(gate.is_busy());
        drop(first);
        assert!(!gate.is_busy());
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn ticks_at_roughly_the_period() {
        let gate = Arc::new(TickGate::new());
        let mut scheduler = Scheduler::spawn(Duration::from_millis(5), gate, || {});
        let stats = scheduler.stats();
        thread::sleep(Duration::from_millis(200));
        scheduler.stop();

        let ran = stats.ran();
        assert!(ran >= 10, "only {} ticks", ran);
        assert!(ran <= 50, "{} ticks", ran);
    }

    #[test]
    fn slow_ticks_skip_deadlines_instead_of_queueing() {
        let gate = Arc::new(TickGate::new());
        let mut scheduler = Scheduler::spawn(Duration::from_millis(5), gate, || {
            thread::sleep(Duration::from_millis(22))
        });
        let stats = scheduler.stats();
        thread::sleep(Duration::from_millis(150));
        scheduler.stop();

        assert!(stats.ran() <= 8, "{} ticks ran", stats.ran());
        assert!(stats.skipped() >= stats.ran(), "{} skipped", stats.skipped());
    }

    #[test]
    fn held_gate_skips_ticks() {
        let gate = Arc::new(TickGate::new());
        let guard_gate = Arc::clone(&gate);
        let held = guard_gate.try_enter();
        let mut scheduler = Scheduler::spawn(Duration::from_millis(5), gate, || {});
        let stats = scheduler.stats();
        thread::sleep(Duration::from_millis(50));
        scheduler.stop();
        drop(held);

        assert_eq!(stats.ran(), 0);
        assert!(stats.skipped() > 0);
    }
}
