use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config;

/// Adaptive back-off used by an idle event loop between empty polls.
///
/// `pause()` is only ever called by the loop's own thread; `unpause()` may be
/// called from any thread and must never be lost, even when it races with a
/// `pause()` that is about to go to sleep.
pub trait Pauser: Send + Sync {
    /// Block the calling thread until work is signalled or the current
    /// back-off elapses. `max` caps the sleep regardless of how far the
    /// back-off has ramped.
    fn pause(&self, max: Duration);

    /// Wake a paused thread. Idempotent and safe from any thread.
    fn unpause(&self);

    /// Collapse the back-off after useful work was done.
    fn reset(&self);

    /// Rolling counters for periodic reporting.
    fn stats(&self) -> PauseStats;
}

/// Counters accumulated by a pauser over its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PauseStats {
    /// Number of `pause()` calls that reached the timed-park phase.
    pub pauses: u64,
    /// Number of `unpause()` calls.
    pub unpauses: u64,
    /// Cumulative time spent parked.
    pub time_paused: Duration,
}

/// A pauser that spins, then yields, then parks for geometrically increasing
/// intervals up to a ceiling.
///
/// An `unpause()` observed during any phase makes `pause()` return
/// immediately and collapses the back-off to its minimum. The wake protocol
/// follows the usual ready-flag-plus-unpark rule: the flag is set before the
/// sleeper is unparked, and an unpark that arrives before the park makes the
/// park return immediately, so no wake is lost.
pub struct LongPauser {
    busy_spins: u32,
    yield_spins: u32,
    min_pause: Duration,
    max_pause: Duration,
    /// Next park length in nanoseconds. Only the pausing thread writes it.
    current_ns: AtomicU64,
    /// Set by `unpause()`, consumed by the pausing thread.
    ready: AtomicBool,
    /// The thread to unpark. Registered by the pausing thread before it
    /// checks `ready` for the last time.
    sleeper: Mutex<Option<std::thread::Thread>>,
    pauses: AtomicU64,
    unpauses: AtomicU64,
    paused_ns: AtomicU64,
}

impl LongPauser {
    pub fn new(busy_spins: u32, yield_spins: u32, min_pause: Duration, max_pause: Duration) -> Self {
        assert!(min_pause <= max_pause);
        assert!(!min_pause.is_zero());
        Self {
            busy_spins,
            yield_spins,
            min_pause,
            max_pause,
            current_ns: AtomicU64::new(min_pause.as_nanos() as u64),
            ready: AtomicBool::new(false),
            sleeper: Mutex::new(None),
            pauses: AtomicU64::new(0),
            unpauses: AtomicU64::new(0),
            paused_ns: AtomicU64::new(0),
        }
    }

    /// The profile used by a group's core loop: a long spin phase and a
    /// short park ceiling, widened when debugging so the loop does not churn
    /// under a stopped process.
    pub fn balanced() -> Self {
        let max_pause = if config::debug_mode() {
            Duration::from_millis(200)
        } else {
            Duration::from_millis(20)
        };
        Self::new(1000, 200, Duration::from_micros(250), max_pause)
    }

    /// The profile used by replication and concurrent loops: half the spin
    /// counts of [`balanced`](Self::balanced), ceiling taken from
    /// `REPLICATION_EVENT_PAUSE_TIME`.
    pub fn replication() -> Self {
        Self::new(
            500,
            100,
            Duration::from_micros(250),
            Duration::from_millis(config::replication_event_pause_time_ms()),
        )
    }

    /// A fixed, non-ramping profile: no spinning, constant park interval.
    /// Used by the monitor loop.
    pub fn fixed(interval: Duration) -> Self {
        Self::new(0, 0, interval, interval)
    }

    /// Consume a pending wake, if any.
    fn take_ready(&self) -> bool {
        self.ready
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

impl Pauser for LongPauser {
    fn pause(&self, max: Duration) {
        for _ in 0..self.busy_spins {
            if self.take_ready() {
                self.reset();
                return;
            }
            std::hint::spin_loop();
        }
        for _ in 0..self.yield_spins {
            if self.take_ready() {
                self.reset();
                return;
            }
            std::thread::yield_now();
        }

        // Register for wake-up before the final ready check. `unpause()`
        // takes the same lock, so it either sees us here and unparks (the
        // unpark token then short-circuits the park below), or it stored the
        // ready flag early enough for the check below to observe it.
        {
            let mut sleeper = self.sleeper.lock().unwrap();
            let current = std::thread::current();
            if sleeper.as_ref().map(|t| t.id()) != Some(current.id()) {
                *sleeper = Some(current);
            }
        }

        let pause = Duration::from_nanos(self.current_ns.load(Ordering::Relaxed)).min(max);
        let start = Instant::now();
        let mut woken = self.take_ready();
        if !woken {
            std::thread::park_timeout(pause);
            woken = self.take_ready();
        }
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.paused_ns
            .fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);

        if woken {
            self.reset();
        } else {
            // timed out with nothing to do: ramp up for next time
            let current = self.current_ns.load(Ordering::Relaxed);
            let next = current
                .saturating_mul(2)
                .min(self.max_pause.as_nanos() as u64);
            self.current_ns.store(next, Ordering::Relaxed);
        }
    }

    fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
        if let Some(t) = self.sleeper.lock().unwrap().as_ref() {
            t.unpark();
        }
    }

    fn reset(&self) {
        self.current_ns
            .store(self.min_pause.as_nanos() as u64, Ordering::Relaxed);
    }

    fn stats(&self) -> PauseStats {
        PauseStats {
            pauses: self.pauses.load(Ordering::Relaxed),
            unpauses: self.unpauses.load(Ordering::Relaxed),
            time_paused: Duration::from_nanos(self.paused_ns.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_unpause_wakes_parked_thread() {
        let pauser = Arc::new(LongPauser::fixed(Duration::from_secs(5)));
        let pauser_clone = Arc::clone(&pauser);

        let t = std::thread::spawn(move || {
            let start = Instant::now();
            pauser_clone.pause(Duration::MAX);
            start.elapsed()
        });

        std::thread::sleep(Duration::from_millis(200));
        pauser.unpause();

        let paused = t.join().unwrap();
        assert!(paused < Duration::from_secs(2));
        assert_eq!(pauser.stats().unpauses, 1);
    }

    #[test]
    fn test_unpause_before_pause_is_not_lost() {
        let pauser = LongPauser::fixed(Duration::from_secs(5));
        pauser.unpause();

        let start = Instant::now();
        pauser.pause(Duration::MAX);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_max_caps_the_park() {
        let pauser = LongPauser::fixed(Duration::from_secs(5));

        let start = Instant::now();
        pauser.pause(Duration::from_millis(1));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_ramps_and_caps() {
        let pauser = LongPauser::new(0, 0, Duration::from_millis(1), Duration::from_millis(4));

        // 1 + 2 + 4 + 4 + 4 ms of timeouts, nothing ever signalled
        let start = Instant::now();
        for _ in 0..5 {
            pauser.pause(Duration::MAX);
        }
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(10));
        assert!(elapsed < Duration::from_secs(2));

        let stats = pauser.stats();
        assert_eq!(stats.pauses, 5);
        assert!(stats.time_paused >= Duration::from_millis(10));
    }

    #[test]
    fn test_wake_resets_backoff() {
        let pauser = LongPauser::new(0, 0, Duration::from_millis(1), Duration::from_millis(64));

        // ramp up
        for _ in 0..8 {
            pauser.pause(Duration::MAX);
        }
        assert_eq!(pauser.current_ns.load(Ordering::Relaxed), 64_000_000);

        pauser.unpause();
        pauser.pause(Duration::MAX);
        assert_eq!(pauser.current_ns.load(Ordering::Relaxed), 1_000_000);
    }
}
