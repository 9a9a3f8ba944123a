use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config;
use crate::event_loop::{wall_clock_ms, LoopHandle, LOOP_IDLE, LOOP_QUIET, LOOP_TERMINATED};
use crate::handler::{EventHandler, HandlerError, Priority};
use crate::pauser::{PauseStats, Pauser};

/// A stall probe for one observed worker, hosted by the monitor loop.
///
/// Every tick the probe samples the worker's liveness timestamp. A quiet or
/// idle worker is ignored. A worker that has been inside the same handler
/// invocation for longer than half the observation window gets a diagnostic
/// dump; a terminated worker gets one warning, after which the probe retires
/// itself.
pub struct LoopBlockMonitor {
    window_ms: u64,
    observed: LoopHandle,
    /// Largest blocked-interval count recorded while not dumping. Starts at
    /// 1 and is never reset on quiet observations; resetting it would change
    /// the dump cadence observably.
    last_interval: u64,
}

impl LoopBlockMonitor {
    pub fn new(window_ms: u64, observed: LoopHandle) -> Self {
        Self {
            window_ms,
            observed,
            last_interval: 1,
        }
    }
}

impl EventHandler for LoopBlockMonitor {
    fn action(&mut self) -> Result<bool, HandlerError> {
        let t = self.observed.loop_start_ms();
        if t == LOOP_QUIET || t == LOOP_IDLE {
            return Ok(false);
        }
        if t == LOOP_TERMINATED {
            log::warn!("monitoring a terminated event loop {}", self.observed.name());
            return Err(HandlerError::Done);
        }

        let blocked_ms = wall_clock_ms().saturating_sub(t);
        let intervals = blocked_ms / ((self.window_ms + 1) / 2);

        if intervals > self.last_interval && !config::debug_mode() && self.observed.is_alive() {
            let observed = &self.observed;
            observed.dump_running_state(
                &format!("thread has blocked for {} ms", blocked_ms),
                // check we are still in the same invocation
                &|| observed.loop_start_ms() == t,
            );
        } else {
            self.last_interval = intervals.max(1);
        }
        Ok(false)
    }

    fn priority(&self) -> Priority {
        Priority::Monitor
    }

    fn name(&self) -> &str {
        "loop-block-monitor"
    }
}

/// Periodic statistics sink for one pauser, hosted by the monitor loop.
/// Logs the counter deltas every reporting period; never blocks.
pub struct PauserMonitor {
    pauser: Arc<dyn Pauser>,
    description: String,
    period: Duration,
    next_report: Instant,
    last: PauseStats,
}

impl PauserMonitor {
    pub fn new(pauser: Arc<dyn Pauser>, description: &str, period_secs: u64) -> Self {
        let period = Duration::from_secs(period_secs);
        Self {
            pauser,
            description: description.to_string(),
            period,
            next_report: Instant::now() + period,
            last: PauseStats::default(),
        }
    }
}

impl EventHandler for PauserMonitor {
    fn action(&mut self) -> Result<bool, HandlerError> {
        if Instant::now() < self.next_report {
            return Ok(false);
        }
        let stats = self.pauser.stats();
        log::debug!(
            "{}: {} pauses, {} unpauses, {:?} parked over the last {:?}",
            self.description,
            stats.pauses - self.last.pauses,
            stats.unpauses - self.last.unpauses,
            stats.time_paused - self.last.time_paused,
            self.period,
        );
        self.last = stats;
        self.next_report = Instant::now() + self.period;
        Ok(false)
    }

    fn priority(&self) -> Priority {
        Priority::Monitor
    }

    fn name(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::event_loop::EventLoop;
    use crate::pauser::LongPauser;

    fn test_loop(name: &str) -> EventLoop {
        EventLoop::new(
            name,
            Arc::new(LongPauser::fixed(Duration::from_millis(1))),
            Duration::MAX,
            false,
            false,
        )
    }

    #[test]
    fn test_quiet_loop_is_ignored() {
        let el = test_loop("quiet-loop");
        let mut probe = LoopBlockMonitor::new(100, el.handle());

        // never started: the sentinel reads as quiet
        for _ in 0..5 {
            assert!(matches!(probe.action(), Ok(false)));
        }
        assert_eq!(el.handle().dump_count(), 0);
        assert_eq!(probe.last_interval, 1);
    }

    #[test]
    fn test_probe_retires_on_terminated_loop() {
        let el = test_loop("dead-loop");
        el.start();
        el.close();

        let mut probe = LoopBlockMonitor::new(100, el.handle());
        assert!(matches!(probe.action(), Err(HandlerError::Done)));
    }

    #[test]
    fn test_blocked_loop_is_dumped() {
        struct Sleeper;
        impl EventHandler for Sleeper {
            fn action(&mut self) -> Result<bool, HandlerError> {
                std::thread::sleep(Duration::from_millis(500));
                Err(HandlerError::Done)
            }
            fn name(&self) -> &str {
                "sleeper"
            }
        }

        let el = test_loop("stalled-loop");
        el.start();
        let handle = el.handle();
        el.add_handler(Box::new(Sleeper)).unwrap();

        // tick the probe by hand while the handler is asleep
        let mut probe = LoopBlockMonitor::new(100, el.handle());
        let start = Instant::now();
        while handle.dump_count() == 0 && start.elapsed() < Duration::from_secs(5) {
            probe.action().unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(handle.dump_count() > 0);

        el.close();
    }

    #[test]
    fn test_pauser_monitor_reports_on_period() {
        let pauser: Arc<dyn Pauser> = Arc::new(LongPauser::fixed(Duration::from_millis(1)));
        let mut monitor = PauserMonitor::new(Arc::clone(&pauser), "test pauser", 0);

        pauser.pause(Duration::from_millis(1));
        assert!(matches!(monitor.action(), Ok(false)));
        assert_eq!(monitor.last, pauser.stats());
    }

    #[test]
    fn test_counters_count() {
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        // a probe is an ordinary handler: it can be hosted by any loop
        struct Probe(Arc<AtomicU32>);
        impl EventHandler for Probe {
            fn action(&mut self) -> Result<bool, HandlerError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(false)
            }
            fn priority(&self) -> Priority {
                Priority::Monitor
            }
        }

        let el = test_loop("probe-host");
        el.start();
        el.add_handler(Box::new(Probe(count_clone))).unwrap();
        let start = Instant::now();
        while count.load(Ordering::SeqCst) < 3 && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
        el.close();
    }
}
