//! Process-wide tunables, read once from the environment on first use.
//!
//! Values are process-wide by design: every group created in the process
//! observes the same configuration, and changing the environment after the
//! first read has no effect.

use once_cell::sync::Lazy;

static MONITOR_INTERVAL_MS: Lazy<u64> = Lazy::new(|| env_u64("MONITOR_INTERVAL_MS", 200));

static REPLICATION_MONITOR_INTERVAL_MS: Lazy<u64> =
    Lazy::new(|| env_u64("REPLICATION_MONITOR_INTERVAL_MS", 15_000));

static REPLICATION_EVENT_PAUSE_TIME: Lazy<u64> =
    Lazy::new(|| env_u64("REPLICATION_EVENT_PAUSE_TIME", 20));

static CONC_THREADS: Lazy<usize> =
    Lazy::new(|| env_u64("CONC_THREADS", default_conc_threads() as u64).max(1) as usize);

static DEBUG_MODE: Lazy<bool> = Lazy::new(|| std::env::var_os("EVENT_LOOP_DEBUG").is_some());

/// Observation window for core-loop stall detection.
pub fn monitor_interval_ms() -> u64 {
    *MONITOR_INTERVAL_MS
}

/// Observation window for replication and concurrent-loop stall detection.
pub fn replication_monitor_interval_ms() -> u64 {
    *REPLICATION_MONITOR_INTERVAL_MS
}

/// Upper back-off for the replication/concurrent pauser, and the pause
/// interval hint passed to lazily created loops.
pub fn replication_event_pause_time_ms() -> u64 {
    *REPLICATION_EVENT_PAUSE_TIME
}

/// Size of the concurrent-loop pool. At least 1.
pub fn conc_threads() -> usize {
    *CONC_THREADS
}

/// True when the process is being debugged (set `EVENT_LOOP_DEBUG`): stall
/// dumps are suppressed and the core pauser's back-off ceiling is widened.
pub fn debug_mode() -> bool {
    *DEBUG_MODE
}

fn default_conc_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    (cpus + 2).div_ceil(2)
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => match v.trim().parse() {
            Ok(n) => n,
            Err(_) => {
                log::warn!("ignoring unparseable {}={:?}, using {}", name, v, default);
                default
            }
        },
        Err(_) => default,
    }
}
