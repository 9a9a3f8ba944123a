//! Advisory CPU pinning for bound worker threads.
//!
//! When a group is created with `binding`, each of its worker threads asks to
//! be pinned to one CPU out of the process's allowed set, assigned
//! round-robin in thread start order. Pinning is best-effort: any failure is
//! logged at `debug` and the thread runs unpinned.

#[cfg(target_os = "linux")]
pub(crate) fn bind_current_thread(loop_name: &str) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
    use nix::unistd::{gettid, Pid};

    static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

    let allowed = match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => set,
        Err(e) => {
            log::debug!("{}: could not read the allowed cpu set: {}", loop_name, e);
            return;
        }
    };

    let cpus: Vec<usize> = (0..CpuSet::count())
        .filter(|&i| allowed.is_set(i).unwrap_or(false))
        .collect();
    if cpus.is_empty() {
        return;
    }

    let cpu = cpus[NEXT_CPU.fetch_add(1, Ordering::Relaxed) % cpus.len()];
    let mut set = CpuSet::new();
    if set.set(cpu).is_err() {
        return;
    }

    match sched_setaffinity(gettid(), &set) {
        Ok(()) => log::debug!("{}: pinned to cpu {}", loop_name, cpu),
        Err(e) => log::debug!("{}: could not pin to cpu {}: {}", loop_name, cpu, e),
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn bind_current_thread(_loop_name: &str) {}
