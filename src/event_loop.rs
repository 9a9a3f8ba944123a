use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atomic_refcell::AtomicRefCell;
use crossbeam::channel::{Receiver, Sender};

use crate::affinity;
use crate::error::AddHandlerError;
use crate::handler::{EventHandler, HandlerError};
use crate::pauser::Pauser;

/// `loop_start_ms` before the loop's first burst. Monitors treat this as
/// quiet.
pub const LOOP_QUIET: u64 = 0;
/// `loop_start_ms` while the loop is parked between bursts.
pub const LOOP_IDLE: u64 = u64::MAX;
/// `loop_start_ms` once the worker thread has exited.
pub const LOOP_TERMINATED: u64 = u64::MAX - 1;

/// Sentinel for "no handler currently running".
const NO_HANDLER: usize = usize::MAX;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single-threaded cooperative worker.
///
/// The loop owns one named OS thread (thread name = loop name) that drives
/// its registered handlers round-robin, one [`action()`] step at a time.
/// Before every step the worker publishes the wall-clock millisecond into
/// `loop_start_ms`; a monitor thread reads that field to detect steps that
/// never return. Between bursts the worker yields through its pauser, so an
/// idle loop costs a bounded park rather than a spin.
///
/// [`action()`]: EventHandler::action
pub struct EventLoop {
    shared: Arc<LoopShared>,
    handler_tx: Sender<Box<dyn EventHandler>>,
    /// Parked here until `start()` moves it into the worker thread.
    handler_rx: Mutex<Option<Receiver<Box<dyn EventHandler>>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    daemon: bool,
    binding: bool,
    pause_hint: Duration,
}

pub(crate) struct LoopShared {
    name: String,
    pauser: Arc<dyn Pauser>,
    /// The liveness hot field; see the `LOOP_*` sentinels. Written by the
    /// loop thread, read by the monitor thread, relaxed on both sides.
    loop_start_ms: AtomicU64,
    stop: AtomicBool,
    started: AtomicBool,
    closed: AtomicBool,
    /// Names of the registered handlers, republished by the worker whenever
    /// the set changes. The dump path reads it with `try_borrow` and gives
    /// up rather than block.
    handler_names: AtomicRefCell<Vec<String>>,
    /// Index into `handler_names` of the handler currently inside
    /// `action()`, or `NO_HANDLER`.
    current_handler: AtomicUsize,
    dumps: AtomicU64,
}

impl EventLoop {
    pub fn new(
        name: &str,
        pauser: Arc<dyn Pauser>,
        pause_hint: Duration,
        daemon: bool,
        binding: bool,
    ) -> Self {
        let (handler_tx, handler_rx) = crossbeam::channel::unbounded();
        Self {
            shared: Arc::new(LoopShared {
                name: name.to_string(),
                pauser,
                loop_start_ms: AtomicU64::new(LOOP_QUIET),
                stop: AtomicBool::new(false),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                handler_names: AtomicRefCell::new(Vec::new()),
                current_handler: AtomicUsize::new(NO_HANDLER),
                dumps: AtomicU64::new(0),
            }),
            handler_tx,
            handler_rx: Mutex::new(Some(handler_rx)),
            thread: Mutex::new(None),
            daemon,
            binding,
            pause_hint,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submit a handler. Handlers submitted before `start()` are queued and
    /// drained on the first burst. Fails once the loop has been closed or
    /// its worker has exited, handing the handler back.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<(), AddHandlerError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AddHandlerError(handler));
        }
        match self.handler_tx.send(handler) {
            Ok(()) => {
                // wake the loop so a parked worker picks it up promptly
                self.shared.pauser.unpause();
                Ok(())
            }
            // the worker has exited and dropped its receiver
            Err(e) => Err(AddHandlerError(e.into_inner())),
        }
    }

    /// Spawn the worker thread. Idempotent; a no-op after `close()`.
    pub fn start(&self) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let rx = self
            .handler_rx
            .lock()
            .unwrap()
            .take()
            .expect("event loop started twice");
        let shared = Arc::clone(&self.shared);
        let binding = self.binding;
        let pause_hint = self.pause_hint;

        let handle = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run_loop(shared, rx, binding, pause_hint))
            .expect("failed to spawn event loop thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Ask the worker to exit after its in-flight step. Returns promptly;
    /// does not wait for the thread.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pauser.unpause();
    }

    /// Stop the worker and, for non-daemon loops, join its thread.
    /// Idempotent. A panic carried out of the worker is logged, not
    /// propagated.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        if !self.daemon {
            if let Some(handle) = self.thread.lock().unwrap().take() {
                if let Err(e) = handle.join() {
                    log::warn!("{}: worker did not exit cleanly: {:?}", self.shared.name, e);
                }
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn unpause(&self) {
        self.shared.pauser.unpause();
    }

    /// See [`LoopHandle::dump_running_state`].
    pub fn dump_running_state(&self, reason: &str, still_in_same_invocation: &dyn Fn() -> bool) {
        self.handle().dump_running_state(reason, still_in_same_invocation);
    }

    /// A cheap cloneable view of the loop for monitors and diagnostics.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// A non-owning view of an [`EventLoop`], safe to read from any thread.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The liveness timestamp; see the `LOOP_*` sentinels. May be slightly
    /// stale when read from another thread.
    pub fn loop_start_ms(&self) -> u64 {
        self.shared.loop_start_ms.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// Names of the handlers currently registered, as last published by the
    /// worker.
    pub fn handler_names(&self) -> Vec<String> {
        match self.shared.handler_names.try_borrow() {
            Ok(names) => names.clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Number of diagnostic dumps emitted for this loop.
    pub fn dump_count(&self) -> u64 {
        self.shared.dumps.load(Ordering::Relaxed)
    }

    /// Report the loop's current state to the log, naming the handler the
    /// worker is inside if one is running. `still_in_same_invocation` is
    /// re-checked immediately before emitting: when it reports false the
    /// stall has already cleared and only a `debug` breadcrumb is left.
    pub fn dump_running_state(&self, reason: &str, still_in_same_invocation: &dyn Fn() -> bool) {
        let current = self.shared.current_handler.load(Ordering::Relaxed);
        let handler = match self.shared.handler_names.try_borrow() {
            Ok(names) => names.get(current).cloned(),
            // the worker is republishing the table; skip the name
            Err(_) => None,
        };

        if !still_in_same_invocation() {
            log::debug!("{}: {} (the loop has moved on)", self.shared.name, reason);
            return;
        }

        self.shared.dumps.fetch_add(1, Ordering::Relaxed);
        match handler {
            Some(h) => log::warn!("{}: {}, currently in handler {:?}", self.shared.name, reason, h),
            None => log::warn!("{}: {}", self.shared.name, reason),
        }
    }
}

impl LoopShared {
    fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire)
            && self.loop_start_ms.load(Ordering::Relaxed) != LOOP_TERMINATED
    }

    /// Publish the handler-name table. Spins out any in-flight reader; dump
    /// readers only ever hold the borrow for an instant.
    fn publish_names(&self, handlers: &[Box<dyn EventHandler>]) {
        loop {
            if let Ok(mut names) = self.handler_names.try_borrow_mut() {
                *names = handlers.iter().map(|h| h.name().to_string()).collect();
                return;
            }
            std::hint::spin_loop();
        }
    }
}

fn run_loop(
    shared: Arc<LoopShared>,
    rx: Receiver<Box<dyn EventHandler>>,
    binding: bool,
    pause_hint: Duration,
) {
    if binding {
        affinity::bind_current_thread(&shared.name);
    }

    let mut handlers: Vec<Box<dyn EventHandler>> = Vec::new();

    while !shared.stop.load(Ordering::Acquire) {
        // take on newly submitted handlers
        let mut changed = false;
        while let Ok(h) = rx.try_recv() {
            log::trace!("{}: adding handler {:?}", shared.name, h.name());
            handlers.push(h);
            changed = true;
        }
        if changed {
            shared.publish_names(&handlers);
        }

        let mut progress = false;
        let mut idx = 0;
        while idx < handlers.len() {
            if shared.stop.load(Ordering::Acquire) {
                break;
            }
            shared.current_handler.store(idx, Ordering::Relaxed);
            shared
                .loop_start_ms
                .store(wall_clock_ms(), Ordering::Relaxed);
            match handlers[idx].action() {
                Ok(p) => {
                    progress |= p;
                    idx += 1;
                }
                Err(HandlerError::Done) => {
                    let h = handlers.remove(idx);
                    log::trace!("{}: handler {:?} is done", shared.name, h.name());
                    shared.publish_names(&handlers);
                }
                Err(HandlerError::Failed(e)) => {
                    log::warn!(
                        "{}: handler {:?} failed: {}",
                        shared.name,
                        handlers[idx].name(),
                        e
                    );
                    idx += 1;
                }
            }
        }
        shared.current_handler.store(NO_HANDLER, Ordering::Relaxed);
        shared.loop_start_ms.store(LOOP_IDLE, Ordering::Relaxed);

        if progress {
            shared.pauser.reset();
        } else {
            shared.pauser.pause(pause_hint);
        }
    }

    shared.loop_start_ms.store(LOOP_TERMINATED, Ordering::Relaxed);
    log::trace!("{}: worker exiting", shared.name);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    use super::*;
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

    /// Counts its invocations; retires after `limit` calls if a limit is set.
    struct Counting {
        count: Arc<AtomicU32>,
        limit: Option<u32>,
    }

    impl EventHandler for Counting {
        fn action(&mut self) -> Result<bool, HandlerError> {
            let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            if self.limit == Some(n) {
                return Err(HandlerError::Done);
            }
            Ok(true)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_handlers_queued_before_start_run() {
        let el = test_loop("queued-loop");
        let count = Arc::new(AtomicU32::new(0));
        el.add_handler(Box::new(Counting {
            count: Arc::clone(&count),
            limit: None,
        }))
        .unwrap();

        el.start();
        assert!(wait_until(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) > 10
        }));
        el.close();
    }

    #[test]
    fn test_self_removal_leaves_others_running() {
        let el = test_loop("removal-loop");
        el.start();

        let short = Arc::new(AtomicU32::new(0));
        let long = Arc::new(AtomicU32::new(0));
        el.add_handler(Box::new(Counting {
            count: Arc::clone(&short),
            limit: Some(3),
        }))
        .unwrap();
        el.add_handler(Box::new(Counting {
            count: Arc::clone(&long),
            limit: None,
        }))
        .unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            long.load(Ordering::SeqCst) > 100
        }));
        // the retired handler was never called again
        assert_eq!(short.load(Ordering::SeqCst), 3);
        // and its name is no longer published
        assert_eq!(el.handle().handler_names(), vec!["counting".to_string()]);
        el.close();
    }

    #[test]
    fn test_failed_handler_keeps_running() {
        struct Failing(Arc<AtomicU32>);
        impl EventHandler for Failing {
            fn action(&mut self) -> Result<bool, HandlerError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Failed("induced".into()))
            }
            fn name(&self) -> &str {
                "failing"
            }
        }

        let el = test_loop("failing-loop");
        el.start();
        let count = Arc::new(AtomicU32::new(0));
        el.add_handler(Box::new(Failing(Arc::clone(&count)))).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) > 3
        }));
        el.close();
    }

    #[test]
    fn test_worker_thread_uses_loop_name() {
        struct RecordThread(Arc<Mutex<Option<String>>>);
        impl EventHandler for RecordThread {
            fn action(&mut self) -> Result<bool, HandlerError> {
                *self.0.lock().unwrap() =
                    std::thread::current().name().map(|s| s.to_string());
                Err(HandlerError::Done)
            }
        }

        let el = test_loop("named-loop");
        el.start();
        let seen = Arc::new(Mutex::new(None));
        el.add_handler(Box::new(RecordThread(Arc::clone(&seen)))).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            seen.lock().unwrap().is_some()
        }));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("named-loop"));
        el.close();
    }

    #[test]
    fn test_lifecycle_sentinels() {
        let el = test_loop("lifecycle-loop");
        let handle = el.handle();

        assert_eq!(handle.loop_start_ms(), LOOP_QUIET);
        assert!(!el.is_alive());

        el.start();
        assert!(el.is_alive());
        assert!(wait_until(Duration::from_secs(5), || {
            handle.loop_start_ms() == LOOP_IDLE
        }));

        el.close();
        assert!(!el.is_alive());
        assert!(el.is_closed());
        assert_eq!(handle.loop_start_ms(), LOOP_TERMINATED);

        // idempotent
        el.close();
        assert!(el.is_closed());
    }

    #[test]
    fn test_add_after_close_hands_handler_back() {
        let el = test_loop("closed-loop");
        el.start();
        el.close();

        let count = Arc::new(AtomicU32::new(0));
        let err = el
            .add_handler(Box::new(Counting {
                count: Arc::clone(&count),
                limit: None,
            }))
            .unwrap_err();
        assert_eq!(err.into_handler().name(), "counting");
    }

    #[test]
    fn test_stop_is_prompt_with_busy_handler() {
        let el = test_loop("busy-loop");
        el.start();
        let count = Arc::new(AtomicU32::new(0));
        el.add_handler(Box::new(Counting {
            count: Arc::clone(&count),
            limit: None,
        }))
        .unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) > 0
        }));

        let start = Instant::now();
        el.close();
        assert!(start.elapsed() < Duration::from_secs(2));

        // no further invocations once the worker has exited
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }
}
