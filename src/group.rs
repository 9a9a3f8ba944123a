use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config;
use crate::error::AddHandlerError;
use crate::event_loop::EventLoop;
use crate::handler::{EventHandler, Priority};
use crate::monitor::{LoopBlockMonitor, PauserMonitor};
use crate::pauser::{LongPauser, Pauser};

/// Deterministic slot for a handler identity in a concurrent pool of
/// `width` loops. Folds the identity's high and mid bits into the low bits
/// before reduction, so identities that differ only in high bits still
/// spread across slots.
pub fn conc_slot(identity: u64, width: usize) -> usize {
    let mixed = (identity >> 23) ^ (identity >> 9) ^ identity;
    ((mixed & 0x7fff_ffff) % width as u64) as usize
}

/// The dispatcher: routes handlers to a fixed set of worker loops by their
/// declared [`Priority`] and owns the loops' lifecycle.
///
/// Three loops are eager: the **core** loop (priorities `High`, `Medium`,
/// `Timer`, `Daemon`), the **blocking** loop, and the **monitor** loop that
/// hosts the stall probes. The **replication** loop and each slot of the
/// **concurrent** pool are created lazily on first routing; by the time a
/// lazy loop is visible it is already started and has a [`LoopBlockMonitor`]
/// watching it.
///
/// Routing is a pure function of the handler's priority and (for
/// [`Priority::Concurrent`]) its identity; it never looks at queue depths or
/// load.
pub struct EventGroup {
    name: String,
    daemon: bool,
    binding: bool,
    /// The core loop's pauser, shared so `unpause()` can wake the core from
    /// any thread.
    pauser: Arc<dyn Pauser>,
    core: EventLoop,
    monitor: EventLoop,
    blocking: EventLoop,
    lazy: Mutex<LazyLoops>,
    started: AtomicBool,
    closed: AtomicBool,
}

struct LazyLoops {
    replication: Option<Arc<EventLoop>>,
    concurrent: Vec<Option<Arc<EventLoop>>>,
    /// Factory for the pausers handed to newly created concurrent loops.
    /// Replacing it affects only slots not yet created.
    conc_pauser_supplier: Box<dyn Fn() -> Arc<dyn Pauser> + Send>,
}

impl EventGroup {
    pub fn new(daemon: bool) -> Self {
        Self::with_name("", daemon, false)
    }

    /// `name` prefixes every loop (and thread) name. `binding` asks each
    /// core/replication/concurrent worker to pin itself to a CPU.
    pub fn with_name(name: &str, daemon: bool, binding: bool) -> Self {
        let pauser: Arc<dyn Pauser> = Arc::new(LongPauser::balanced());
        let core = EventLoop::new(
            &format!("{}core-event-loop", name),
            Arc::clone(&pauser),
            Duration::MAX,
            daemon,
            binding,
        );
        let monitor = EventLoop::new(
            &format!("{}monitor-event-loop", name),
            Arc::new(LongPauser::fixed(Duration::from_millis(100))),
            Duration::MAX,
            daemon,
            false,
        );
        let blocking = EventLoop::new(
            &format!("{}blocking-event-loop", name),
            Arc::new(LongPauser::balanced()),
            Duration::MAX,
            daemon,
            binding,
        );

        Self {
            name: name.to_string(),
            daemon,
            binding,
            pauser,
            core,
            monitor,
            blocking,
            lazy: Mutex::new(LazyLoops {
                replication: None,
                concurrent: (0..config::conc_threads()).map(|_| None).collect(),
                conc_pauser_supplier: Box::new(|| {
                    Arc::new(LongPauser::replication()) as Arc<dyn Pauser>
                }),
            }),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Route a handler to its loop. Exactly one loop receives it; for a
    /// closed group the handler is handed back unrun.
    pub fn add_handler(&self, handler: Box<dyn EventHandler>) -> Result<(), AddHandlerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AddHandlerError(handler));
        }
        match handler.priority() {
            Priority::High | Priority::Medium | Priority::Timer | Priority::Daemon => {
                self.core.add_handler(handler)
            }
            Priority::Monitor => self.monitor.add_handler(handler),
            Priority::Blocking => self.blocking.add_handler(handler),
            Priority::Replication => match self.replication_loop() {
                Some(replication) => replication.add_handler(handler),
                None => Err(AddHandlerError(handler)),
            },
            Priority::Concurrent => {
                let identity = handler.identity();
                match self.concurrent_loop_for(identity) {
                    Some(conc) => conc.add_handler(handler),
                    None => Err(AddHandlerError(handler)),
                }
            }
        }
    }

    /// Like [`add_handler`](Self::add_handler). The hint is ignored: every
    /// loop is a separate thread, so inline execution is never required.
    pub fn add_handler_with_hint(
        &self,
        _dont_run_inline: bool,
        handler: Box<dyn EventHandler>,
    ) -> Result<(), AddHandlerError> {
        self.add_handler(handler)
    }

    /// Start the eager loops. Idempotent. The core's stall probe is
    /// registered after both the core and the monitor are running; a probe
    /// observing the not-yet-started core reads the quiet sentinel, which is
    /// harmless.
    pub fn start(&self) {
        if self.core.is_alive() {
            return;
        }
        // two racing first starts must not both register the core's probe
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.start();
        self.blocking.start();
        self.monitor.start();

        self.add_probe(Box::new(LoopBlockMonitor::new(
            config::monitor_interval_ms(),
            self.core.handle(),
        )));
        self.add_probe(Box::new(PauserMonitor::new(
            Arc::clone(&self.pauser),
            &format!("{}core pauser", self.name),
            30,
        )));
    }

    /// Signal every owned loop to stop, monitor first, blocking last.
    /// Best-effort and prompt: in-flight handler steps are not waited for.
    pub fn stop(&self) {
        self.monitor.stop();
        {
            let lazy = self.lazy.lock().unwrap();
            if let Some(replication) = &lazy.replication {
                replication.stop();
            }
            for slot in lazy.concurrent.iter().flatten() {
                slot.stop();
            }
        }
        self.core.stop();
        self.blocking.stop();
    }

    /// Stop and close every owned loop. Idempotent; a failure closing one
    /// loop does not prevent closing the others.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        self.monitor.close();
        self.blocking.close();
        self.core.close();
        let lazy = self.lazy.lock().unwrap();
        if let Some(replication) = &lazy.replication {
            replication.close();
        }
        for slot in lazy.concurrent.iter().flatten() {
            slot.close();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.core.is_alive()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wake the core loop; the hot-path signal that new work is ready.
    pub fn unpause(&self) {
        self.pauser.unpause();
    }

    /// Replace the factory used to build pausers for concurrent loops. Must
    /// be called before the first `Concurrent` handler is routed; slots that
    /// already exist keep their pauser.
    pub fn set_conc_pauser_supplier(
        &self,
        supplier: impl Fn() -> Arc<dyn Pauser> + Send + 'static,
    ) {
        self.lazy.lock().unwrap().conc_pauser_supplier = Box::new(supplier);
    }

    /// The replication loop, created on first use. `None` once the group
    /// has been closed.
    fn replication_loop(&self) -> Option<Arc<EventLoop>> {
        let mut lazy = self.lazy.lock().unwrap();
        // re-checked under the lock: close() takes this lock after setting
        // the flag, so a creation racing close() either sees the flag here
        // or publishes the slot in time for close() to tear it down
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        if let Some(replication) = &lazy.replication {
            return Some(Arc::clone(replication));
        }

        let pauser: Arc<dyn Pauser> = Arc::new(LongPauser::replication());
        let replication = Arc::new(EventLoop::new(
            &format!("{}replication-event-loop", self.name),
            Arc::clone(&pauser),
            Duration::from_millis(config::replication_event_pause_time_ms()),
            // the replication loop is always daemon, regardless of the group
            true,
            self.binding,
        ));
        if !self.install_lazy(&replication, &pauser, &format!("{}replication pauser", self.name)) {
            return None;
        }
        lazy.replication = Some(Arc::clone(&replication));
        Some(replication)
    }

    /// The concurrent loop for this identity's slot, created on first use.
    /// `None` once the group has been closed.
    fn concurrent_loop_for(&self, identity: u64) -> Option<Arc<EventLoop>> {
        let mut lazy = self.lazy.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let slot = conc_slot(identity, lazy.concurrent.len());
        if let Some(existing) = &lazy.concurrent[slot] {
            return Some(Arc::clone(existing));
        }

        let pauser = (lazy.conc_pauser_supplier)();
        let conc = Arc::new(EventLoop::new(
            &format!("{}concurrent-event-loop-{}", self.name, slot),
            Arc::clone(&pauser),
            Duration::from_millis(config::replication_event_pause_time_ms()),
            self.daemon,
            self.binding,
        ));
        if !self.install_lazy(&conc, &pauser, &format!("{}concurrent pauser", self.name)) {
            return None;
        }
        lazy.concurrent[slot] = Some(Arc::clone(&conc));
        Some(conc)
    }

    /// Wire up a lazily created loop. The stall probe, the start and the
    /// pauser monitor all happen before the slot is published, so a handler
    /// that observes the slot also observes the monitoring. Returns false
    /// without starting the loop when the monitor refuses the stall probe;
    /// the caller must then leave the slot unpublished.
    fn install_lazy(
        &self,
        event_loop: &Arc<EventLoop>,
        pauser: &Arc<dyn Pauser>,
        pauser_desc: &str,
    ) -> bool {
        if !self.add_probe(Box::new(LoopBlockMonitor::new(
            config::replication_monitor_interval_ms(),
            event_loop.handle(),
        ))) {
            return false;
        }
        event_loop.start();
        // statistics only: losing this probe does not affect correctness
        self.add_probe(Box::new(PauserMonitor::new(
            Arc::clone(pauser),
            pauser_desc,
            60,
        )));
        true
    }

    /// A probe is only refused when the monitor loop is already gone; the
    /// refusal is logged and reported to the caller.
    fn add_probe(&self, probe: Box<dyn EventHandler>) -> bool {
        match self.monitor.add_handler(probe) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}monitor-event-loop rejected a probe: {}", self.name, e);
                false
            }
        }
    }
}

impl Drop for EventGroup {
    fn drop(&mut self) {
        self.close();
    }
}
