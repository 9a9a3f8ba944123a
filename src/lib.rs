//! A multi-loop cooperative event scheduler for latency-sensitive workloads.
//!
//! Work is submitted as [`EventHandler`]s: small units that each perform one
//! short, non-blocking step per [`action()`](EventHandler::action) call. An
//! [`EventGroup`] dispatches every handler to exactly one of a small, fixed
//! set of single-threaded worker loops, chosen by the handler's declared
//! [`Priority`]:
//!
//! - `High`, `Medium`, `Timer` and `Daemon` handlers share the **core** loop;
//! - `Blocking` handlers, which are allowed to stall their thread, get a
//!   dedicated **blocking** loop;
//! - `Replication` handlers get a lazily created **replication** loop;
//! - `Concurrent` handlers are spread by their identity hash over a lazily
//!   populated pool of loops sized from the CPU count;
//! - `Monitor` handlers run on the **monitor** loop alongside the group's
//!   own probes.
//!
//! Within one loop, handlers are strictly serialized and never see
//! concurrency with each other; across loops everything runs in parallel.
//! An idle loop backs off through an adaptive [`Pauser`] (spin, then yield,
//! then park), and [`EventGroup::unpause`] is the cheap cross-thread signal
//! that new work is ready for the core loop.
//!
//! Liveness is watched rather than enforced: every worker publishes the
//! wall-clock millisecond at which its current handler step began, and a
//! [`LoopBlockMonitor`] probe on the monitor loop turns steps that never
//! return into diagnostic log dumps. There is no preemption and no
//! per-handler timeout; a handler that blocks its loop is reported, not
//! killed.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! use eventgroup::{EventGroup, EventHandler, HandlerError};
//!
//! struct Ticker(Arc<AtomicU32>);
//!
//! impl EventHandler for Ticker {
//!     fn action(&mut self) -> Result<bool, HandlerError> {
//!         if self.0.fetch_add(1, Ordering::Relaxed) + 1 == 10 {
//!             // a handler retires by reporting itself done
//!             return Err(HandlerError::Done);
//!         }
//!         Ok(true)
//!     }
//!
//!     fn name(&self) -> &str {
//!         "ticker"
//!     }
//! }
//!
//! let ticks = Arc::new(AtomicU32::new(0));
//! let group = EventGroup::new(false);
//! group.start();
//! group.add_handler(Box::new(Ticker(Arc::clone(&ticks)))).unwrap();
//!
//! while ticks.load(Ordering::Relaxed) < 10 {
//!     std::thread::yield_now();
//! }
//! group.close();
//! ```

mod affinity;
pub mod config;
mod error;
mod event_loop;
mod group;
mod handler;
mod monitor;
mod pauser;

pub use error::AddHandlerError;
pub use event_loop::{EventLoop, LoopHandle, LOOP_IDLE, LOOP_QUIET, LOOP_TERMINATED};
pub use group::{conc_slot, EventGroup};
pub use handler::{EventHandler, HandlerError, Priority};
pub use monitor::{LoopBlockMonitor, PauserMonitor};
pub use pauser::{LongPauser, PauseStats, Pauser};
