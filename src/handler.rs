use std::fmt;

/// Routing priority declared by a handler. The group maps each priority to
/// exactly one of its worker loops; see [`EventGroup`](crate::EventGroup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Medium,
    Timer,
    Daemon,
    /// Probes hosted by the monitor loop.
    Monitor,
    /// Work that is allowed to block its thread.
    Blocking,
    Replication,
    /// Work spread across the concurrent pool by handler identity.
    Concurrent,
}

/// Why a handler invocation did not complete normally.
#[derive(Debug)]
pub enum HandlerError {
    /// The handler is finished and must be removed from its loop. The loop
    /// drops it quietly; this is the normal way for a handler to retire.
    Done,
    /// The handler failed but stays registered. The hosting loop logs the
    /// failure and keeps running it.
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Done => write!(f, "handler is done"),
            HandlerError::Failed(e) => write!(f, "handler failed: {}", e),
        }
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandlerError::Done => None,
            HandlerError::Failed(e) => Some(&**e),
        }
    }
}

/// One unit of cooperative work. An event loop invokes `action()` over and
/// over; each call must perform one short, non-blocking step and return.
///
/// Handlers on the same loop are strictly serialized and never see
/// concurrency with each other; handlers on different loops run in parallel
/// and must assume no mutual exclusion.
pub trait EventHandler: Send {
    /// Run one step. `Ok(true)` reports that useful work was done, which
    /// keeps the hosting loop from backing off.
    fn action(&mut self) -> Result<bool, HandlerError>;

    /// The loop this handler wants to run on. Stable for the handler's
    /// lifetime.
    fn priority(&self) -> Priority {
        Priority::Medium
    }

    /// A stable value hashed to pick a slot in the concurrent pool. Only
    /// consulted for [`Priority::Concurrent`] handlers; collisions are
    /// tolerated (colliding handlers share a loop).
    fn identity(&self) -> u64 {
        0
    }

    /// Short name used in stall dumps and log messages.
    fn name(&self) -> &str {
        "unnamed"
    }
}
