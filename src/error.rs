use std::fmt;

use crate::handler::EventHandler;

/// Returned when a handler cannot be accepted because the target loop (or
/// the whole group) has been closed. The rejected handler is handed back to
/// the caller rather than silently dropped.
pub struct AddHandlerError(pub Box<dyn EventHandler>);

impl AddHandlerError {
    /// Recover the handler that was refused.
    pub fn into_handler(self) -> Box<dyn EventHandler> {
        self.0
    }
}

impl fmt::Debug for AddHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("AddHandlerError")
            .field(&self.0.name())
            .finish()
    }
}

impl fmt::Display for AddHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "cannot add handler {:?}: the event loop is closed",
            self.0.name()
        )
    }
}

impl std::error::Error for AddHandlerError {}
