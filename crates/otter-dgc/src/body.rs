//! Capability the host runtime exposes for each collected object.

use crate::error::TerminationError;

/// Narrow view of an active object.
///
/// Implemented by the actor runtime. `is_busy` is called with the collector's
/// lock held and must never block.
pub trait ActiveBody: Send + Sync {
    /// Executing a non-preemptible request, or the request queue is not idle
    fn is_busy(&self) -> bool;

    /// The object has not been terminated
    fn is_alive(&self) -> bool;

    /// Ask the runtime to stop the object. Best effort and asynchronous.
    fn request_termination(&self) -> Result<(), TerminationError>;
}
