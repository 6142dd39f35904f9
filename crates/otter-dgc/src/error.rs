//! Error types for otter-dgc
//!
//! None of these escape to application code: the scheduler and transport log
//! them and carry on. They exist so each layer can report what went wrong.

use crate::collector::FinishedState;
use crate::id::{NodeId, ObjectId};
use thiserror::Error;

/// Errors raised by the collector, registry and engine
#[derive(Error, Debug)]
pub enum DgcError {
    /// A collector was finalized twice
    #[error("collector {id} was already finished ({state:?})")]
    AlreadyFinished {
        /// Collector that refused the second finalization
        id: ObjectId,
        /// State it had already reached
        state: FinishedState,
    },

    /// No local collector with this id
    #[error("no local collector for {0}")]
    UnknownObject(ObjectId),

    /// The DGC is switched off in this process
    #[error("distributed GC is disabled")]
    Disabled,

    /// Rejected configuration
    #[error("invalid DGC configuration: {0}")]
    InvalidConfig(String),

    /// The engine was shut down
    #[error("distributed GC is shut down")]
    ShutDown,

    /// Background thread could not be started
    #[error("failed to spawn DGC thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// Message delivery failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failures while delivering a batch of DGC messages
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O failure talking to the peer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Destination object could not be reached
    #[error("destination {0} is unreachable")]
    Unreachable(ObjectId),

    /// No remote transport configured for this node
    #[error("no route to node {0}")]
    NoRoute(NodeId),

    /// Response batch not aligned with the request batch
    #[error("expected {expected} responses, got {actual}")]
    ResponseMismatch {
        /// Number of messages sent
        expected: usize,
        /// Number of responses received
        actual: usize,
    },

    /// Envelope could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Peer reported an error while processing the batch
    #[error("remote error: {0}")]
    Remote(String),
}

/// Reported by the host when it cannot stop an object
#[derive(Error, Debug)]
pub enum TerminationError {
    /// Object is already inactive
    #[error("object is inactive")]
    Inactive,

    /// Termination request failed
    #[error("termination failed: {0}")]
    Failed(String),
}

impl From<DgcError> for TransportError {
    fn from(e: DgcError) -> Self {
        match e {
            DgcError::Transport(inner) => inner,
            DgcError::UnknownObject(id) => TransportError::Unreachable(id),
            other => TransportError::Remote(other.to_string()),
        }
    }
}

/// Result type alias for DGC operations
pub type DgcResult<T> = Result<T, DgcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_object_maps_to_unreachable() {
        let id = ObjectId::new(NodeId(3), 8);
        let err: TransportError = DgcError::UnknownObject(id).into();
        assert!(matches!(err, TransportError::Unreachable(got) if got == id));
    }

    #[test]
    fn test_messages() {
        let err = TransportError::ResponseMismatch {
            expected: 5,
            actual: 4,
        };
        assert_eq!(err.to_string(), "expected 5 responses, got 4");
        assert_eq!(
            DgcError::Disabled.to_string(),
            "distributed GC is disabled"
        );
    }
}
