//! Object and node identity.
//!
//! An [`ObjectId`] is stable for the lifetime of an active object and totally
//! ordered across the whole system. The ordering matters: it breaks ties
//! between activities carrying the same counter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a process (node) taking part in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identity of an active object.
///
/// Ordered by node first, then by the per-node sequence number. Sequence `0`
/// is reserved for the node's anonymous root set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Node hosting the object
    pub node: NodeId,
    /// Per-node sequence number
    pub seq: u64,
}

impl ObjectId {
    /// Create an object id
    pub const fn new(node: NodeId, seq: u64) -> Self {
        Self { node, seq }
    }

    /// Id of the anonymous root set of `node`
    pub const fn root_set(node: NodeId) -> Self {
        Self { node, seq: 0 }
    }

    /// Whether this id names a node's anonymous root set
    pub fn is_root_set(&self) -> bool {
        self.seq == 0
    }

    /// Whether the object lives on `node`
    pub fn is_on(&self, node: NodeId) -> bool {
        self.node == node
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.seq)
    }
}
