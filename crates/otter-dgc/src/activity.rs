//! Lamport-style logical clock carried by every DGC message.
//!
//! An [`Activity`] is the most recent reachability-relevant event an object
//! knows about. Activities form a total order: higher counter wins, equal
//! counters are broken by the owner id.

use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Immutable (owner, counter) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Activity {
    owner: ObjectId,
    counter: u64,
}

impl Activity {
    /// Create an activity
    pub const fn new(owner: ObjectId, counter: u64) -> Self {
        Self { owner, counter }
    }

    /// Initial activity of a freshly created object
    pub const fn initial(owner: ObjectId) -> Self {
        Self { owner, counter: 0 }
    }

    /// Object that originated this activity
    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    /// Logical counter
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Strict "more recent than" test used when merging incoming activities.
    pub fn newer_than(&self, other: &Activity) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    /// Next activity, owned by `owner`.
    pub fn advance(&self, owner: ObjectId) -> Activity {
        Activity {
            owner,
            counter: self.counter + 1,
        }
    }

    /// Whether `id` originated this activity
    pub fn is_owned_by(&self, id: ObjectId) -> bool {
        self.owner == id
    }
}

impl Ord for Activity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.owner.cmp(&other.owner))
    }
}

impl PartialOrd for Activity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.owner)
    }
}
