//! Protocol messages.
//!
//! A batch carries every message addressed to one destination object during an
//! epoch; the response batch is index-aligned with it.

use crate::activity::Activity;
use crate::error::TransportError;
use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One referencer-to-referenced message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcMessage {
    /// Referencer sending the message
    pub sender: ObjectId,
    /// Whether the sender agrees on `activity`
    pub consensus: bool,
    /// Sender's last activity
    pub activity: Activity,
}

impl fmt::Display for GcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = if self.consensus { "+" } else { "-" };
        write!(f, "{}{}:{}", flag, self.sender, self.activity)
    }
}

/// Answer to a [`GcMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcResponse {
    /// Activity the referenced object holds after merging the message
    pub consensus_activity: Activity,
    /// Whether the referenced object is connected to the activity owner
    pub has_parent: bool,
    /// The referenced object is terminating as cyclic garbage
    pub is_termination: bool,
}

impl GcResponse {
    /// Regular response
    pub fn new(consensus_activity: Activity, has_parent: bool) -> Self {
        Self {
            consensus_activity,
            has_parent,
            is_termination: false,
        }
    }

    /// Response announcing a cyclic termination
    pub fn termination(consensus_activity: Activity) -> Self {
        Self {
            consensus_activity,
            has_parent: false,
            is_termination: true,
        }
    }
}

/// Batch of messages for one destination object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcEnvelope {
    /// Destination object
    pub target: ObjectId,
    /// Ordered messages
    pub messages: Vec<GcMessage>,
}

/// Responses to a [`GcEnvelope`], in request order
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GcResponseBatch {
    /// Ordered responses
    pub responses: Vec<GcResponse>,
}

impl GcResponseBatch {
    /// Number of responses
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

/// Encode a value as JSON bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
    Ok(serde_json::to_vec(value)?)
}

/// Decode a value from JSON bytes
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, TransportError> {
    Ok(serde_json::from_slice(bytes)?)
}
