//! Outbound edges and the liveness tags proxies hold.
//!
//! Every local proxy of a remote object keeps a strong [`EdgeTag`] (through a
//! [`RemoteRef`]); the owning collector only keeps weak handles. Once the last
//! proxy drops its tag the edge is considered gone.

use crate::id::ObjectId;
use crate::wire::GcResponse;
use std::sync::{Arc, Weak};

/// Liveness token shared by the local proxies of one remote object
#[derive(Debug)]
pub struct EdgeTag {
    target: ObjectId,
}

impl EdgeTag {
    /// Create a tag for `target`
    pub fn new(target: ObjectId) -> Arc<Self> {
        Arc::new(Self { target })
    }

    /// Remote object this tag keeps referenced
    pub fn target(&self) -> ObjectId {
        self.target
    }
}

/// Strong handle a proxy keeps on its remote target.
///
/// Cloning shares the tag, so all clones count as a single holder.
#[derive(Debug, Clone)]
pub struct RemoteRef {
    tag: Arc<EdgeTag>,
}

impl RemoteRef {
    pub(crate) fn from_tag(tag: Arc<EdgeTag>) -> Self {
        Self { tag }
    }

    /// Remote object referenced
    pub fn target(&self) -> ObjectId {
        self.tag.target
    }

    /// The shared liveness tag
    pub fn tag(&self) -> &Arc<EdgeTag> {
        &self.tag
    }
}

/// A remote object referenced by the owning collector
#[derive(Debug)]
pub struct OutboundEdge {
    target: ObjectId,
    tags: Vec<Weak<EdgeTag>>,
    /// Strong hold until the first message for this edge is built
    first_hold: Option<Arc<EdgeTag>>,
    severed: bool,
    last_response: Option<GcResponse>,
}

impl OutboundEdge {
    pub(crate) fn new(tag: Arc<EdgeTag>) -> Self {
        Self {
            target: tag.target,
            tags: vec![Arc::downgrade(&tag)],
            first_hold: Some(tag),
            severed: false,
            last_response: None,
        }
    }

    /// Remote object this edge points to
    pub fn target(&self) -> ObjectId {
        self.target
    }

    /// Track one more tag for the same target
    pub(crate) fn attach(&mut self, tag: &Arc<EdgeTag>) {
        self.tags.retain(|w| w.strong_count() > 0);
        let weak = Arc::downgrade(tag);
        if !self.tags.iter().any(|w| w.ptr_eq(&weak)) {
            self.tags.push(weak);
        }
    }

    /// Whether `tag` is already tracked by this edge
    pub(crate) fn holds(&self, tag: &Arc<EdgeTag>) -> bool {
        let weak = Arc::downgrade(tag);
        self.tags.iter().any(|w| w.ptr_eq(&weak))
    }

    /// Whether some local proxy still holds this edge
    pub fn is_referenced(&self) -> bool {
        if self.severed {
            return false;
        }
        self.first_hold.is_some() || self.tags.iter().any(|w| w.strong_count() > 0)
    }

    /// A tag still held by some proxy, ignoring severing
    pub(crate) fn live_tag(&self) -> Option<Arc<EdgeTag>> {
        self.tags.iter().find_map(Weak::upgrade)
    }

    /// Treat the target as gone after a delivery failure
    pub(crate) fn sever(&mut self) {
        self.severed = true;
        self.first_hold = None;
    }

    /// Whether a delivery failure severed this edge
    pub fn is_severed(&self) -> bool {
        self.severed
    }

    /// Drop the strong hold once a message has been built
    pub(crate) fn release_first_hold(&mut self) {
        self.first_hold = None;
    }

    pub(crate) fn set_response(&mut self, response: GcResponse) {
        self.last_response = Some(response);
    }

    /// Last response received over this edge
    pub fn last_response(&self) -> Option<&GcResponse> {
        self.last_response.as_ref()
    }

    /// Whether the target announced a cyclic termination
    pub fn has_terminated(&self) -> bool {
        self.last_response.is_some_and(|r| r.is_termination)
    }
}
