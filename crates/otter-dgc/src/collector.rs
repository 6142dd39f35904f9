//! Per-object protocol engine.
//!
//! Each collected object owns one [`Collector`]. Once per epoch the scheduler
//! calls [`Collector::tick`], which refreshes the object's view of its
//! referencers and referenced objects, decides whether the object is garbage,
//! and produces one message per outbound edge. Inbound messages go through
//! [`Collector::receive_batch`].
//!
//! ## Termination
//!
//! - **Acyclic**: no referencer has been heard from for longer than TTA.
//! - **Cyclic**: the object owns the current activity and every referencer
//!   agrees on it, meaning the activity went all the way around a cycle with
//!   no live root adding a newer one. The decision is then announced to the
//!   referencers for up to TTA before the object goes away.
//!
//! All state sits behind one lock; no I/O happens while it is held.

use crate::activity::Activity;
use crate::body::ActiveBody;
use crate::clock::TimeSource;
use crate::config::DgcConfig;
use crate::edge::{EdgeTag, OutboundEdge, RemoteRef};
use crate::error::{DgcError, DgcResult};
use crate::id::ObjectId;
use crate::peer::PeerRecord;
use crate::stats::DgcStats;
use crate::wire::{GcMessage, GcResponse, GcResponseBatch};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Whether a collector terminated, and why
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedState {
    /// Still taking part in the protocol
    NotFinished,
    /// No referencer left
    Acyclic,
    /// Part of an unreachable cycle
    Cyclic,
}

/// Timing parameters copied out of [`DgcConfig`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    pub tta_ms: i64,
    pub required_consensus: u32,
}

impl From<&DgcConfig> for Timing {
    fn from(config: &DgcConfig) -> Self {
        Self {
            tta_ms: config.tta_ms(),
            required_consensus: config.required_consensus.max(1),
        }
    }
}

pub(crate) enum CollectorKind {
    /// A regular active object
    Body(Arc<dyn ActiveBody>),
    /// The anonymous root set of the process
    RootSet,
}

impl CollectorKind {
    fn label(&self) -> &'static str {
        match self {
            CollectorKind::Body(_) => "body",
            CollectorKind::RootSet => "root",
        }
    }
}

/// A message produced by a tick, addressed to one outbound edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing {
    /// Referenced object
    pub target: ObjectId,
    /// Message for it
    pub message: GcMessage,
}

/// Diagnostic view of a collector
#[derive(Debug, Clone)]
pub struct CollectorSnapshot {
    pub id: ObjectId,
    pub finished: FinishedState,
    pub last_activity: Activity,
    pub parent: Option<ObjectId>,
    pub referencers: Vec<ObjectId>,
    pub referenced: Vec<ObjectId>,
    pub consensus_streak: u32,
    pub cycle_pending: bool,
    pub pinned: bool,
    pub iterations: u64,
}

/// Result of a locked operation, acted upon once the lock is released
#[derive(Debug, Default)]
struct Outcome {
    finished: Option<FinishedState>,
}

struct CollectorState {
    pinned: bool,
    finished: FinishedState,
    iterations: u64,
    last_activity: Activity,
    /// Target of the outbound edge leading towards the activity owner
    parent: Option<ObjectId>,
    consensus_streak: u32,
    outbound: BTreeMap<ObjectId, OutboundEdge>,
    /// Tags registered since the last tick
    staged: Vec<Arc<EdgeTag>>,
    inbound: BTreeMap<ObjectId, PeerRecord>,
    alone_since_ms: i64,
    cycle_detected_at_ms: Option<i64>,
    previously_busy: bool,
}

impl CollectorState {
    fn new(id: ObjectId, now_ms: i64) -> Self {
        Self {
            pinned: false,
            finished: FinishedState::NotFinished,
            iterations: 0,
            last_activity: Activity::initial(id),
            parent: None,
            consensus_streak: 0,
            outbound: BTreeMap::new(),
            staged: Vec::new(),
            inbound: BTreeMap::new(),
            alone_since_ms: now_ms,
            cycle_detected_at_ms: None,
            previously_busy: true,
        }
    }

    fn is_finished(&self) -> bool {
        self.finished != FinishedState::NotFinished
    }

    fn set_last_activity(&mut self, activity: Activity) {
        debug_assert!(activity >= self.last_activity);
        self.last_activity = activity;
        self.consensus_streak = 0;
        self.parent = None;
    }

    fn advance(&mut self, id: ObjectId) {
        let next = self.last_activity.advance(id);
        self.set_last_activity(next);
    }

    fn finish(&mut self, id: ObjectId, state: FinishedState) -> DgcResult<()> {
        if self.is_finished() {
            return Err(DgcError::AlreadyFinished {
                id,
                state: self.finished,
            });
        }
        self.finished = state;
        Ok(())
    }

    /// Record the busy state; leaving the busy state is an activity.
    fn note_busy(&mut self, id: ObjectId, busy: bool) {
        if self.previously_busy && !busy {
            self.advance(id);
        }
        self.previously_busy = busy;
    }

    fn purge_referencers(&mut self, id: ObjectId, now_ms: i64, tta_ms: i64) {
        let before = self.inbound.len();
        self.inbound.retain(|_, peer| !peer.is_stale(now_ms, tta_ms));
        let removed = before - self.inbound.len();
        if removed > 0 {
            debug!(object = %id, removed, "removed silent referencers");
            self.advance(id);
            if self.inbound.is_empty() {
                self.alone_since_ms = now_ms;
            }
        }
    }

    /// Tracked or staged outbound references
    fn holds_references(&self) -> bool {
        !self.outbound.is_empty() || !self.staged.is_empty()
    }

    fn promote_staged(&mut self) {
        for tag in std::mem::take(&mut self.staged) {
            match self.outbound.get_mut(&tag.target()) {
                Some(edge) => edge.attach(&tag),
                None => {
                    self.outbound.insert(tag.target(), OutboundEdge::new(tag));
                }
            }
        }
    }

    /// Drop edges no proxy holds anymore. A severed edge whose tag is still
    /// held is staged again, so it gets a fresh start next tick.
    fn purge_referenced(&mut self, id: ObjectId) {
        let dead: Vec<ObjectId> = self
            .outbound
            .iter()
            .filter(|(_, edge)| !edge.is_referenced())
            .map(|(target, _)| *target)
            .collect();
        if dead.is_empty() {
            return;
        }
        for target in &dead {
            if let Some(edge) = self.outbound.remove(target)
                && edge.is_severed()
                && let Some(tag) = edge.live_tag()
            {
                self.staged.push(tag);
            }
        }
        debug!(object = %id, removed = ?dead, "removed referenced");
        self.advance(id);
    }

    fn all_referencers_notified(&self) -> bool {
        self.inbound.values().all(PeerRecord::notified_of_cycle)
    }

    fn all_referencers_agree(&self) -> bool {
        self.inbound
            .values()
            .all(|peer| peer.agrees_on(&self.last_activity))
    }

    /// Decide whether the object is garbage. Only called while idle.
    fn check_consensus(
        &mut self,
        id: ObjectId,
        now_ms: i64,
        timing: Timing,
    ) -> (Option<String>, Option<FinishedState>) {
        if let Some(detected_at) = self.cycle_detected_at_ms {
            if now_ms - detected_at > timing.tta_ms {
                return (
                    Some("had the time to propagate the cycle to referencers".into()),
                    Some(FinishedState::Cyclic),
                );
            }
            if self.all_referencers_notified() {
                return (
                    Some("every known referencer was notified of the cycle".into()),
                    Some(FinishedState::Cyclic),
                );
            }
            return (None, None);
        }

        if let Some(edge) = self.outbound.values().find(|edge| edge.has_terminated()) {
            let goodbye = format!(
                "notified of garbage cycle from {} at {}",
                edge.target(),
                self.last_activity
            );
            self.cycle_detected_at_ms = Some(now_ms);
            return (Some(goodbye), None);
        }

        if self.inbound.is_empty() {
            if now_ms - self.alone_since_ms > timing.tta_ms {
                return (
                    Some("no more known referencers".into()),
                    Some(FinishedState::Acyclic),
                );
            }
            return (None, None);
        }

        if !self.last_activity.is_owned_by(id) || !self.all_referencers_agree() {
            return (None, None);
        }

        self.consensus_streak += 1;
        if self.consensus_streak < timing.required_consensus {
            let streak = self.consensus_streak;
            self.advance(id);
            self.consensus_streak = streak;
            trace!(object = %id, streak, "consensus round reached, starting another");
            return (None, None);
        }

        self.cycle_detected_at_ms = Some(now_ms);
        (
            Some(format!("detected garbage cycle at {}", self.last_activity)),
            None,
        )
    }

    fn build_message(&self, id: ObjectId, target: ObjectId, busy: bool, seek: bool) -> GcMessage {
        let mut consensus = false;
        if seek && !busy {
            let is_mine = self.last_activity.is_owned_by(id);
            let agreed = self.outbound.get(&target).and_then(|e| e.last_response()).is_some_and(
                |resp| resp.consensus_activity == self.last_activity,
            );
            if agreed && (is_mine || self.parent.is_some()) {
                consensus = self.parent != Some(target) || self.all_referencers_agree();
            }
        }
        GcMessage {
            sender: id,
            consensus,
            activity: self.last_activity,
        }
    }

    fn broadcast(&mut self, id: ObjectId, busy: bool, seek: bool) -> Vec<Outgoing> {
        let targets: Vec<ObjectId> = self.outbound.keys().copied().collect();
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            let message = self.build_message(id, target, busy, seek);
            if let Some(edge) = self.outbound.get_mut(&target) {
                edge.release_first_hold();
            }
            out.push(Outgoing { target, message });
        }
        out
    }

    fn receive_one(&mut self, id: ObjectId, msg: &GcMessage, now_ms: i64) -> (GcResponse, Outcome) {
        let mut outcome = Outcome::default();
        let mut response = None;

        if self.cycle_detected_at_ms.is_some() {
            trace!(object = %id, sender = %msg.sender, "answering with cycle notification");
            match self.inbound.get_mut(&msg.sender) {
                Some(peer) => peer.set_notified_of_cycle(),
                None => {
                    error!(object = %id, sender = %msg.sender, "cycle notification to a newcomer");
                    let mut peer = PeerRecord::new(now_ms);
                    peer.set_notified_of_cycle();
                    self.inbound.insert(msg.sender, peer);
                }
            }
            if !self.is_finished() && self.all_referencers_notified() {
                info!(object = %id, "notified cycle to every known referencer");
                if self.finish(id, FinishedState::Cyclic).is_ok() {
                    outcome.finished = Some(FinishedState::Cyclic);
                }
            }
            response = Some(GcResponse::termination(self.last_activity));
        } else if self.finished == FinishedState::Acyclic {
            error!(
                object = %id,
                message = %msg,
                "thought it was alone but received a DGC message"
            );
        }

        if msg.activity.newer_than(&self.last_activity) {
            self.set_last_activity(msg.activity);
        }
        let response = response.unwrap_or_else(|| {
            GcResponse::new(
                self.last_activity,
                self.parent.is_some() || self.last_activity.is_owned_by(id),
            )
        });

        let peer = self.inbound.entry(msg.sender).or_insert_with(|| {
            debug!(object = %id, sender = %msg.sender, "new referencer");
            PeerRecord::new(now_ms)
        });
        peer.record(msg.consensus, response.consensus_activity, now_ms);
        (response, outcome)
    }

    fn on_response(&mut self, id: ObjectId, target: ObjectId, response: GcResponse) {
        let Some(edge) = self.outbound.get_mut(&target) else {
            return;
        };
        edge.set_response(response);

        if self.parent == Some(target) && response.consensus_activity != self.last_activity {
            self.parent = None;
        }
        if self.parent.is_none()
            && response.has_parent
            && response.consensus_activity == self.last_activity
            && !self.last_activity.is_owned_by(id)
        {
            self.parent = Some(target);
        }
    }
}

/// Protocol engine for one collected object
pub struct Collector {
    id: ObjectId,
    kind: CollectorKind,
    timing: Timing,
    clock: Arc<dyn TimeSource>,
    stats: Arc<DgcStats>,
    state: Mutex<CollectorState>,
}

impl Collector {
    pub(crate) fn new(
        id: ObjectId,
        kind: CollectorKind,
        timing: Timing,
        clock: Arc<dyn TimeSource>,
        stats: Arc<DgcStats>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            id,
            kind,
            timing,
            clock,
            stats,
            state: Mutex::new(CollectorState::new(id, now)),
        }
    }

    /// Id of the collected object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether this is the process's anonymous root set
    pub fn is_root_set(&self) -> bool {
        matches!(self.kind, CollectorKind::RootSet)
    }

    /// Whether the collector reached a decision
    pub fn is_finished(&self) -> bool {
        self.state.lock().is_finished()
    }

    /// Current decision
    pub fn finished_state(&self) -> FinishedState {
        self.state.lock().finished
    }

    /// Latest activity known to the object
    pub fn last_activity(&self) -> Activity {
        self.state.lock().last_activity
    }

    /// Whether the underlying object still exists
    pub fn is_alive(&self) -> bool {
        match &self.kind {
            CollectorKind::Body(body) => body.is_alive(),
            CollectorKind::RootSet => !self.is_finished(),
        }
    }

    /// Pin or unpin the object. A pinned object is always busy.
    pub fn set_pinned(&self, pinned: bool) {
        self.state.lock().pinned = pinned;
    }

    /// Record an event on the object
    pub fn advance_activity(&self) {
        self.state.lock().advance(self.id);
    }

    /// Track a proxy tag held by this object.
    ///
    /// The edge is staged and only becomes a tracked edge on the next tick,
    /// which guarantees it is sent at least one message.
    pub fn register_outbound_reference(&self, tag: &Arc<EdgeTag>) {
        let target = tag.target();
        if target == self.id {
            return;
        }
        let mut st = self.state.lock();
        let known = st.outbound.get(&target).is_some_and(|edge| edge.holds(tag))
            || st.staged.iter().any(|t| Arc::ptr_eq(t, tag));
        if !known {
            debug!(object = %self.id, target = %target, "new referenced");
            st.staged.push(tag.clone());
        }
    }

    /// Hand out a proxy handle on `target`, sharing the existing tag if any
    pub fn reference(&self, target: ObjectId) -> RemoteRef {
        if target != self.id {
            let st = self.state.lock();
            let existing = st
                .outbound
                .get(&target)
                .filter(|edge| !edge.is_severed())
                .and_then(OutboundEdge::live_tag)
                .or_else(|| st.staged.iter().find(|t| t.target() == target).cloned());
            if let Some(tag) = existing {
                return RemoteRef::from_tag(tag);
            }
        }
        let tag = EdgeTag::new(target);
        self.register_outbound_reference(&tag);
        RemoteRef::from_tag(tag)
    }

    fn current_busy(&self, st: &CollectorState) -> bool {
        if st.pinned {
            return true;
        }
        match &self.kind {
            CollectorKind::Body(body) => body.is_busy(),
            CollectorKind::RootSet => st.holds_references(),
        }
    }

    /// Busy state as the next tick would see it.
    ///
    /// Pinned objects are busy. A body reports its own state and the root
    /// set is busy while it holds any reference, staged ones included.
    pub fn is_busy(&self) -> bool {
        let st = self.state.lock();
        self.current_busy(&st)
    }

    /// Run one protocol round.
    ///
    /// Returns the messages to send, or `None` when the object finished,
    /// died, or is waiting to announce a cycle.
    pub fn tick(&self) -> Option<Vec<Outgoing>> {
        if let CollectorKind::Body(body) = &self.kind
            && !body.is_alive()
        {
            return None;
        }

        let now = self.clock.now_ms();
        let mut outcome = Outcome::default();
        let messages = {
            let mut st = self.state.lock();
            if st.is_finished() {
                return None;
            }
            st.iterations += 1;

            let busy = self.current_busy(&st);
            st.note_busy(self.id, busy);
            st.purge_referencers(self.id, now, self.timing.tta_ms);
            st.promote_staged();
            st.purge_referenced(self.id);

            let seek = !self.is_root_set();
            if seek && !busy {
                let (goodbye, finished) = st.check_consensus(self.id, now, self.timing);
                if let Some(state) = finished
                    && st.finish(self.id, state).is_ok()
                {
                    outcome.finished = Some(state);
                }
                if let Some(reason) = goodbye {
                    info!(
                        object = %self.id,
                        kind = self.kind.label(),
                        iterations = st.iterations,
                        "goodbye because: {reason}"
                    );
                }
            }

            if st.is_finished() || st.cycle_detected_at_ms.is_some() {
                None
            } else {
                let out = st.broadcast(self.id, busy, seek);
                trace!(
                    object = %self.id,
                    kind = self.kind.label(),
                    count = out.len(),
                    "sending DGC messages"
                );
                Some(out)
            }
        };

        self.settle(outcome);
        if let Some(out) = &messages {
            DgcStats::bump(&self.stats.messages, out.len() as u64);
        }
        messages
    }

    /// Process a batch of inbound messages, answering each in order
    pub fn receive_batch(&self, messages: &[GcMessage]) -> GcResponseBatch {
        let now = self.clock.now_ms();
        let mut responses = Vec::with_capacity(messages.len());
        let mut outcome = Outcome::default();
        {
            let mut st = self.state.lock();
            for msg in messages {
                let (response, step) = st.receive_one(self.id, msg, now);
                if step.finished.is_some() {
                    outcome = step;
                }
                responses.push(response);
            }
            trace!(object = %self.id, count = messages.len(), status = %Status::of(&st, None), "processed DGC messages");
        }
        self.settle(outcome);
        GcResponseBatch { responses }
    }

    /// Process one inbound message
    pub fn receive(&self, message: &GcMessage) -> GcResponse {
        let batch = self.receive_batch(std::slice::from_ref(message));
        batch.responses[0]
    }

    /// Store the response to a message sent over the edge to `target`
    pub fn on_response(&self, target: ObjectId, response: GcResponse) {
        self.state.lock().on_response(self.id, target, response);
    }

    /// Delivery to `target` failed; assume it is gone
    pub fn on_send_failure(&self, target: ObjectId) {
        let mut st = self.state.lock();
        if let Some(edge) = st.outbound.get_mut(&target) {
            debug!(object = %self.id, target = %target, "severing edge after failed send");
            edge.sever();
        }
    }

    /// Mark the collector finished. Fails if it already was.
    pub(crate) fn finalize(&self, state: FinishedState) -> DgcResult<()> {
        self.state.lock().finish(self.id, state)
    }

    /// Stop taking part in the protocol and forget every edge
    pub(crate) fn retire(&self) {
        let mut st = self.state.lock();
        if !st.is_finished() {
            st.finished = FinishedState::Acyclic;
        }
        st.outbound.clear();
        st.staged.clear();
        st.parent = None;
    }

    fn settle(&self, outcome: Outcome) {
        let Some(state) = outcome.finished else {
            return;
        };
        match state {
            FinishedState::Acyclic => DgcStats::bump(&self.stats.acyclic, 1),
            FinishedState::Cyclic => DgcStats::bump(&self.stats.cyclic, 1),
            FinishedState::NotFinished => {}
        }
        if let CollectorKind::Body(body) = &self.kind
            && let Err(e) = body.request_termination()
        {
            debug!(object = %self.id, error = %e, "termination request ignored");
        }
    }

    /// "busy|idle <activity> from <parent>"
    pub fn status(&self) -> String {
        let st = self.state.lock();
        let busy = self.current_busy(&st);
        Status::of(&st, Some(busy)).to_string()
    }

    /// Ids of the referenced objects
    pub fn referenced_ids(&self) -> Vec<ObjectId> {
        self.state.lock().outbound.keys().copied().collect()
    }

    /// Last response received from `target`, if the edge is tracked
    pub fn edge_response(&self, target: ObjectId) -> Option<GcResponse> {
        let st = self.state.lock();
        st.outbound.get(&target).and_then(|e| e.last_response().copied())
    }

    /// Whether the edge to `target` is tracked
    pub fn has_edge(&self, target: ObjectId) -> bool {
        self.state.lock().outbound.contains_key(&target)
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> CollectorSnapshot {
        let st = self.state.lock();
        CollectorSnapshot {
            id: self.id,
            finished: st.finished,
            last_activity: st.last_activity,
            parent: st.parent,
            referencers: st.inbound.keys().copied().collect(),
            referenced: st.outbound.keys().copied().collect(),
            consensus_streak: st.consensus_streak,
            cycle_pending: st.cycle_detected_at_ms.is_some(),
            pinned: st.pinned,
            iterations: st.iterations,
        }
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("id", &self.id)
            .field("kind", &self.kind.label())
            .finish()
    }
}

struct Status<'a> {
    st: &'a CollectorState,
    busy: Option<bool>,
}

impl<'a> Status<'a> {
    fn of(st: &'a CollectorState, busy: Option<bool>) -> Self {
        Self { st, busy }
    }
}

impl fmt::Display for Status<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let busy = self.busy.unwrap_or(self.st.previously_busy);
        let state = if busy { "busy" } else { "idle" };
        match self.st.parent {
            Some(parent) => write!(f, "{} {} from {}", state, self.st.last_activity, parent),
            None => write!(f, "{} {} from none", state, self.st.last_activity),
        }
    }
}
