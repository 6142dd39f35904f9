//! References held by code that is not an active object.
//!
//! Plain code holding a proxy does not get its own collector. All such
//! proxies are registered with one process-wide pseudo-object whose only job
//! is to keep their targets referenced: it never seeks consensus and never
//! decides to terminate.

use crate::collector::{Collector, Outgoing};
use crate::edge::{EdgeTag, RemoteRef};
use crate::id::ObjectId;
use std::sync::Arc;
use tracing::info;

/// The anonymous root set of a process
#[derive(Debug, Clone)]
pub struct AnonymousRootSet {
    collector: Arc<Collector>,
}

impl AnonymousRootSet {
    pub(crate) fn new(collector: Arc<Collector>) -> Self {
        debug_assert!(collector.is_root_set());
        Self { collector }
    }

    /// Id of the root set
    pub fn id(&self) -> ObjectId {
        self.collector.id()
    }

    /// Underlying collector
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Hand out a proxy handle on `target` held by plain code
    pub fn reference(&self, target: ObjectId) -> RemoteRef {
        self.collector.reference(target)
    }

    /// Track a proxy tag created by plain code
    pub fn register_outbound_reference(&self, tag: &Arc<EdgeTag>) {
        self.collector.register_outbound_reference(tag);
    }

    /// Messages keeping every live target referenced
    pub fn tick(&self) -> Option<Vec<Outgoing>> {
        self.collector.tick()
    }

    /// Whether any proxy is tracked, including ones not yet ticked
    pub fn is_busy(&self) -> bool {
        self.collector.is_busy()
    }

    /// Stop pinning remote objects. Used when the process tears down.
    pub fn shutdown(&self) {
        info!(object = %self.id(), "root set shutting down");
        self.collector.retire();
    }

    /// Whether [`shutdown`](Self::shutdown) ran
    pub fn is_shut_down(&self) -> bool {
        self.collector.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collector::{CollectorKind, Timing};
    use crate::id::NodeId;
    use crate::stats::DgcStats;
    use crate::wire::GcResponse;

    fn root_set(clock: &ManualClock) -> AnonymousRootSet {
        let collector = Collector::new(
            ObjectId::root_set(NodeId(1)),
            CollectorKind::RootSet,
            Timing {
                tta_ms: 500,
                required_consensus: 1,
            },
            Arc::new(clock.clone()),
            Arc::new(DgcStats::new()),
        );
        AnonymousRootSet::new(Arc::new(collector))
    }

    fn target(seq: u64) -> ObjectId {
        ObjectId::new(NodeId(2), seq)
    }

    #[test]
    fn test_never_seeks_consensus() {
        let clock = ManualClock::new(0);
        let roots = root_set(&clock);
        let _a = roots.reference(target(1));
        let _b = roots.reference(target(2));

        for _ in 0..10 {
            let out = roots.tick().unwrap();
            assert_eq!(out.len(), 2);
            assert!(out.iter().all(|o| !o.message.consensus));
            for o in &out {
                roots
                    .collector()
                    .on_response(o.target, GcResponse::new(o.message.activity, true));
            }
            clock.advance_ms(1_000);
        }
        assert!(!roots.is_shut_down());
        assert!(roots.is_busy());
    }

    #[test]
    fn test_dropped_references_stop_pinning() {
        let clock = ManualClock::new(0);
        let roots = root_set(&clock);
        let proxy = roots.reference(target(1));
        roots.tick();
        assert!(roots.is_busy());
        drop(proxy);
        assert_eq!(roots.tick(), Some(vec![]));
        assert!(!roots.is_busy());
        clock.advance_ms(10_000);
        assert_eq!(roots.tick(), Some(vec![]));
        assert!(!roots.is_shut_down());
    }

    #[test]
    fn test_busy_right_after_reference() {
        let clock = ManualClock::new(0);
        let roots = root_set(&clock);
        assert!(!roots.is_busy());
        let _proxy = roots.reference(target(1));
        assert!(roots.is_busy());
        assert!(roots.collector().referenced_ids().is_empty());
        assert_eq!(roots.tick().unwrap().len(), 1);
        assert!(roots.is_busy());
    }

    #[test]
    fn test_shutdown_clears_edges() {
        let clock = ManualClock::new(0);
        let roots = root_set(&clock);
        let _proxy = roots.reference(target(1));
        roots.tick();
        roots.shutdown();
        assert!(roots.is_shut_down());
        assert!(!roots.is_busy());
        assert!(roots.tick().is_none());
        roots.shutdown();
    }
}
