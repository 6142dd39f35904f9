//! Process-level table of collectors.
//!
//! The registry is an explicit value owned by the host runtime and shared
//! (through an `Arc`) with the scheduler, the transport and every place that
//! creates proxies. It holds one [`Collector`] per registered active object
//! plus the process's [`AnonymousRootSet`].

use crate::body::ActiveBody;
use crate::clock::{SystemClock, TimeSource};
use crate::collector::{Collector, CollectorKind, Timing};
use crate::config::DgcConfig;
use crate::edge::{EdgeTag, RemoteRef};
use crate::error::{DgcError, DgcResult};
use crate::id::{NodeId, ObjectId};
use crate::root_set::AnonymousRootSet;
use crate::stats::DgcStats;
use crate::wire::{GcEnvelope, GcResponseBatch};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Collectors of one process
pub struct Registry {
    node: NodeId,
    config: DgcConfig,
    timing: Timing,
    clock: Arc<dyn TimeSource>,
    stats: Arc<DgcStats>,
    collectors: DashMap<ObjectId, Arc<Collector>>,
    root_set: AnonymousRootSet,
    next_seq: AtomicU64,
}

impl Registry {
    /// Create a registry for `node` using the wall clock
    pub fn new(node: NodeId, config: DgcConfig) -> Arc<Self> {
        Self::with_clock(node, config, Arc::new(SystemClock))
    }

    /// Create a registry with a custom time source
    pub fn with_clock(node: NodeId, config: DgcConfig, clock: Arc<dyn TimeSource>) -> Arc<Self> {
        let timing = Timing::from(&config);
        let stats = Arc::new(DgcStats::new());
        let root = Collector::new(
            ObjectId::root_set(node),
            CollectorKind::RootSet,
            timing,
            clock.clone(),
            stats.clone(),
        );
        Arc::new(Self {
            node,
            config,
            timing,
            clock,
            stats,
            collectors: DashMap::new(),
            root_set: AnonymousRootSet::new(Arc::new(root)),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Node this registry lives on
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Configuration in effect
    pub fn config(&self) -> &DgcConfig {
        &self.config
    }

    /// Whether the DGC is switched on
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Shared statistics
    pub fn stats(&self) -> &Arc<DgcStats> {
        &self.stats
    }

    /// Time source used by every collector
    pub fn clock(&self) -> &Arc<dyn TimeSource> {
        &self.clock
    }

    /// The process's anonymous root set
    pub fn root_set(&self) -> &AnonymousRootSet {
        &self.root_set
    }

    /// Allocate a fresh object id on this node
    pub fn next_object_id(&self) -> ObjectId {
        ObjectId::new(self.node, self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Start collecting an active object.
    ///
    /// Returns `None` when the DGC is disabled. Registering an id twice
    /// returns the existing collector.
    pub fn register(&self, id: ObjectId, body: Arc<dyn ActiveBody>) -> Option<Arc<Collector>> {
        if !self.is_enabled() {
            return None;
        }
        if id.is_root_set() {
            warn!(object = %id, "refusing to register an object over the root set id");
            return None;
        }
        let collector = self
            .collectors
            .entry(id)
            .or_insert_with(|| {
                debug!(object = %id, "collector registered");
                Arc::new(Collector::new(
                    id,
                    CollectorKind::Body(body),
                    self.timing,
                    self.clock.clone(),
                    self.stats.clone(),
                ))
            })
            .clone();
        Some(collector)
    }

    /// Stop collecting an object
    pub fn unregister(&self, id: ObjectId) -> Option<Arc<Collector>> {
        self.collectors.remove(&id).map(|(_, c)| c)
    }

    /// Collector of a registered active object
    pub fn collector(&self, id: ObjectId) -> Option<Arc<Collector>> {
        self.collectors.get(&id).map(|c| c.clone())
    }

    /// Collector for `id`, including the root set
    pub fn resolve(&self, id: ObjectId) -> Option<Arc<Collector>> {
        if id == self.root_set.id() {
            return Some(self.root_set.collector().clone());
        }
        self.collector(id)
    }

    /// Visit every registered collector (root set excluded)
    pub fn for_each_local_object(&self, mut f: impl FnMut(&Arc<Collector>)) {
        for collector in self.collectors() {
            f(&collector);
        }
    }

    /// Snapshot of the registered collectors, ordered by id
    pub fn collectors(&self) -> Vec<Arc<Collector>> {
        let mut all: Vec<Arc<Collector>> = self.collectors.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|c| c.id());
        all
    }

    /// Number of registered collectors
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Whether no collector is registered
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Track a proxy tag. `holder` is the active object holding the proxy,
    /// or `None` for plain code.
    pub fn register_outbound_reference(
        &self,
        holder: Option<ObjectId>,
        tag: &Arc<EdgeTag>,
    ) -> DgcResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let collector = self.holder(holder)?;
        collector.register_outbound_reference(tag);
        Ok(())
    }

    /// Hand out a proxy handle on `target` for `holder` (`None` for plain code)
    pub fn reference(&self, holder: Option<ObjectId>, target: ObjectId) -> DgcResult<RemoteRef> {
        if !self.is_enabled() {
            return Ok(RemoteRef::from_tag(EdgeTag::new(target)));
        }
        Ok(self.holder(holder)?.reference(target))
    }

    fn holder(&self, holder: Option<ObjectId>) -> DgcResult<Arc<Collector>> {
        match holder {
            None => Ok(self.root_set.collector().clone()),
            Some(id) => self.resolve(id).ok_or(DgcError::UnknownObject(id)),
        }
    }

    /// Handle an inbound batch addressed to a local object
    pub fn receive(&self, envelope: &GcEnvelope) -> DgcResult<GcResponseBatch> {
        if !self.is_enabled() {
            return Err(DgcError::Disabled);
        }
        let collector = self
            .resolve(envelope.target)
            .ok_or(DgcError::UnknownObject(envelope.target))?;
        Ok(collector.receive_batch(&envelope.messages))
    }

    /// Human readable status of one object, for diagnostics tooling
    pub fn log_status(&self, id: ObjectId) -> String {
        if !self.is_enabled() {
            return "DGC Disabled".to_string();
        }
        match self.resolve(id) {
            Some(collector) => format!("{}: {}", id, collector.status()),
            None => {
                warn!(object = %id, "object not found");
                "Object not found".to_string()
            }
        }
    }

    /// Drop collectors that finished or whose object died
    pub fn prune(&self) -> usize {
        let before = self.collectors.len();
        self.collectors.retain(|id, collector| {
            let keep = !collector.is_finished() && collector.is_alive();
            if !keep {
                debug!(object = %id, state = ?collector.finished_state(), "collector removed");
            }
            keep
        });
        before - self.collectors.len()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("node", &self.node)
            .field("enabled", &self.config.enabled)
            .field("collectors", &self.collectors.len())
            .finish()
    }
}
