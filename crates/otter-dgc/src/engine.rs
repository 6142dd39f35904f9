//! Entry point for host runtimes.
//!
//! [`Dgc`] bundles the registry, the transport and the background scheduler
//! of one process.
//!
//! # Example
//!
//! ```no_run
//! use otter_dgc::{Dgc, DgcConfig, NodeId};
//!
//! let dgc = Dgc::builder()
//!     .node(NodeId(1))
//!     .config(DgcConfig::new().enabled(true))
//!     .build()
//!     .unwrap();
//! dgc.start().unwrap();
//!
//! // register active objects, hand out proxies ...
//!
//! dgc.shutdown(std::time::Duration::from_secs(5));
//! ```

use crate::body::ActiveBody;
use crate::clock::{SystemClock, TimeSource};
use crate::collector::Collector;
use crate::config::DgcConfig;
use crate::edge::RemoteRef;
use crate::error::{DgcError, DgcResult};
use crate::id::{NodeId, ObjectId};
use crate::registry::Registry;
use crate::scheduler::{EpochReport, Scheduler, run_epoch};
use crate::stats::DgcStatsSnapshot;
use crate::transport::{RemoteTransport, Transport};
use crate::wire::{GcEnvelope, GcResponseBatch};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builder for creating a [`Dgc`]
pub struct DgcBuilder {
    node: NodeId,
    config: DgcConfig,
    clock: Arc<dyn TimeSource>,
    remote: Option<Arc<dyn RemoteTransport>>,
}

impl Default for DgcBuilder {
    fn default() -> Self {
        Self {
            node: NodeId(0),
            config: DgcConfig::default(),
            clock: Arc::new(SystemClock),
            remote: None,
        }
    }
}

impl DgcBuilder {
    /// Node this process runs as
    pub fn node(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    /// Protocol settings
    pub fn config(mut self, config: DgcConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source for protocol timestamps
    pub fn clock(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Transport used for objects on other nodes
    pub fn remote(mut self, remote: Arc<dyn RemoteTransport>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build the DGC. The configuration is checked only when enabled.
    pub fn build(self) -> DgcResult<Dgc> {
        if self.config.enabled {
            self.config.validate()?;
        }
        let registry = Registry::with_clock(self.node, self.config, self.clock);
        let transport = Arc::new(Transport::new(registry.clone(), self.remote));
        Ok(Dgc {
            registry,
            transport,
            scheduler: Mutex::new(None),
        })
    }
}

/// Distributed garbage collector of one process
pub struct Dgc {
    registry: Arc<Registry>,
    transport: Arc<Transport>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Dgc {
    /// Create a builder for custom configuration
    pub fn builder() -> DgcBuilder {
        DgcBuilder::default()
    }

    /// Build from the process environment
    pub fn from_env(node: NodeId) -> DgcResult<Self> {
        Self::builder().node(node).config(DgcConfig::from_env()?).build()
    }

    /// Whether the DGC is switched on
    pub fn is_enabled(&self) -> bool {
        self.registry.is_enabled()
    }

    /// Shared registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Message transport
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Get a snapshot of the statistics
    pub fn stats(&self) -> DgcStatsSnapshot {
        self.registry.stats().snapshot()
    }

    /// Start the background scheduler. Does nothing when disabled or
    /// already running.
    pub fn start(&self) -> DgcResult<()> {
        if !self.is_enabled() {
            debug!("DGC disabled, scheduler not started");
            return Ok(());
        }
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_none() {
            *scheduler = Some(Scheduler::start(self.transport.clone())?);
        }
        Ok(())
    }

    /// Whether the background scheduler runs
    pub fn is_running(&self) -> bool {
        self.scheduler.lock().as_ref().is_some_and(Scheduler::is_running)
    }

    /// Run one epoch on the calling thread
    pub fn run_epoch(&self) -> DgcResult<EpochReport> {
        if !self.is_enabled() {
            return Err(DgcError::Disabled);
        }
        Ok(run_epoch(&self.transport))
    }

    /// Start collecting an active object. `None` when disabled.
    pub fn register(&self, id: ObjectId, body: Arc<dyn ActiveBody>) -> Option<Arc<Collector>> {
        self.registry.register(id, body)
    }

    /// Allocate an id and register `body` under it
    pub fn spawn(&self, body: Arc<dyn ActiveBody>) -> (ObjectId, Option<Arc<Collector>>) {
        let id = self.registry.next_object_id();
        (id, self.register(id, body))
    }

    /// Hand out a proxy on `target` for `holder` (`None` for plain code)
    pub fn reference(&self, holder: Option<ObjectId>, target: ObjectId) -> DgcResult<RemoteRef> {
        self.registry.reference(holder, target)
    }

    /// Inbound entry point for envelopes received from other nodes
    pub fn receive(&self, envelope: &GcEnvelope) -> DgcResult<GcResponseBatch> {
        self.registry.receive(envelope)
    }

    /// Human readable status of one object
    pub fn log_status(&self, id: ObjectId) -> String {
        self.registry.log_status(id)
    }

    /// Stop collecting.
    ///
    /// Releases every reference held by plain code, stops the scheduler and
    /// waits up to `timeout` for outstanding sends. Returns `false` if sends
    /// were still in flight when the timeout expired.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if !self.is_enabled() {
            return true;
        }
        info!(node = %self.registry.node(), "DGC shutting down");
        self.registry.root_set().shutdown();
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
        let drained = self.transport.quiesce(timeout);
        if !drained {
            warn!(
                in_flight = self.transport.in_flight_count(),
                "DGC sends still in flight after shutdown timeout"
            );
        }
        drained
    }
}

impl Drop for Dgc {
    fn drop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.lock().take() {
            scheduler.shutdown();
        }
    }
}

impl std::fmt::Debug for Dgc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dgc")
            .field("registry", &self.registry)
            .field("running", &self.is_running())
            .finish()
    }
}
