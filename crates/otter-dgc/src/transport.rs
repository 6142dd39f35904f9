//! Delivery of DGC messages.
//!
//! Messages produced by one epoch are grouped by destination object. Batches
//! for objects of this process are delivered synchronously and their
//! responses applied before `dispatch` returns. Batches for remote objects
//! are handed to a [`RemoteTransport`] on the send pool, with at most one
//! send in flight per destination.

use crate::collector::{Collector, Outgoing};
use crate::error::TransportError;
use crate::id::ObjectId;
use crate::pool::SendPool;
use crate::registry::Registry;
use crate::stats::DgcStats;
use crate::wire::{GcEnvelope, GcMessage, GcResponseBatch};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Network hook supplied by the host runtime.
///
/// `send_batch` is blocking and runs on a send-pool worker. The returned
/// batch must hold one response per message, in request order.
pub trait RemoteTransport: Send + Sync {
    fn send_batch(&self, envelope: &GcEnvelope) -> Result<GcResponseBatch, TransportError>;
}

/// Destinations with a send outstanding
#[derive(Default)]
struct InFlight {
    targets: Mutex<HashSet<ObjectId>>,
    drained: Condvar,
}

impl InFlight {
    fn try_claim(&self, target: ObjectId) -> bool {
        self.targets.lock().insert(target)
    }

    fn release(&self, target: ObjectId) {
        let mut targets = self.targets.lock();
        targets.remove(&target);
        if targets.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// What one call to [`Transport::dispatch`] did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub messages: usize,
    pub local_batches: usize,
    pub remote_batches: usize,
    pub dropped: usize,
    pub failed: usize,
}

struct Batch {
    origins: Vec<Arc<Collector>>,
    messages: Vec<GcMessage>,
}

/// Groups and delivers the messages of an epoch
pub struct Transport {
    registry: Arc<Registry>,
    remote: Option<Arc<dyn RemoteTransport>>,
    pool: SendPool,
    in_flight: Arc<InFlight>,
}

impl Transport {
    /// Transport delivering only to objects of `registry`'s node
    pub fn local(registry: Arc<Registry>) -> Self {
        Self::new(registry, None)
    }

    /// Transport using `remote` for objects on other nodes
    pub fn new(registry: Arc<Registry>, remote: Option<Arc<dyn RemoteTransport>>) -> Self {
        let pool = SendPool::new(registry.config().effective_send_idle_timeout());
        Self {
            registry,
            remote,
            pool,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Deliver the messages of one epoch.
    ///
    /// Each item pairs the sending collector with a message it built.
    pub fn dispatch(&self, outgoing: Vec<(Arc<Collector>, Outgoing)>) -> DispatchSummary {
        let mut summary = DispatchSummary {
            messages: outgoing.len(),
            ..Default::default()
        };
        let mut batches: BTreeMap<ObjectId, Batch> = BTreeMap::new();
        for (origin, out) in outgoing {
            let batch = batches.entry(out.target).or_insert_with(|| Batch {
                origins: Vec::new(),
                messages: Vec::new(),
            });
            batch.origins.push(origin);
            batch.messages.push(out.message);
        }

        let node = self.registry.node();
        for (target, batch) in batches {
            if target.is_on(node) {
                self.deliver_local(target, batch, &mut summary);
            } else {
                self.deliver_remote(target, batch, &mut summary);
            }
        }
        summary
    }

    fn deliver_local(&self, target: ObjectId, batch: Batch, summary: &mut DispatchSummary) {
        let stats = self.registry.stats();
        DgcStats::bump(&stats.local_batches, 1);
        summary.local_batches += 1;
        match self.registry.resolve(target) {
            Some(collector) => {
                let responses = collector.receive_batch(&batch.messages);
                apply(target, &batch.origins, Ok(responses), stats);
            }
            None => {
                debug!(target = %target, "local DGC target is gone");
                summary.failed += 1;
                apply(
                    target,
                    &batch.origins,
                    Err(TransportError::Unreachable(target)),
                    stats,
                );
            }
        }
    }

    fn deliver_remote(&self, target: ObjectId, batch: Batch, summary: &mut DispatchSummary) {
        let stats = self.registry.stats().clone();
        let Some(remote) = self.remote.clone() else {
            summary.failed += 1;
            apply(
                target,
                &batch.origins,
                Err(TransportError::NoRoute(target.node)),
                &stats,
            );
            return;
        };

        if !self.in_flight.try_claim(target) {
            warn!(target = %target, count = batch.messages.len(), "DGC send still in flight, dropping batch");
            DgcStats::bump(&stats.dropped_sends, 1);
            summary.dropped += 1;
            return;
        }

        DgcStats::bump(&stats.remote_batches, 1);
        summary.remote_batches += 1;
        let in_flight = self.in_flight.clone();
        let Batch { origins, messages } = batch;
        let envelope = GcEnvelope { target, messages };
        let job_origins = origins.clone();
        let job_stats = stats.clone();
        let submitted = self.pool.execute(move || {
            trace!(target = %target, count = envelope.messages.len(), "sending DGC batch");
            let result = remote.send_batch(&envelope);
            apply(target, &job_origins, result, &job_stats);
            in_flight.release(target);
        });

        if let Err(e) = submitted {
            warn!(target = %target, error = %e, "could not schedule DGC send");
            self.in_flight.release(target);
            summary.failed += 1;
            apply(
                target,
                &origins,
                Err(TransportError::Remote(e.to_string())),
                &stats,
            );
        }
    }

    /// Wait until no remote send is in flight. Returns `false` on timeout.
    pub fn quiesce(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut targets = self.in_flight.targets.lock();
        while !targets.is_empty() {
            if self
                .in_flight
                .drained
                .wait_until(&mut targets, deadline)
                .timed_out()
            {
                return targets.is_empty();
            }
        }
        true
    }

    /// Destinations with a send outstanding
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.targets.lock().len()
    }

    /// Registry this transport delivers into
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Send pool used for remote batches
    pub fn pool(&self) -> &SendPool {
        &self.pool
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("node", &self.registry.node())
            .field("remote", &self.remote.is_some())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// Hand responses back to the senders, or sever every edge of a failed batch
fn apply(
    target: ObjectId,
    origins: &[Arc<Collector>],
    result: Result<GcResponseBatch, TransportError>,
    stats: &DgcStats,
) {
    let result = result.and_then(|batch| {
        if batch.len() == origins.len() {
            Ok(batch)
        } else {
            Err(TransportError::ResponseMismatch {
                expected: origins.len(),
                actual: batch.len(),
            })
        }
    });

    match result {
        Ok(batch) => {
            for (origin, response) in origins.iter().zip(batch.responses) {
                origin.on_response(target, response);
            }
        }
        Err(e) => {
            debug!(target = %target, error = %e, "DGC send failed");
            DgcStats::bump(&stats.failed_sends, 1);
            for origin in origins {
                origin.on_send_failure(target);
            }
        }
    }
}
