//! Periodic driver of the protocol.
//!
//! One background thread runs an epoch every TTB: tick every local
//! collector plus the root set, deliver what they produced, then drop the
//! collectors that are done. The first epoch is delayed by a random jitter so
//! processes started together do not tick in lockstep.

use crate::error::{DgcError, DgcResult};
use crate::stats::DgcStats;
use crate::transport::{DispatchSummary, Transport};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rand::Rng;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// What one epoch did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EpochReport {
    /// Collectors ticked, root set included
    pub ticked: usize,
    /// Collectors that produced no messages because they are done or waiting
    pub silent: usize,
    /// Delivery results
    pub dispatch: DispatchSummary,
    /// Collectors removed from the registry afterwards
    pub pruned: usize,
}

/// Run one protocol epoch synchronously
pub fn run_epoch(transport: &Transport) -> EpochReport {
    let registry = transport.registry();
    let mut report = EpochReport::default();
    let mut outgoing = Vec::new();

    registry.for_each_local_object(|collector| {
        report.ticked += 1;
        match collector.tick() {
            Some(out) => outgoing.extend(out.into_iter().map(|o| (collector.clone(), o))),
            None => report.silent += 1,
        }
    });

    let root_set = registry.root_set();
    report.ticked += 1;
    match root_set.tick() {
        Some(out) => {
            let root = root_set.collector();
            outgoing.extend(out.into_iter().map(|o| (root.clone(), o)));
        }
        None => report.silent += 1,
    }

    report.dispatch = transport.dispatch(outgoing);
    report.pruned = registry.prune();
    DgcStats::bump(&registry.stats().epochs, 1);
    trace!(
        ticked = report.ticked,
        messages = report.dispatch.messages,
        pruned = report.pruned,
        "DGC epoch done"
    );
    report
}

/// Handle on the background scheduling thread
pub struct Scheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn the scheduling thread
    pub fn start(transport: Arc<Transport>) -> DgcResult<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("otter-dgc-scheduler".to_string())
            .spawn(move || run_scheduler(transport, stop_rx))
            .map_err(DgcError::Spawn)?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for the current epoch to end
    pub fn shutdown(&mut self) {
        // Dropping the sender wakes the thread with `Disconnected`.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("DGC scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Sleep for `timeout`; true when asked to stop
fn stop_requested(stop_rx: &Receiver<()>, timeout: Duration) -> bool {
    match stop_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

fn startup_jitter(ttb: Duration) -> Duration {
    let ttb_ms = ttb.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..ttb_ms))
}

/// Deadline of the epoch after the one due at `next`.
///
/// Epochs stay on a fixed grid of `ttb` steps. When `now` is already past the
/// following step, the grid restarts at `now` and the overrun is returned.
fn next_deadline(next: Instant, now: Instant, ttb: Duration) -> (Instant, Option<Duration>) {
    let next = next + ttb;
    if now > next {
        (now, Some(now - next))
    } else {
        (next, None)
    }
}

fn run_scheduler(transport: Arc<Transport>, stop_rx: Receiver<()>) {
    let config = transport.registry().config().clone();
    let stats = transport.registry().stats().clone();
    let ttb = config.ttb;

    let jitter = if config.startup_jitter {
        startup_jitter(ttb)
    } else {
        Duration::ZERO
    };
    info!(
        ttb_ms = config.ttb_ms(),
        tta_ms = config.tta_ms(),
        jitter_ms = jitter.as_millis() as u64,
        "DGC scheduler started"
    );
    if stop_requested(&stop_rx, jitter) {
        debug!("DGC scheduler stopped before the first epoch");
        return;
    }

    let mut next = Instant::now();
    loop {
        run_epoch(&transport);

        let now = Instant::now();
        let (deadline, overrun) = next_deadline(next, now, ttb);
        next = deadline;
        if let Some(overrun) = overrun {
            warn!(
                overrun_ms = overrun.as_millis() as u64,
                "DGC epoch took longer than the tick period"
            );
            DgcStats::bump(&stats.overruns, 1);
        }
        if stop_requested(&stop_rx, next.saturating_duration_since(now)) {
            break;
        }
    }
    debug!("DGC scheduler stopped");
}
