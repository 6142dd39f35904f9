//! Worker pool for outbound sends.
//!
//! Remote sends may block on a slow or partitioned peer, so they run off the
//! scheduler thread. The pool grows on demand: every submitted job either
//! claims an idle worker or spawns a new one, so a job never queues behind a
//! worker that is busy with a blocked send. Workers that stay idle for the
//! configured timeout exit.

use crate::error::{DgcError, DgcResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct PoolCounters {
    workers: AtomicUsize,
    /// Waiting workers not yet claimed by a submitted job
    idle: AtomicUsize,
    spawned: AtomicUsize,
}

impl PoolCounters {
    /// Take one unclaimed idle slot, if any
    fn claim_idle(&self) -> bool {
        self.idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// On-demand thread pool with idle reclaim
pub struct SendPool {
    job_tx: Sender<Job>,
    job_rx: Receiver<Job>,
    counters: Arc<PoolCounters>,
    idle_timeout: Duration,
}

impl SendPool {
    /// Create an empty pool; workers exit after `idle_timeout` without work
    pub fn new(idle_timeout: Duration) -> Self {
        let (job_tx, job_rx) = unbounded();
        Self {
            job_tx,
            job_rx,
            counters: Arc::new(PoolCounters::default()),
            idle_timeout,
        }
    }

    /// Run `job` on a pool worker.
    ///
    /// The job claims one idle worker, or spawns a fresh one when every
    /// worker is busy or already claimed.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> DgcResult<()> {
        if !self.counters.claim_idle() {
            self.spawn_worker()?;
        }
        self.job_tx
            .send(Box::new(job))
            .map_err(|_| DgcError::ShutDown)
    }

    fn spawn_worker(&self) -> DgcResult<()> {
        let n = self.counters.spawned.fetch_add(1, Ordering::SeqCst);
        let rx = self.job_rx.clone();
        let counters = self.counters.clone();
        let idle_timeout = self.idle_timeout;
        counters.workers.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("otter-dgc-send-{}", n))
            .spawn(move || run_worker(rx, counters, idle_timeout));
        if let Err(e) = spawned {
            self.counters.workers.fetch_sub(1, Ordering::SeqCst);
            return Err(DgcError::Spawn(e));
        }
        Ok(())
    }

    /// Live worker threads
    pub fn workers(&self) -> usize {
        self.counters.workers.load(Ordering::SeqCst)
    }

    /// Waiting workers that no submitted job has claimed yet
    pub fn idle_workers(&self) -> usize {
        self.counters.idle.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendPool")
            .field("workers", &self.workers())
            .field("idle", &self.idle_workers())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

fn run_worker(rx: Receiver<Job>, counters: Arc<PoolCounters>, idle_timeout: Duration) {
    debug!("send worker starting");
    // A fresh worker was spawned for a job that is already on its way.
    let mut claimed = true;
    loop {
        let job = match rx.recv_timeout(idle_timeout) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                // Leave only while no submitter counts on this slot.
                if !claimed && counters.claim_idle() {
                    break;
                }
                claimed = true;
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !claimed {
                    counters.claim_idle();
                }
                break;
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("send job panicked");
        }
        counters.idle.fetch_add(1, Ordering::SeqCst);
        claimed = false;
    }
    counters.workers.fetch_sub(1, Ordering::SeqCst);
    debug!("send worker stopped");
}
