//! # Otter Distributed Garbage Collector
//!
//! Reclaims active objects spread across processes, including cycles of
//! objects that only reference each other.
//!
//! ## Design
//!
//! - **Activity clocks**: every object tracks the latest event it knows of as
//!   a Lamport timestamp. Activities spread along references with each message.
//! - **Acyclic garbage**: an object nobody has talked to for `tta` terminates.
//! - **Cyclic garbage**: when the owner of the latest activity sees every
//!   referencer agree on it, nothing reachable happened since. The decision
//!   spreads back through the cycle as termination responses.
//! - **Transport**: one batch per destination and epoch. Local batches are
//!   delivered synchronously, remote ones on a send pool with at most one
//!   send in flight per destination. A failed send counts as a dead target.
//!
//! Host runtimes implement [`ActiveBody`] for their objects, call
//! [`Dgc::reference`] whenever code obtains a proxy, and route inbound
//! envelopes to [`Dgc::receive`].

#![warn(clippy::all)]

pub mod activity;
pub mod body;
pub mod clock;
pub mod collector;
pub mod config;
pub mod edge;
pub mod engine;
pub mod error;
pub mod id;
pub mod peer;
pub mod pool;
pub mod registry;
pub mod root_set;
pub mod scheduler;
pub mod stats;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use activity::Activity;
pub use body::ActiveBody;
pub use clock::{ManualClock, SystemClock, TimeSource};
pub use collector::{Collector, CollectorSnapshot, FinishedState, Outgoing};
pub use config::DgcConfig;
pub use edge::{EdgeTag, RemoteRef};
pub use engine::{Dgc, DgcBuilder};
pub use error::{DgcError, DgcResult, TerminationError, TransportError};
pub use id::{NodeId, ObjectId};
pub use registry::Registry;
pub use root_set::AnonymousRootSet;
pub use scheduler::{EpochReport, Scheduler, run_epoch};
pub use stats::{DgcStats, DgcStatsSnapshot};
pub use transport::{DispatchSummary, RemoteTransport, Transport};
pub use wire::{GcEnvelope, GcMessage, GcResponse, GcResponseBatch};
