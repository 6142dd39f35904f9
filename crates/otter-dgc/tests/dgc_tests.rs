//! End-to-end protocol runs
//!
//! These tests drive whole processes in simulated time: epochs are run by
//! hand and the clock is advanced between them.

use otter_dgc::wire::{decode, encode};
use otter_dgc::{
    ActiveBody, Dgc, DgcConfig, DgcError, FinishedState, GcEnvelope, GcResponseBatch,
    ManualClock, NodeId, ObjectId, Registry, RemoteRef, RemoteTransport, TerminationError,
    TransportError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const TTB_MS: i64 = 100;
const TTA_MS: i64 = 500;

/// Active object stub recording how the collector saw it
struct TestBody {
    busy: AtomicBool,
    alive: AtomicBool,
    busy_checks: AtomicUsize,
    seen_busy: AtomicBool,
    terminations: AtomicUsize,
}

impl TestBody {
    fn idle() -> Arc<Self> {
        Arc::new(Self {
            busy: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            busy_checks: AtomicUsize::new(0),
            seen_busy: AtomicBool::new(false),
            terminations: AtomicUsize::new(0),
        })
    }

    fn busy() -> Arc<Self> {
        let body = Self::idle();
        body.busy.store(true, Ordering::SeqCst);
        body
    }
}

impl ActiveBody for TestBody {
    fn is_busy(&self) -> bool {
        self.busy_checks.fetch_add(1, Ordering::SeqCst);
        let busy = self.busy.load(Ordering::SeqCst);
        if busy {
            self.seen_busy.store(true, Ordering::SeqCst);
        }
        busy
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn request_termination(&self) -> Result<(), TerminationError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.alive.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TerminationError::Inactive)
        }
    }
}

fn config() -> DgcConfig {
    DgcConfig::new()
        .enabled(true)
        .ttb(Duration::from_millis(TTB_MS as u64))
        .startup_jitter(false)
}

fn local_dgc(clock: &ManualClock) -> Dgc {
    Dgc::builder()
        .node(NodeId(1))
        .config(config())
        .clock(Arc::new(clock.clone()))
        .build()
        .unwrap()
}

/// In-memory network: envelopes go through the JSON codec on both legs
#[derive(Default)]
struct Loopback {
    nodes: Mutex<HashMap<NodeId, Arc<Registry>>>,
    sends: AtomicUsize,
}

impl Loopback {
    fn attach(&self, registry: Arc<Registry>) {
        self.nodes.lock().insert(registry.node(), registry);
    }
}

impl RemoteTransport for Loopback {
    fn send_batch(&self, envelope: &GcEnvelope) -> Result<GcResponseBatch, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let bytes = encode(envelope)?;
        let registry = self
            .nodes
            .lock()
            .get(&envelope.target.node)
            .cloned()
            .ok_or(TransportError::NoRoute(envelope.target.node))?;

        let request: GcEnvelope = decode(&bytes)?;
        let batch = registry.receive(&request)?;
        let reply = encode(&batch)?;
        decode(&reply)
    }
}

struct Unreachable;

impl RemoteTransport for Unreachable {
    fn send_batch(&self, envelope: &GcEnvelope) -> Result<GcResponseBatch, TransportError> {
        Err(TransportError::Unreachable(envelope.target))
    }
}

#[test]
fn test_two_object_cycle_is_collected() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let body_a = TestBody::idle();
    let body_b = TestBody::idle();
    let (a, ca) = dgc.spawn(body_a.clone());
    let (b, cb) = dgc.spawn(body_b.clone());
    let (ca, cb) = (ca.unwrap(), cb.unwrap());

    // Each object holds a proxy on the other.
    let _held: Vec<RemoteRef> = vec![
        dgc.reference(Some(a), b).unwrap(),
        dgc.reference(Some(b), a).unwrap(),
    ];

    let mut last_a = ca.last_activity();
    let mut last_b = cb.last_activity();
    for _ in 0..50 {
        dgc.run_epoch().unwrap();
        assert!(ca.last_activity() >= last_a);
        assert!(cb.last_activity() >= last_b);
        last_a = ca.last_activity();
        last_b = cb.last_activity();
        if ca.is_finished() && cb.is_finished() {
            break;
        }
        clock.advance_ms(TTB_MS);
    }

    assert_eq!(ca.finished_state(), FinishedState::Cyclic);
    assert_eq!(cb.finished_state(), FinishedState::Cyclic);
    for body in [&body_a, &body_b] {
        assert!(body.busy_checks.load(Ordering::SeqCst) > 0);
        assert!(!body.seen_busy.load(Ordering::SeqCst));
        assert_eq!(body.terminations.load(Ordering::SeqCst), 1);
    }
    assert_eq!(dgc.stats().cyclic, 2);
    assert!(dgc.registry().is_empty());
}

#[test]
fn test_alone_object_terminates_after_tta() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let body = TestBody::idle();
    let (_, collector) = dgc.spawn(body.clone());
    let collector = collector.unwrap();

    dgc.run_epoch().unwrap();
    clock.set_ms(TTA_MS);
    dgc.run_epoch().unwrap();
    assert!(!collector.is_finished());
    assert_eq!(body.terminations.load(Ordering::SeqCst), 0);

    clock.set_ms(TTA_MS + 1);
    dgc.run_epoch().unwrap();
    assert_eq!(collector.finished_state(), FinishedState::Acyclic);
    assert_eq!(body.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(dgc.stats().acyclic, 1);
}

#[test]
fn test_referenced_object_is_never_collected() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let (target, collector) = dgc.spawn(TestBody::idle());
    let collector = collector.unwrap();
    let _proxy = dgc.reference(None, target).unwrap();

    for _ in 0..1000 {
        dgc.run_epoch().unwrap();
        assert_eq!(collector.finished_state(), FinishedState::NotFinished);
        clock.advance_ms(TTB_MS);
    }
    assert_eq!(collector.snapshot().referencers.len(), 1);
}

#[test]
fn test_busy_holder_keeps_cycle_alive() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let holder = TestBody::busy();
    let (h, ch) = dgc.spawn(holder.clone());
    let (a, ca) = dgc.spawn(TestBody::idle());
    let (b, cb) = dgc.spawn(TestBody::idle());
    let _held = vec![
        dgc.reference(Some(h), a).unwrap(),
        dgc.reference(Some(a), b).unwrap(),
        dgc.reference(Some(b), a).unwrap(),
    ];

    for _ in 0..200 {
        dgc.run_epoch().unwrap();
        clock.advance_ms(TTB_MS);
    }
    assert!(!ch.unwrap().is_finished());
    assert!(!ca.unwrap().is_finished());
    assert!(!cb.unwrap().is_finished());
    assert!(holder.seen_busy.load(Ordering::SeqCst));
}

#[test]
fn test_dropped_proxy_removes_edge() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let (a, ca) = dgc.spawn(TestBody::idle());
    let (b, _cb) = dgc.spawn(TestBody::idle());
    let ca = ca.unwrap();

    let proxy = dgc.reference(Some(a), b).unwrap();
    dgc.run_epoch().unwrap();
    assert!(ca.has_edge(b));

    drop(proxy);
    let before = ca.last_activity();
    clock.advance_ms(TTB_MS);
    dgc.run_epoch().unwrap();
    assert!(!ca.has_edge(b));
    assert!(ca.last_activity().counter() > before.counter());
}

#[test]
fn test_cycle_across_nodes() {
    let clock = ManualClock::new(0);
    let network = Arc::new(Loopback::default());
    let build = |node| {
        Dgc::builder()
            .node(node)
            .config(config())
            .clock(Arc::new(clock.clone()))
            .remote(network.clone())
            .build()
            .unwrap()
    };
    let dgc1 = build(NodeId(1));
    let dgc2 = build(NodeId(2));
    network.attach(dgc1.registry().clone());
    network.attach(dgc2.registry().clone());

    let (a, ca) = dgc1.spawn(TestBody::idle());
    let (b, cb) = dgc2.spawn(TestBody::idle());
    let (ca, cb) = (ca.unwrap(), cb.unwrap());
    let _held = vec![
        dgc1.reference(Some(a), b).unwrap(),
        dgc2.reference(Some(b), a).unwrap(),
    ];

    for _ in 0..50 {
        dgc1.run_epoch().unwrap();
        assert!(dgc1.transport().quiesce(Duration::from_secs(5)));
        dgc2.run_epoch().unwrap();
        assert!(dgc2.transport().quiesce(Duration::from_secs(5)));
        if ca.is_finished() && cb.is_finished() {
            break;
        }
        clock.advance_ms(TTB_MS);
    }

    assert_eq!(ca.finished_state(), FinishedState::Cyclic);
    assert_eq!(cb.finished_state(), FinishedState::Cyclic);
    assert!(network.sends.load(Ordering::SeqCst) > 0);
    assert_eq!(dgc1.stats().failed_sends, 0);
    assert_eq!(
        dgc1.stats().remote_batches + dgc2.stats().remote_batches,
        network.sends.load(Ordering::SeqCst) as u64
    );
}

#[test]
fn test_remote_reference_from_plain_code() {
    let clock = ManualClock::new(0);
    let network = Arc::new(Loopback::default());
    let build = |node| {
        Dgc::builder()
            .node(node)
            .config(config())
            .clock(Arc::new(clock.clone()))
            .remote(network.clone())
            .build()
            .unwrap()
    };
    let client = build(NodeId(1));
    let server = build(NodeId(2));
    network.attach(client.registry().clone());
    network.attach(server.registry().clone());

    let (target, collector) = server.spawn(TestBody::idle());
    let collector = collector.unwrap();
    let proxy = client.reference(None, target).unwrap();

    for _ in 0..30 {
        client.run_epoch().unwrap();
        assert!(client.transport().quiesce(Duration::from_secs(5)));
        server.run_epoch().unwrap();
        clock.advance_ms(TTB_MS);
    }
    assert!(!collector.is_finished());
    assert_eq!(
        collector.snapshot().referencers,
        vec![ObjectId::root_set(NodeId(1))]
    );

    drop(proxy);
    for _ in 0..30 {
        client.run_epoch().unwrap();
        assert!(client.transport().quiesce(Duration::from_secs(5)));
        server.run_epoch().unwrap();
        clock.advance_ms(TTB_MS);
    }
    assert_eq!(collector.finished_state(), FinishedState::Acyclic);
}

#[test]
fn test_failed_send_retries_each_epoch() {
    let clock = ManualClock::new(0);
    let dgc = Dgc::builder()
        .node(NodeId(1))
        .config(config())
        .clock(Arc::new(clock.clone()))
        .remote(Arc::new(Unreachable))
        .build()
        .unwrap();
    let roots = dgc.registry().root_set().collector().clone();
    let remote = ObjectId::new(NodeId(2), 5);
    let proxy = dgc.reference(None, remote).unwrap();

    dgc.run_epoch().unwrap();
    assert!(dgc.transport().quiesce(Duration::from_secs(5)));
    assert_eq!(dgc.stats().failed_sends, 1);

    // Severed edge is dropped, then staged again since the proxy is held.
    dgc.run_epoch().unwrap();
    assert!(!roots.has_edge(remote));
    dgc.run_epoch().unwrap();
    assert!(dgc.transport().quiesce(Duration::from_secs(5)));
    assert_eq!(dgc.stats().failed_sends, 2);

    drop(proxy);
    for _ in 0..3 {
        dgc.run_epoch().unwrap();
        assert!(dgc.transport().quiesce(Duration::from_secs(5)));
    }
    assert_eq!(dgc.stats().failed_sends, 2);
    assert!(roots.referenced_ids().is_empty());
}

#[test]
fn test_disabled_engine_is_inert() {
    let dgc = Dgc::builder()
        .node(NodeId(1))
        .config(DgcConfig::default())
        .build()
        .unwrap();
    dgc.start().unwrap();
    assert!(!dgc.is_running());

    let (id, collector) = dgc.spawn(TestBody::idle());
    assert!(collector.is_none());
    let proxy = dgc.reference(Some(id), ObjectId::new(NodeId(2), 1)).unwrap();
    assert_eq!(proxy.target(), ObjectId::new(NodeId(2), 1));
    assert_eq!(dgc.log_status(id), "DGC Disabled");

    let envelope = GcEnvelope {
        target: id,
        messages: vec![],
    };
    assert!(matches!(dgc.receive(&envelope), Err(DgcError::Disabled)));
    assert!(dgc.shutdown(Duration::from_millis(10)));
}

#[test]
fn test_shutdown_releases_plain_references() {
    let clock = ManualClock::new(0);
    let dgc = local_dgc(&clock);
    let (target, collector) = dgc.spawn(TestBody::idle());
    let collector = collector.unwrap();
    let _proxy = dgc.reference(None, target).unwrap();

    dgc.run_epoch().unwrap();
    assert!(dgc.shutdown(Duration::from_secs(5)));
    assert!(dgc.registry().root_set().is_shut_down());

    for _ in 0..15 {
        clock.advance_ms(TTB_MS);
        dgc.run_epoch().unwrap();
    }
    assert_eq!(collector.finished_state(), FinishedState::Acyclic);
}
