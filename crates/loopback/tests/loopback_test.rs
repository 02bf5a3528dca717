//! End-to-end tests of messengers talking over a loopback network.
//!
//! # Test Strategy
//!
//! 1. **Delivery**: ordering, source stamping, replies on the incoming connection
//! 2. **Handshake**: feature negotiation and authorizer exchange
//! 3. **Send variants**: lazy sends, keepalives, refused destinations
//! 4. **Teardown**: reset vs remote reset, drain-then-close, rebind,
//!    shutdown, suicide, waiting from inside a dispatcher
//! 5. **Flow control**: inbound throttle held across dispatch
//! 6. **Fatal path**: an unclaimed message aborts the whole process

use msgr_core::{
    AuthVerdict, Authorizer, Connection, ConnectionRef, Dispatched, Dispatcher, EntityAddr,
    EntityInst, EntityName, EntityType, FeatureSet, LifecycleState, Message, Messenger,
    MessengerBuilder, MessengerError, Policy, PolicySet, Throttle, PRIO_DEFAULT,
};
use msgr_loopback::{LoopbackNetwork, LoopbackTransport};
use parking_lot::{Condvar, Mutex};
use std::process::{Command, Output};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test fixtures
// ============================================================================

/// Records every event it sees and claims every message.
struct Collector {
    events: Mutex<Vec<String>>,
    cond: Condvar,
    meta: Mutex<Vec<(u64, i32, Option<EntityInst>)>>,
    connections: Mutex<Vec<ConnectionRef>>,
    issue: bool,
    verdict: Option<bool>,
}

impl Collector {
    fn new() -> Arc<Self> {
        Self::with_auth(true, Some(true))
    }

    fn with_auth(issue: bool, verdict: Option<bool>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cond: Condvar::new(),
            meta: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            issue,
            verdict,
        })
    }

    fn record(&self, event: String) {
        self.events.lock().push(event);
        self.cond.notify_all();
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn messages(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with("msg:"))
            .collect()
    }

    /// Block until `pred` holds or the timeout passes; returns the events.
    fn wait_until(&self, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        while !pred(&events) {
            if self.cond.wait_until(&mut events, deadline).timed_out() {
                break;
            }
        }
        events.clone()
    }

    fn wait_for_messages(&self, n: usize) -> Vec<String> {
        self.wait_until(|e| e.iter().filter(|s| s.starts_with("msg:")).count() >= n);
        self.messages()
    }

    fn wait_for(&self, event: &str) -> Vec<String> {
        self.wait_until(|e| e.iter().any(|s| s == event))
    }

    fn last_connection(&self) -> ConnectionRef {
        self.connections.lock().last().cloned().unwrap()
    }
}

impl Dispatcher for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    fn on_dispatch(&self, msg: Message) -> Dispatched {
        self.meta
            .lock()
            .push((msg.seq(), msg.priority(), msg.source().copied()));
        if let Some(con) = msg.connection() {
            self.connections.lock().push(Arc::clone(con));
        }
        let payload = String::from_utf8_lossy(msg.payload()).into_owned();
        self.record(format!("msg:{}", payload));
        Dispatched::Claimed
    }

    fn on_connect(&self, con: &ConnectionRef) {
        self.record(format!("connect:{}", con.peer_type()));
    }

    fn on_reset(&self, _con: &ConnectionRef) -> bool {
        self.record("reset".to_string());
        true
    }

    fn on_remote_reset(&self, _con: &ConnectionRef) {
        self.record("remote_reset".to_string());
    }

    fn issue_authorizer(&self, _peer_type: EntityType, _force_new: bool) -> Option<Authorizer> {
        self.issue.then(|| Authorizer::new(2, &b"ticket"[..]))
    }

    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        protocol: u32,
        authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        match self.verdict {
            Some(true) if protocol == 2 && authorizer == b"ticket" => {
                Some(AuthVerdict::accept(&b"ok"[..]))
            }
            Some(_) => Some(AuthVerdict::reject()),
            None => None,
        }
    }
}

/// Blocks the first message until opened, then declines it.
struct Gate {
    state: Mutex<(bool, bool)>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new((false, false)),
            cond: Condvar::new(),
        })
    }

    fn wait_entered(&self) {
        let mut state = self.state.lock();
        while !state.0 {
            self.cond.wait(&mut state);
        }
    }

    fn open(&self) {
        self.state.lock().1 = true;
        self.cond.notify_all();
    }
}

impl Dispatcher for Gate {
    fn on_dispatch(&self, msg: Message) -> Dispatched {
        let mut state = self.state.lock();
        state.0 = true;
        self.cond.notify_all();
        while !state.1 {
            self.cond.wait(&mut state);
        }
        Dispatched::Declined(msg)
    }
}

/// Accepts every peer but claims no message.
struct Decliner;

impl Dispatcher for Decliner {
    fn on_dispatch(&self, msg: Message) -> Dispatched {
        Dispatched::Declined(msg)
    }

    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        _protocol: u32,
        _authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        Some(AuthVerdict::accept(Vec::<u8>::new()))
    }
}

/// Shuts its own messenger down from inside dispatch and records the
/// state `wait()` leaves behind.
struct SelfStopper {
    msgr: OnceLock<Weak<Messenger<LoopbackTransport>>>,
    after_wait: Mutex<Option<LifecycleState>>,
}

impl Dispatcher for SelfStopper {
    fn on_dispatch(&self, _msg: Message) -> Dispatched {
        if let Some(msgr) = self.msgr.get().and_then(Weak::upgrade) {
            msgr.shutdown().unwrap();
            msgr.wait();
            *self.after_wait.lock() = Some(msgr.state());
        }
        Dispatched::Claimed
    }

    fn verify_authorizer(
        &self,
        _con: &ConnectionRef,
        _peer_type: EntityType,
        _protocol: u32,
        _authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        Some(AuthVerdict::accept(Vec::<u8>::new()))
    }
}

struct Node {
    msgr: Messenger<LoopbackTransport>,
    seen: Arc<Collector>,
}

impl Node {
    fn inst(&self) -> EntityInst {
        self.msgr.myinst()
    }
}

fn node_with(
    net: &LoopbackNetwork,
    name: EntityName,
    policies: PolicySet,
    seen: Arc<Collector>,
) -> Node {
    let msgr = MessengerBuilder::new(name)
        .build(|handle| LoopbackTransport::bind(net, handle, policies))
        .unwrap();
    msgr.add_dispatcher_tail(seen.clone());
    msgr.start().unwrap();
    Node { msgr, seen }
}

fn node(net: &LoopbackNetwork, name: EntityName) -> Node {
    node_with(net, name, PolicySet::default(), Collector::new())
}

fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    pred()
}

// ============================================================================
// Delivery
// ============================================================================

#[test]
fn test_messages_arrive_in_send_order() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    for i in 0..50 {
        a.msgr
            .send_message(Message::new(7, format!("m{}", i)), &b.inst())
            .unwrap();
    }

    let got = b.seen.wait_for_messages(50);
    let expected: Vec<String> = (0..50).map(|i| format!("msg:m{}", i)).collect();
    assert_eq!(got, expected);

    let meta = b.seen.meta.lock().clone();
    let seqs: Vec<u64> = meta.iter().map(|m| m.0).collect();
    assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());
    assert!(meta.iter().all(|m| m.1 == PRIO_DEFAULT));
    assert!(meta.iter().all(|m| m.2 == Some(a.inst())));
}

#[test]
fn test_connect_precedes_first_message_on_both_sides() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::client(4));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "hello"), &b.inst()).unwrap();
    let events = b.seen.wait_for("msg:hello");
    assert_eq!(events, vec!["connect:client", "msg:hello"]);

    let events = a.seen.wait_for("connect:osd");
    assert_eq!(events, vec!["connect:osd"]);
}

#[test]
fn test_reply_on_incoming_connection() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "ping"), &b.inst()).unwrap();
    b.seen.wait_for_messages(1);

    let con = b.seen.last_connection();
    assert_eq!(con.peer_addr(), a.msgr.myaddr());
    b.msgr.send_message_on(Message::new(2, "pong"), &con).unwrap();

    assert_eq!(a.seen.wait_for_messages(1), vec!["msg:pong"]);
    assert_eq!(a.msgr.transport().session_count(), 1);
    assert_eq!(b.msgr.transport().session_count(), 1);
}

#[test]
fn test_get_connection_returns_same_session() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    let first = a.msgr.get_connection(&b.inst()).unwrap();
    let second = a.msgr.get_connection(&b.inst()).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(first.features(), FeatureSet::SUPPORTED_DEFAULT);
    assert!(first.is_connected());
}

#[test]
fn test_send_to_self() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::mon(0));

    a.msgr.send_message(Message::new(1, "me"), &a.inst()).unwrap();
    assert_eq!(a.seen.wait_for_messages(1), vec!["msg:me"]);
    assert_eq!(a.msgr.transport().session_count(), 1);
}

// ============================================================================
// Handshake
// ============================================================================

#[test]
fn test_missing_required_feature_on_peer() {
    let net = LoopbackNetwork::new();
    let mut policies = PolicySet::default();
    policies.set_policy(
        EntityType::Osd,
        Policy::lossless_peer(FeatureSet::EMPTY, FeatureSet(1 << 40)),
    );
    let a = node_with(&net, EntityName::osd(0), policies, Collector::new());
    let b = node(&net, EntityName::osd(1));

    let err = a
        .msgr
        .send_message(Message::new(1, "x"), &b.inst())
        .unwrap_err();
    assert_eq!(
        err,
        MessengerError::FeatureMismatch {
            peer: b.msgr.myaddr(),
            missing: FeatureSet(1 << 40),
        }
    );
    assert_eq!(a.msgr.transport().session_count(), 0);
}

#[test]
fn test_peer_requires_feature_we_lack() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::client(1));
    let mut policies = PolicySet::default();
    policies.set_policy(
        EntityType::Client,
        Policy::stateless_server(FeatureSet(1 << 41), FeatureSet(1 << 41)),
    );
    let b = node_with(&net, EntityName::osd(1), policies, Collector::new());

    let err = a.msgr.get_connection(&b.inst()).unwrap_err();
    assert_eq!(err.kind(), "feature_mismatch");
}

#[test]
fn test_negotiated_features_are_common_subset() {
    let net = LoopbackNetwork::new();
    let mut policies = PolicySet::default();
    policies.set_default_policy(Policy::client(FeatureSet(1 << 50), FeatureSet::EMPTY));
    let a = node_with(&net, EntityName::client(1), policies, Collector::new());
    let b = node(&net, EntityName::osd(1));

    let con = a.msgr.get_connection(&b.inst()).unwrap();
    assert!(!con.has_feature(FeatureSet(1 << 50)));
    assert!(con.has_feature(FeatureSet::SUPPORTED_DEFAULT));
}

#[test]
fn test_no_authorizer_fails_handshake() {
    let net = LoopbackNetwork::new();
    let a = node_with(
        &net,
        EntityName::client(1),
        PolicySet::default(),
        Collector::with_auth(false, Some(true)),
    );
    let b = node(&net, EntityName::osd(1));

    let err = a.msgr.get_connection(&b.inst()).unwrap_err();
    assert!(matches!(
        err,
        MessengerError::AuthFailed {
            peer_type: EntityType::Osd,
            ..
        }
    ));
}

#[test]
fn test_rejected_or_unrecognised_authorizer_fails_handshake() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::client(1));
    let rejecting = node_with(
        &net,
        EntityName::osd(1),
        PolicySet::default(),
        Collector::with_auth(true, Some(false)),
    );
    let ignoring = node_with(
        &net,
        EntityName::osd(2),
        PolicySet::default(),
        Collector::with_auth(true, None),
    );

    for peer in [&rejecting, &ignoring] {
        let err = a.msgr.get_connection(&peer.inst()).unwrap_err();
        assert_eq!(err.kind(), "auth_failed");
        assert_eq!(peer.msgr.transport().session_count(), 0);
    }
    assert_eq!(a.msgr.transport().session_count(), 0);
}

// ============================================================================
// Send variants
// ============================================================================

#[test]
fn test_send_to_unbound_address_refused() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let nowhere = EntityInst::new(
        EntityName::osd(9),
        EntityAddr::new("127.0.0.1:1".parse().unwrap(), 0),
    );

    let err = a
        .msgr
        .send_message(Message::new(1, "x"), &nowhere)
        .unwrap_err();
    assert_eq!(err, MessengerError::ConnectionRefused(nowhere.addr));
}

#[test]
fn test_send_before_start_rejected() {
    let net = LoopbackNetwork::new();
    let b = node(&net, EntityName::osd(1));
    let idle = MessengerBuilder::new(EntityName::osd(0))
        .build(|handle| LoopbackTransport::bind(&net, handle, PolicySet::default()))
        .unwrap();

    let err = idle
        .send_message(Message::new(1, "x"), &b.inst())
        .unwrap_err();
    assert_eq!(err, MessengerError::NotStarted);
}

#[test]
fn test_lazy_send_drops_without_session() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr
        .lazy_send_message(Message::new(1, "dropped"), &b.inst())
        .unwrap();
    assert_eq!(a.msgr.transport().session_count(), 0);

    a.msgr.send_message(Message::new(1, "opens"), &b.inst()).unwrap();
    a.msgr
        .lazy_send_message(Message::new(1, "rides"), &b.inst())
        .unwrap();

    assert_eq!(b.seen.wait_for_messages(2), vec!["msg:opens", "msg:rides"]);
}

#[test]
fn test_lazy_send_on_closed_connection_is_dropped() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    let con = a.msgr.get_connection(&b.inst()).unwrap();
    a.msgr.mark_down_connection(&con);
    assert!(!con.is_connected());

    a.msgr
        .lazy_send_message_on(Message::new(1, "late"), &con)
        .unwrap();
    let err = a
        .msgr
        .send_message_on(Message::new(1, "late"), &con)
        .unwrap_err();
    assert_eq!(err, MessengerError::ConnectionClosed(con.id()));
}

#[test]
fn test_lazy_send_outside_running_state_rejected() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));
    let con = a.msgr.get_connection(&b.inst()).unwrap();

    let idle = MessengerBuilder::new(EntityName::osd(2))
        .build(|handle| LoopbackTransport::bind(&net, handle, PolicySet::default()))
        .unwrap();
    assert_eq!(
        idle.lazy_send_message(Message::new(1, "x"), &b.inst()),
        Err(MessengerError::NotStarted)
    );
    assert_eq!(
        idle.lazy_send_message_on(Message::new(1, "x"), &con),
        Err(MessengerError::NotStarted)
    );

    a.msgr.shutdown().unwrap();
    assert_eq!(
        a.msgr.lazy_send_message(Message::new(1, "x"), &b.inst()),
        Err(MessengerError::ShutDown)
    );
    assert_eq!(
        a.msgr.lazy_send_message_on(Message::new(1, "x"), &con),
        Err(MessengerError::ShutDown)
    );
    assert!(b.seen.messages().is_empty());
}

#[test]
fn test_keepalive_updates_receiver() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_keepalive(&b.inst()).unwrap();
    assert!(eventually(|| {
        b.msgr
            .transport()
            .session(&a.msgr.myaddr())
            .and_then(|con| con.last_keepalive())
            .is_some()
    }));
    // Keepalives are not messages.
    assert!(b.seen.messages().is_empty());
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn test_mark_down_notifies_lossless_peer_with_remote_reset() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "x"), &b.inst()).unwrap();
    b.seen.wait_for_messages(1);

    a.msgr.mark_down(&b.msgr.myaddr());
    let events = b.seen.wait_for("remote_reset");
    assert!(!events.contains(&"reset".to_string()));
    assert!(!a.seen.events().iter().any(|e| e.contains("reset")));
    assert_eq!(a.msgr.transport().session_count(), 0);
    assert_eq!(b.msgr.transport().session_count(), 0);
}

#[test]
fn test_mark_down_notifies_lossy_peer_with_reset() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::client(3));
    let mut policies = PolicySet::default();
    policies.set_policy(
        EntityType::Client,
        Policy::stateless_server(FeatureSet::EMPTY, FeatureSet::EMPTY),
    );
    let b = node_with(&net, EntityName::osd(1), policies, Collector::new());

    a.msgr.get_connection(&b.inst()).unwrap();
    a.msgr.mark_down_all();

    let events = b.seen.wait_for("reset");
    assert!(!events.contains(&"remote_reset".to_string()));
}

#[test]
fn test_disposable_connection_gets_reset() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "x"), &b.inst()).unwrap();
    b.seen.wait_for_messages(1);
    let con = b.seen.last_connection();
    b.msgr.mark_disposable(&con);

    a.msgr.mark_down(&b.msgr.myaddr());
    b.seen.wait_for("reset");
}

#[test]
fn test_mark_down_on_empty_flushes_queued_messages_first() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    let con = a.msgr.get_connection(&b.inst()).unwrap();
    for i in 0..20 {
        a.msgr
            .send_message_on(Message::new(1, format!("q{}", i)), &con)
            .unwrap();
    }
    a.msgr.mark_down_on_empty(&con);

    let events = b.seen.wait_for("remote_reset");
    let expected: Vec<String> = std::iter::once("connect:osd".to_string())
        .chain((0..20).map(|i| format!("msg:q{}", i)))
        .chain(std::iter::once("remote_reset".to_string()))
        .collect();
    assert_eq!(events, expected);
    assert!(eventually(|| !con.is_connected()));
}

#[test]
fn test_messages_for_marked_down_connection_are_dropped() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let gate = Gate::new();
    let b = node(&net, EntityName::osd(1));
    b.msgr.add_dispatcher_head(gate.clone());

    a.msgr.send_message(Message::new(1, "first"), &b.inst()).unwrap();
    gate.wait_entered();
    a.msgr.send_message(Message::new(1, "second"), &b.inst()).unwrap();
    a.msgr.mark_down(&b.msgr.myaddr());
    gate.open();

    b.seen.wait_for("remote_reset");
    assert_eq!(b.seen.messages(), vec!["msg:first"]);
    assert!(eventually(|| b.msgr.dispatch_queue_len() == 0));
}

#[test]
fn test_rebind_moves_port_and_resets_sessions() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "x"), &b.inst()).unwrap();
    b.seen.wait_for_messages(1);

    let old = a.msgr.myaddr();
    a.msgr.rebind(old.port()).unwrap();
    let new = a.msgr.myaddr();

    assert_ne!(new.port(), old.port());
    assert!(!net.is_bound(&old));
    assert!(net.is_bound(&new));
    b.seen.wait_for("remote_reset");

    b.msgr.send_message(Message::new(1, "back"), &a.inst()).unwrap();
    assert_eq!(a.seen.wait_for_messages(1), vec!["msg:back"]);
}

#[test]
fn test_set_ip_keeps_endpoint_reachable() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.set_ip("127.0.0.2".parse().unwrap());
    assert_eq!(a.msgr.myaddr().addr.ip().to_string(), "127.0.0.2");
    assert!(net.is_bound(&a.msgr.myaddr()));

    b.msgr.send_message(Message::new(1, "moved"), &a.inst()).unwrap();
    assert_eq!(a.seen.wait_for_messages(1), vec!["msg:moved"]);
}

#[test]
fn test_shutdown_unbinds_and_resets_peers() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let b = node(&net, EntityName::osd(1));

    a.msgr.send_message(Message::new(1, "x"), &b.inst()).unwrap();
    b.seen.wait_for_messages(1);

    let a_inst = a.inst();
    a.msgr.shutdown().unwrap();
    a.msgr.wait();

    assert!(!net.is_bound(&a_inst.addr));
    b.seen.wait_for("remote_reset");
    let err = b
        .msgr
        .send_message(Message::new(1, "gone"), &a_inst)
        .unwrap_err();
    assert_eq!(err, MessengerError::ConnectionRefused(a_inst.addr));
    assert_eq!(
        a.msgr.send_message(Message::new(1, "x"), &b.inst()),
        Err(MessengerError::ShutDown)
    );
}

#[test]
fn test_suicide_discards_queued_messages() {
    let net = LoopbackNetwork::new();
    let throttle = Arc::new(Throttle::new("osd-bytes", 1000));
    let mut policies = PolicySet::default();
    policies.set_default_policy(
        Policy::lossless_peer(FeatureSet::EMPTY, FeatureSet::EMPTY)
            .with_throttler(Arc::clone(&throttle)),
    );
    let a = node(&net, EntityName::osd(0));
    let gate = Gate::new();
    let b = node_with(&net, EntityName::osd(1), policies, Collector::new());
    b.msgr.add_dispatcher_head(gate.clone());

    a.msgr.send_message(Message::new(1, "first"), &b.inst()).unwrap();
    gate.wait_entered();
    a.msgr.send_message(Message::new(1, "second"), &b.inst()).unwrap();
    a.msgr.send_message(Message::new(1, "third"), &b.inst()).unwrap();
    assert_eq!(b.msgr.dispatch_queue_len(), 2);

    let b_addr = b.msgr.myaddr();
    b.msgr.suicide();
    assert_eq!(b.msgr.state(), LifecycleState::Stopping);
    gate.open();
    b.msgr.wait();

    assert_eq!(b.msgr.state(), LifecycleState::Stopped);
    assert_eq!(b.seen.messages(), vec!["msg:first"]);
    assert_eq!(b.msgr.dispatch_queue_len(), 0);
    assert_eq!(throttle.current(), 0);
    assert!(!net.is_bound(&b_addr));
    a.seen.wait_for("remote_reset");
    assert_eq!(
        b.msgr.send_message(Message::new(1, "x"), &a.inst()),
        Err(MessengerError::ShutDown)
    );
}

#[test]
fn test_wait_inside_dispatcher_does_not_report_stopped() {
    let net = LoopbackNetwork::new();
    let a = node(&net, EntityName::osd(0));
    let stopper = Arc::new(SelfStopper {
        msgr: OnceLock::new(),
        after_wait: Mutex::new(None),
    });
    let b = Arc::new(
        MessengerBuilder::new(EntityName::osd(1))
            .build(|handle| LoopbackTransport::bind(&net, handle, PolicySet::default()))
            .unwrap(),
    );
    stopper.msgr.set(Arc::downgrade(&b)).unwrap();
    b.add_dispatcher_tail(stopper.clone());
    b.start().unwrap();

    a.msgr.send_message(Message::new(1, "stop"), &b.myinst()).unwrap();
    assert!(eventually(|| stopper.after_wait.lock().is_some()));
    assert_eq!(*stopper.after_wait.lock(), Some(LifecycleState::Stopping));

    b.wait();
    assert_eq!(b.state(), LifecycleState::Stopped);
}

#[test]
fn test_drop_without_shutdown_unbinds() {
    let net = LoopbackNetwork::new();
    let addr = {
        let a = node(&net, EntityName::osd(0));
        a.msgr.myaddr()
    };
    assert!(!net.is_bound(&addr));
    assert!(net.is_empty());
}

#[test]
fn test_outbound_handshake_needs_a_dispatcher() {
    let net = LoopbackNetwork::new();
    let b = node(&net, EntityName::osd(1));
    let bare = MessengerBuilder::new(EntityName::osd(0))
        .build(|handle| LoopbackTransport::bind(&net, handle, PolicySet::default()))
        .unwrap();
    bare.start().unwrap();

    let err = bare.get_connection(&b.inst()).unwrap_err();
    assert_eq!(err.kind(), "auth_failed");
}

// ============================================================================
// Flow control
// ============================================================================

#[test]
fn test_inbound_throttle_held_until_dispatch_completes() {
    let net = LoopbackNetwork::new();
    let throttle = Arc::new(Throttle::new("osd-bytes", 1000));
    let mut policies = PolicySet::default();
    policies.set_policy(
        EntityType::Osd,
        Policy::lossless_peer(FeatureSet::EMPTY, FeatureSet::EMPTY)
            .with_throttler(Arc::clone(&throttle)),
    );
    let a = node(&net, EntityName::osd(0));
    let gate = Gate::new();
    let b = node_with(&net, EntityName::osd(1), policies, Collector::new());
    b.msgr.add_dispatcher_head(gate.clone());

    a.msgr
        .send_message(Message::new(1, vec![0u8; 100]), &b.inst())
        .unwrap();
    gate.wait_entered();
    assert_eq!(throttle.current(), 100);

    gate.open();
    b.seen.wait_for_messages(1);
    assert!(eventually(|| throttle.current() == 0));
}

#[test]
fn test_throttle_blocks_sender_until_budget_frees() {
    let net = LoopbackNetwork::new();
    let throttle = Arc::new(Throttle::new("osd-bytes", 150));
    let mut policies = PolicySet::default();
    policies.set_default_policy(
        Policy::lossless_peer(FeatureSet::EMPTY, FeatureSet::EMPTY)
            .with_throttler(Arc::clone(&throttle)),
    );
    let a = Arc::new(node(&net, EntityName::osd(0)));
    let gate = Gate::new();
    let b = node_with(&net, EntityName::osd(1), policies, Collector::new());
    b.msgr.add_dispatcher_head(gate.clone());

    a.msgr
        .send_message(Message::new(1, vec![1u8; 100]), &b.inst())
        .unwrap();
    gate.wait_entered();

    let sender = {
        let a = Arc::clone(&a);
        let dest = b.inst();
        thread::spawn(move || {
            a.msgr
                .send_message(Message::new(1, vec![2u8; 100]), &dest)
                .unwrap();
        })
    };
    thread::sleep(Duration::from_millis(30));
    assert!(!sender.is_finished());

    gate.open();
    sender.join().unwrap();
    assert_eq!(b.seen.wait_for_messages(2).len(), 2);
}

// ============================================================================
// Fatal path
// ============================================================================

const FATAL_CHILD: &str = "MSGR_FATAL_CHILD";

fn in_fatal_child(test: &str) -> bool {
    std::env::var(FATAL_CHILD).as_deref() == Ok(test)
}

/// Re-run `test` alone in a fresh copy of this binary.
fn run_in_child(test: &str) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(FATAL_CHILD, test)
        .output()
        .unwrap()
}

#[test]
fn test_unclaimed_message_aborts_process() {
    let name = "test_unclaimed_message_aborts_process";
    if in_fatal_child(name) {
        let net = LoopbackNetwork::new();
        let client = node(&net, EntityName::client(4));
        let server = MessengerBuilder::new(EntityName::osd(1))
            .build(|handle| LoopbackTransport::bind(&net, handle, PolicySet::default()))
            .unwrap();
        server.add_dispatcher_tail(Arc::new(Decliner));
        server.start().unwrap();

        client
            .msgr
            .send_message(Message::new(7, "first"), &server.myinst())
            .unwrap();
        // Keep sending; the process must die before this loop runs out.
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            let _ = client
                .msgr
                .send_message(Message::new(7, "more"), &server.myinst());
            thread::sleep(Duration::from_millis(20));
        }
        return;
    }

    let out = run_in_child(name);
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(!out.status.success(), "process survived: {}", stderr);
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        // SIGABRT
        assert_eq!(out.status.signal(), Some(6), "stderr: {}", stderr);
    }
    assert!(stderr.contains("unhandled message msg(type=7 seq=1"), "stderr: {}", stderr);
    assert!(stderr.contains("from client.4"), "stderr: {}", stderr);
}
