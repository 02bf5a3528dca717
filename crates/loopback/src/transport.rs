//! [`Transport`] implementation over a [`LoopbackNetwork`].
//!
//! # Sessions
//!
//! The first send to a peer runs a handshake on the caller's thread:
//! - Both sides' policies are checked against the other's supported
//!   features.
//! - Our chain issues an authorizer for the peer type.
//! - The peer's chain verifies it.
//!
//! On success a linked connection pair is recorded in both endpoints'
//! session tables and each side is told about it through its own worker.
//!
//! # Flow control
//!
//! When the receiver's policy for our entity type carries a throttler,
//! each message charges its payload length before it is queued and the
//! units are returned once dispatch finishes. The sender blocks while the
//! budget is exhausted.
//!
//! # Teardown
//!
//! Marking a session down closes both halves at once. The side that asked
//! hears nothing; the other side gets a local reset if its half is lossy
//! or disposable, and a remote reset otherwise.
//!
//! `shutdown` lets the worker deliver what was queued before the stop;
//! `suicide` makes it discard everything after the event in hand.

use crate::connection::LoopbackConnection;
use crate::network::LoopbackNetwork;
use crate::worker::{self, Charge, Event};
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use metrics::counter;
use msgr_core::{
    Connection, ConnectionRef, DispatcherChain, EntityAddr, EntityInst, Message, MessengerError,
    MessengerHandle, PolicySet, Result, Transport,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, info, trace, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopping,
    Stopped,
}

struct RunState {
    phase: Phase,
    ready: bool,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

/// One bound participant on the network. Shared by the transport, its
/// worker and the connections it owns.
pub(crate) struct Endpoint {
    network: LoopbackNetwork,
    handle: Arc<MessengerHandle>,
    policies: PolicySet,
    addr: RwLock<EntityAddr>,
    sessions: DashMap<EntityAddr, Arc<LoopbackConnection>>,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    queued: AtomicUsize,
    halted: AtomicBool,
    run: Mutex<RunState>,
    cond: Condvar,
}

impl Endpoint {
    pub(crate) fn addr(&self) -> EntityAddr {
        *self.addr.read()
    }

    pub(crate) fn chain(&self) -> &DispatcherChain {
        self.handle.chain()
    }

    pub(crate) fn receiver(&self) -> Receiver<Event> {
        self.rx.clone()
    }

    fn me(&self) -> EntityInst {
        EntityInst::new(self.handle.myname(), self.addr())
    }

    fn phase(&self) -> Phase {
        self.run.lock().phase
    }

    fn check_running(&self) -> Result<()> {
        match self.phase() {
            Phase::Running => Ok(()),
            Phase::Idle => Err(MessengerError::NotStarted),
            Phase::Stopping | Phase::Stopped => Err(MessengerError::ShutDown),
        }
    }

    fn enqueue(&self, event: Event) {
        if let Event::Message { .. } = event {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
        // The endpoint holds its own receiver, so the channel never disconnects.
        let _ = self.tx.send(event);
    }

    pub(crate) fn dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    /// Set by `suicide`; the worker stops delivering once it sees it.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    // ---- lifecycle --------------------------------------------------------

    fn set_ready(&self) {
        let mut run = self.run.lock();
        run.ready = true;
        self.cond.notify_all();
    }

    /// Block until the chain is ready. False if teardown began first.
    pub(crate) fn wait_ready(&self) -> bool {
        let mut run = self.run.lock();
        while !run.ready && run.phase == Phase::Running {
            self.cond.wait(&mut run);
        }
        run.ready && run.phase != Phase::Stopped
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let mut run = self.run.lock();
        match run.phase {
            Phase::Running => return Ok(()),
            Phase::Stopping | Phase::Stopped => return Err(MessengerError::ShutDown),
            Phase::Idle => {}
        }
        let endpoint = Arc::clone(self);
        let worker = thread::Builder::new()
            .name(format!("msgr-dispatch-{}", self.addr().port()))
            .spawn(move || worker::run(endpoint))
            .map_err(|e| MessengerError::Worker(e.to_string()))?;
        run.worker_id = Some(worker.thread().id());
        run.worker = Some(worker);
        run.phase = Phase::Running;
        self.cond.notify_all();
        info!(addr = %self.addr(), "loopback endpoint started");
        Ok(())
    }

    fn shutdown(&self) {
        let prev = {
            let mut run = self.run.lock();
            let prev = run.phase;
            run.phase = match prev {
                Phase::Idle => Phase::Stopped,
                Phase::Running => Phase::Stopping,
                other => other,
            };
            self.cond.notify_all();
            prev
        };
        if !matches!(prev, Phase::Idle | Phase::Running) {
            return;
        }
        self.network.unregister(&self.addr());
        self.mark_down_all();
        if prev == Phase::Running {
            self.enqueue(Event::Stop);
        }
        info!(addr = %self.addr(), "loopback endpoint shutting down");
    }

    fn suicide(&self) {
        self.halted.store(true, Ordering::Release);
        self.shutdown();
        warn!(
            addr = %self.addr(),
            queued = self.queued.load(Ordering::Acquire),
            "loopback endpoint halted"
        );
    }

    /// Join the worker. False when called from the worker itself, which
    /// cannot join itself and exits on its own after the stop.
    fn wait(&self) -> bool {
        let mut run = self.run.lock();
        if run.worker_id == Some(thread::current().id()) {
            return false;
        }
        loop {
            if run.phase == Phase::Stopped {
                return true;
            }
            let Some(worker) = run.worker.take() else {
                self.cond.wait(&mut run);
                continue;
            };
            drop(run);
            if worker.join().is_err() {
                error!(addr = %self.addr(), "dispatch worker panicked");
            }
            run = self.run.lock();
            run.phase = Phase::Stopped;
            self.cond.notify_all();
            return true;
        }
    }

    // ---- sessions ---------------------------------------------------------

    fn session(&self, addr: &EntityAddr) -> Option<Arc<LoopbackConnection>> {
        let con = self.sessions.get(addr).map(|e| Arc::clone(e.value()));
        con.filter(|c| c.is_connected())
    }

    /// Our half of the session behind `con`.
    fn resolve(&self, con: &ConnectionRef) -> Result<Arc<LoopbackConnection>> {
        let found = self
            .sessions
            .get(&con.peer_addr())
            .map(|e| Arc::clone(e.value()))
            .filter(|c| c.id() == con.id());
        match found {
            Some(c) => Ok(c),
            None if !con.is_connected() => Err(MessengerError::ConnectionClosed(con.id())),
            None => Err(MessengerError::UnknownConnection(con.id())),
        }
    }

    fn connect(self: &Arc<Self>, dest: &EntityInst) -> Result<Arc<LoopbackConnection>> {
        self.check_running()?;
        if let Some(con) = self.session(&dest.addr) {
            return Ok(con);
        }
        let peer = self
            .network
            .lookup(&dest.addr)
            .ok_or(MessengerError::ConnectionRefused(dest.addr))?;
        let me = self.me();
        let to_self = Arc::ptr_eq(&peer, self);

        let ours = self.policies.policy_for(dest.name.ty);
        let theirs = peer.policies.policy_for(me.name.ty);
        for missing in [
            ours.missing_features(theirs.features_supported),
            theirs.missing_features(ours.features_supported),
        ] {
            if !missing.is_empty() {
                warn!(peer = %dest, %missing, "handshake feature mismatch");
                return Err(MessengerError::FeatureMismatch {
                    peer: dest.addr,
                    missing,
                });
            }
        }

        let auth_failed = |reason: &str| MessengerError::AuthFailed {
            peer_type: dest.name.ty,
            reason: reason.to_string(),
        };
        let authorizer = self
            .chain()
            .deliver_get_authorizer(dest.name.ty, false)
            .ok_or_else(|| auth_failed("no authorizer for peer type"))?;

        let features = ours.features_supported & theirs.features_supported;
        let local = Arc::new(LoopbackConnection::new(
            self.network.next_connection_id(),
            dest.addr,
            dest.name.ty,
            features,
            ours.lossy,
            Arc::downgrade(self),
        ));
        let remote = if to_self {
            Arc::clone(&local)
        } else {
            Arc::new(LoopbackConnection::new(
                self.network.next_connection_id(),
                me.addr,
                me.name.ty,
                features,
                theirs.lossy,
                Arc::downgrade(&peer),
            ))
        };

        let remote_ref = Arc::clone(&remote) as ConnectionRef;
        match peer.chain().deliver_verify_authorizer(
            &remote_ref,
            me.name.ty,
            authorizer.protocol,
            &authorizer.payload,
        ) {
            Some(verdict) if verdict.valid => {}
            Some(_) => return Err(auth_failed("authorizer rejected")),
            None => return Err(auth_failed("authorizer not recognised")),
        }
        LoopbackConnection::pair(&local, &remote);

        {
            let _sessions = self.network.session_lock();
            if let Some(existing) = self.session(&dest.addr) {
                return Ok(existing);
            }
            if !self.network.is_bound(&dest.addr) {
                return Err(MessengerError::ConnectionRefused(dest.addr));
            }
            self.sessions.insert(dest.addr, Arc::clone(&local));
            if !to_self {
                peer.sessions.insert(me.addr, Arc::clone(&remote));
            }
        }

        info!(
            connection = %local.id(),
            peer = %dest,
            %features,
            lossy = local.is_lossy(),
            "session established"
        );
        self.enqueue(Event::Connect(Arc::clone(&local) as ConnectionRef));
        if !to_self {
            peer.enqueue(Event::Connect(remote_ref));
        }
        Ok(local)
    }

    fn send_on(&self, con: &Arc<LoopbackConnection>, mut msg: Message) -> Result<()> {
        self.check_running()?;
        let closed = || MessengerError::ConnectionClosed(con.id());
        if !con.is_connected() {
            return Err(closed());
        }
        let remote = con.peer().ok_or_else(closed)?;
        let peer = remote.owner().ok_or_else(closed)?;

        msg.set_source(self.me());
        msg.set_seq(con.next_seq());
        let charge = peer
            .policies
            .policy_for(remote.peer_type())
            .throttler
            .clone()
            .map(|t| Charge::take(t, msg.payload().len() as u64));
        msg.set_connection(Arc::clone(&remote) as ConnectionRef);

        trace!(connection = %con.id(), %msg, "queueing message");
        counter!("msgr_loopback_sent_total").increment(1);
        peer.enqueue(Event::Message { msg, charge });
        Ok(())
    }

    fn keepalive_on(&self, con: &Arc<LoopbackConnection>) -> Result<()> {
        self.check_running()?;
        let closed = || MessengerError::ConnectionClosed(con.id());
        if !con.is_connected() {
            return Err(closed());
        }
        let remote = con.peer().ok_or_else(closed)?;
        let peer = remote.owner().ok_or_else(closed)?;
        peer.enqueue(Event::Keepalive(remote));
        Ok(())
    }

    /// Close both halves of the session `con` belongs to and notify the
    /// other side. `con` must be owned by this endpoint.
    pub(crate) fn tear_down(&self, con: &Arc<LoopbackConnection>) {
        let _sessions = self.network.session_lock();
        if !con.close() {
            return;
        }
        self.sessions
            .remove_if(&con.peer_addr(), |_, c| Arc::ptr_eq(c, con));
        debug!(connection = %con.id(), peer = %con.peer_addr(), "marked down");

        let Some(remote) = con.peer() else {
            return;
        };
        if !remote.close() {
            return;
        }
        let Some(owner) = remote.owner() else {
            return;
        };
        owner
            .sessions
            .remove_if(&remote.peer_addr(), |_, c| Arc::ptr_eq(c, &remote));
        let remote_ref = Arc::clone(&remote) as ConnectionRef;
        if remote.is_lossy() || remote.is_disposable() {
            owner.enqueue(Event::Reset(remote_ref));
        } else {
            owner.enqueue(Event::RemoteReset(remote_ref));
        }
    }

    fn mark_down_addr(&self, addr: &EntityAddr) {
        let con = self.sessions.get(addr).map(|e| Arc::clone(e.value()));
        if let Some(con) = con {
            self.tear_down(&con);
        }
    }

    fn mark_down_on_empty(&self, con: &Arc<LoopbackConnection>) {
        match con.peer().and_then(|remote| remote.owner()) {
            Some(peer) => peer.enqueue(Event::CloseAfterDrain(Arc::clone(con))),
            None => self.tear_down(con),
        }
    }

    fn mark_down_all(&self) {
        let all: Vec<_> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for con in all {
            self.tear_down(&con);
        }
    }

    fn set_ip(self: &Arc<Self>, ip: IpAddr) {
        let (old, new) = {
            let mut addr = self.addr.write();
            let old = *addr;
            addr.set_ip(ip);
            (old, *addr)
        };
        if old == new {
            return;
        }
        self.network.unregister(&old);
        if let Err(e) = self.network.register(new, self) {
            warn!(%old, %new, error = %e, "could not re-register after address change");
        }
    }

    fn rebind(self: &Arc<Self>, avoid_port: u16) -> Result<()> {
        let new = self.network.allocate_addr(Some(avoid_port))?;
        self.mark_down_all();
        let old = std::mem::replace(&mut *self.addr.write(), new);
        self.network.unregister(&old);
        self.network.register(new, self)?;
        info!(%old, %new, "rebound");
        Ok(())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.handle.myname())
            .field("addr", &self.addr())
            .field("phase", &self.phase())
            .field("sessions", &self.sessions.len())
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .finish()
    }
}

/// In-process transport bound to a [`LoopbackNetwork`].
///
/// # Example
///
/// ```ignore
/// let network = LoopbackNetwork::new();
/// let osd = MessengerBuilder::new(EntityName::osd(0))
///     .build(|handle| LoopbackTransport::bind(&network, handle, PolicySet::default()))?;
/// osd.add_dispatcher_tail(Arc::new(MyDispatcher));
/// osd.start()?;
/// ```
#[derive(Debug)]
pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
}

impl LoopbackTransport {
    /// Bind to the next free address on `network`.
    pub fn bind(
        network: &LoopbackNetwork,
        handle: Arc<MessengerHandle>,
        policies: PolicySet,
    ) -> Result<Self> {
        let addr = network.allocate_addr(None)?;
        Self::bind_to(network, addr, handle, policies)
    }

    /// Bind to `addr`; fails if another live endpoint holds it.
    pub fn bind_to(
        network: &LoopbackNetwork,
        addr: EntityAddr,
        handle: Arc<MessengerHandle>,
        policies: PolicySet,
    ) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let endpoint = Arc::new(Endpoint {
            network: network.clone(),
            handle,
            policies,
            addr: RwLock::new(addr),
            sessions: DashMap::new(),
            tx,
            rx,
            queued: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            run: Mutex::new(RunState {
                phase: Phase::Idle,
                ready: false,
                worker: None,
                worker_id: None,
            }),
            cond: Condvar::new(),
        });
        network.register(addr, &endpoint)?;
        Ok(Self { endpoint })
    }

    pub fn policies(&self) -> &PolicySet {
        &self.endpoint.policies
    }

    /// Live session with the peer at `addr`, if any.
    pub fn session(&self, addr: &EntityAddr) -> Option<Arc<LoopbackConnection>> {
        self.endpoint.session(addr)
    }

    pub fn session_count(&self) -> usize {
        self.endpoint.sessions.len()
    }
}

impl Transport for LoopbackTransport {
    fn my_addr(&self) -> EntityAddr {
        self.endpoint.addr()
    }

    fn set_ip(&self, ip: IpAddr) {
        self.endpoint.set_ip(ip);
    }

    fn ready(&self) {
        debug!(addr = %self.endpoint.addr(), "chain ready; dispatch enabled");
        self.endpoint.set_ready();
    }

    fn start(&self) -> Result<()> {
        self.endpoint.start()
    }

    fn shutdown(&self) -> Result<()> {
        self.endpoint.shutdown();
        Ok(())
    }

    fn suicide(&self) {
        self.endpoint.suicide();
    }

    fn wait(&self) -> bool {
        self.endpoint.wait()
    }

    fn dispatch_queue_len(&self) -> usize {
        self.endpoint.queued.load(Ordering::Acquire)
    }

    fn prepare_dest(&self, dest: &EntityInst) {
        trace!(%dest, "prepare_dest");
    }

    fn send_message(&self, msg: Message, dest: &EntityInst) -> Result<()> {
        let con = self.endpoint.connect(dest)?;
        self.endpoint.send_on(&con, msg)
    }

    fn send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()> {
        let con = self.endpoint.resolve(con)?;
        self.endpoint.send_on(&con, msg)
    }

    fn lazy_send_message(&self, msg: Message, dest: &EntityInst) -> Result<()> {
        self.endpoint.check_running()?;
        match self.endpoint.session(&dest.addr) {
            Some(con) => self.endpoint.send_on(&con, msg),
            None => {
                debug!(%dest, %msg, "no session; dropping lazy send");
                counter!("msgr_loopback_dropped_total").increment(1);
                Ok(())
            }
        }
    }

    fn lazy_send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()> {
        self.endpoint.check_running()?;
        if !con.is_connected() {
            debug!(connection = %con.id(), %msg, "connection down; dropping lazy send");
            counter!("msgr_loopback_dropped_total").increment(1);
            return Ok(());
        }
        let con = self.endpoint.resolve(con)?;
        self.endpoint.send_on(&con, msg)
    }

    fn send_keepalive(&self, dest: &EntityInst) -> Result<()> {
        let con = self.endpoint.connect(dest)?;
        self.endpoint.keepalive_on(&con)
    }

    fn send_keepalive_on(&self, con: &ConnectionRef) -> Result<()> {
        let con = self.endpoint.resolve(con)?;
        self.endpoint.keepalive_on(&con)
    }

    fn mark_down(&self, addr: &EntityAddr) {
        self.endpoint.mark_down_addr(addr);
    }

    fn mark_down_connection(&self, con: &ConnectionRef) {
        if let Ok(con) = self.endpoint.resolve(con) {
            self.endpoint.tear_down(&con);
        }
    }

    fn mark_down_on_empty(&self, con: &ConnectionRef) {
        if let Ok(con) = self.endpoint.resolve(con) {
            self.endpoint.mark_down_on_empty(&con);
        }
    }

    fn mark_disposable(&self, con: &ConnectionRef) {
        if let Ok(con) = self.endpoint.resolve(con) {
            con.set_disposable();
        }
    }

    fn mark_down_all(&self) {
        self.endpoint.mark_down_all();
    }

    fn get_connection(&self, dest: &EntityInst) -> Result<ConnectionRef> {
        let con = self.endpoint.connect(dest)?;
        Ok(con as ConnectionRef)
    }

    fn rebind(&self, avoid_port: u16) -> Result<()> {
        self.endpoint.rebind(avoid_port)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.endpoint.shutdown();
        if !self.endpoint.wait() {
            debug!(addr = %self.endpoint.addr(), "transport dropped on its own worker");
        }
    }
}
