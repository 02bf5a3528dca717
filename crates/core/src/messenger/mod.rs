//! The messenger front object.
//!
//! [`Messenger`] ties together a local identity, the lifecycle state
//! machine, the dispatcher chain and a concrete [`Transport`]. The
//! transport holds an `Arc<MessengerHandle>` so it can read our name and
//! drive delivery without owning the messenger itself.

pub mod builder;

pub use builder::MessengerBuilder;

use crate::connection::ConnectionRef;
use crate::dispatch::{DispatcherChain, DispatcherRef};
use crate::entity::{EntityAddr, EntityInst, EntityName};
use crate::error::{MessengerError, Result};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::message::Message;
use crate::transport::Transport;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The part of a messenger a transport keeps: identity and the chain.
#[derive(Debug)]
pub struct MessengerHandle {
    name: RwLock<EntityName>,
    chain: DispatcherChain,
}

impl MessengerHandle {
    pub fn new(name: EntityName, chain: DispatcherChain) -> Self {
        Self {
            name: RwLock::new(name),
            chain,
        }
    }

    pub fn myname(&self) -> EntityName {
        *self.name.read()
    }

    pub fn chain(&self) -> &DispatcherChain {
        &self.chain
    }
}

/// Addressed peer messaging over a transport `T`.
pub struct Messenger<T: Transport> {
    handle: Arc<MessengerHandle>,
    lifecycle: Lifecycle,
    default_send_priority: AtomicI32,
    transport: T,
}

impl<T: Transport> Messenger<T> {
    pub(crate) fn from_parts(handle: Arc<MessengerHandle>, priority: i32, transport: T) -> Self {
        Self {
            handle,
            lifecycle: Lifecycle::new(),
            default_send_priority: AtomicI32::new(priority),
            transport,
        }
    }

    pub fn handle(&self) -> &Arc<MessengerHandle> {
        &self.handle
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ---- identity ---------------------------------------------------------

    pub fn myname(&self) -> EntityName {
        self.handle.myname()
    }

    /// Rename the local entity.
    ///
    /// Operations already in flight may still use the old name; callers
    /// serialize renames with their own traffic.
    pub fn set_myname(&self, name: EntityName) {
        let old = std::mem::replace(&mut *self.handle.name.write(), name);
        info!(%old, new = %name, "renamed messenger");
    }

    pub fn myaddr(&self) -> EntityAddr {
        self.transport.my_addr()
    }

    pub fn myinst(&self) -> EntityInst {
        EntityInst::new(self.myname(), self.myaddr())
    }

    pub fn set_ip(&self, ip: IpAddr) {
        self.transport.set_ip(ip);
    }

    // ---- configuration ----------------------------------------------------

    pub fn default_send_priority(&self) -> i32 {
        self.default_send_priority.load(Ordering::Relaxed)
    }

    /// Set the priority given to messages sent without one.
    ///
    /// # Panics
    ///
    /// Init-time only: panics if called after [`start`](Self::start).
    pub fn set_default_send_priority(&self, priority: i32) {
        let state = self.lifecycle.state();
        assert!(
            state == LifecycleState::Created,
            "set_default_send_priority called in state {}; only valid before start()",
            state
        );
        self.default_send_priority.store(priority, Ordering::Relaxed);
    }

    // ---- dispatchers ------------------------------------------------------

    /// Register `dispatcher` ahead of all others.
    pub fn add_dispatcher_head(&self, dispatcher: DispatcherRef) {
        if self.handle.chain.add_head(dispatcher) {
            self.ready();
        }
    }

    /// Register `dispatcher` after all others.
    pub fn add_dispatcher_tail(&self, dispatcher: DispatcherRef) {
        if self.handle.chain.add_tail(dispatcher) {
            self.ready();
        }
    }

    fn ready(&self) {
        debug!(name = %self.myname(), "dispatcher chain ready");
        self.transport.ready();
    }

    pub fn is_ready(&self) -> bool {
        self.handle.chain.is_ready()
    }

    pub fn dispatch_queue_len(&self) -> usize {
        self.transport.dispatch_queue_len()
    }

    // ---- lifecycle --------------------------------------------------------

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub fn is_started(&self) -> bool {
        self.lifecycle.is_started()
    }

    /// Start the transport. Repeated calls are forwarded to the transport.
    pub fn start(&self) -> Result<()> {
        if matches!(
            self.lifecycle.state(),
            LifecycleState::Stopping | LifecycleState::Stopped
        ) {
            return Err(MessengerError::ShutDown);
        }
        self.transport.start()?;
        if self.lifecycle.mark_started() {
            info!(inst = %self.myinst(), "messenger started");
        }
        Ok(())
    }

    /// Request teardown and return immediately.
    pub fn shutdown(&self) -> Result<()> {
        self.transport.shutdown()?;
        let prev = self.lifecycle.begin_shutdown();
        info!(name = %self.myname(), from = %prev, "messenger shutting down");
        Ok(())
    }

    /// Stop immediately. Queued deliveries are discarded instead of
    /// drained; `wait()` still joins the transport afterwards.
    pub fn suicide(&self) {
        self.transport.suicide();
        let prev = self.lifecycle.begin_shutdown();
        warn!(name = %self.myname(), from = %prev, "messenger stopped abruptly");
    }

    /// Block until teardown is complete.
    ///
    /// Valid without a prior `shutdown()`: it then waits until the
    /// transport stops for some other reason. Called from a dispatcher
    /// callback it cannot join and the state stays `Stopping`.
    pub fn wait(&self) {
        if !self.transport.wait() {
            debug!(name = %self.myname(), "wait returned before transport stopped");
            return;
        }
        self.lifecycle.mark_stopped();
        debug!(name = %self.myname(), "messenger stopped");
    }

    // ---- sending ----------------------------------------------------------

    fn with_default_priority(&self, mut msg: Message) -> Message {
        if msg.priority() == 0 {
            msg.set_priority(self.default_send_priority());
        }
        msg
    }

    pub fn prepare_dest(&self, dest: &EntityInst) {
        self.transport.prepare_dest(dest);
    }

    pub fn send_message(&self, msg: Message, dest: &EntityInst) -> Result<()> {
        let msg = self.with_default_priority(msg);
        self.transport.send_message(msg, dest).map_err(|e| {
            warn!(dest = %dest, kind = e.kind(), error = %e, "send failed");
            e
        })
    }

    pub fn send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()> {
        let msg = self.with_default_priority(msg);
        self.transport.send_message_on(msg, con)
    }

    pub fn lazy_send_message(&self, msg: Message, dest: &EntityInst) -> Result<()> {
        let msg = self.with_default_priority(msg);
        self.transport.lazy_send_message(msg, dest)
    }

    pub fn lazy_send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()> {
        let msg = self.with_default_priority(msg);
        self.transport.lazy_send_message_on(msg, con)
    }

    pub fn send_keepalive(&self, dest: &EntityInst) -> Result<()> {
        self.transport.send_keepalive(dest)
    }

    pub fn send_keepalive_on(&self, con: &ConnectionRef) -> Result<()> {
        self.transport.send_keepalive_on(con)
    }

    // ---- teardown and sessions --------------------------------------------

    pub fn mark_down(&self, addr: &EntityAddr) {
        self.transport.mark_down(addr);
    }

    pub fn mark_down_connection(&self, con: &ConnectionRef) {
        self.transport.mark_down_connection(con);
    }

    pub fn mark_down_on_empty(&self, con: &ConnectionRef) {
        self.transport.mark_down_on_empty(con);
    }

    pub fn mark_disposable(&self, con: &ConnectionRef) {
        self.transport.mark_disposable(con);
    }

    pub fn mark_down_all(&self) {
        self.transport.mark_down_all();
    }

    pub fn get_connection(&self, dest: &EntityInst) -> Result<ConnectionRef> {
        self.transport.get_connection(dest)
    }

    pub fn rebind(&self, avoid_port: u16) -> Result<()> {
        self.transport.rebind(avoid_port)
    }
}

impl<T: Transport> Drop for Messenger<T> {
    fn drop(&mut self) {
        // A started teardown must finish before the transport goes away.
        if self.lifecycle.state() == LifecycleState::Stopping {
            self.wait();
        }
    }
}

impl<T: Transport> std::fmt::Debug for Messenger<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("name", &self.myname())
            .field("state", &self.state())
            .field("default_send_priority", &self.default_send_priority())
            .field("chain", self.handle.chain())
            .finish()
    }
}
