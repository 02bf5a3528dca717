//! Transport facade: what a concrete transport must provide.
//!
//! A transport moves bytes between peers and reports transport-level
//! events back through the [`DispatcherChain`](crate::DispatcherChain)
//! it was handed at construction (via
//! [`MessengerHandle`](crate::MessengerHandle)). The messenger forwards
//! every send and connection-management call here.
//!
//! # Ordering
//!
//! Sends, addressed or connection-scoped, must preserve FIFO order per
//! connection per calling thread.
//!
//! # Mark-down
//!
//! Teardown need not be synchronous: a dispatcher may still see
//! deliveries on a connection shortly after it was marked down.

use crate::connection::ConnectionRef;
use crate::entity::{EntityAddr, EntityInst};
use crate::error::{MessengerError, Result};
use crate::message::Message;
use std::net::IpAddr;

pub trait Transport: Send + Sync {
    // ---- identity ---------------------------------------------------------

    /// Address this transport is bound to.
    fn my_addr(&self) -> EntityAddr;

    /// Learned our externally visible IP; keep port and nonce.
    fn set_ip(&self, ip: IpAddr);

    // ---- lifecycle hooks --------------------------------------------------

    /// The dispatcher chain went from empty to non-empty. Fired once.
    fn ready(&self) {}

    /// Allocate resources and start execution contexts.
    fn start(&self) -> Result<()>;

    /// Begin teardown. Must not block on in-flight dispatch.
    fn shutdown(&self) -> Result<()>;

    /// Hard stop: end delivery now, discard anything still queued and
    /// tear down every session. Must not block; `wait` joins afterwards.
    fn suicide(&self);

    /// Block until the transport has fully stopped. Returns false when the
    /// wait could not complete, e.g. when called from the transport's own
    /// delivery context.
    fn wait(&self) -> bool;

    /// Messages received but not yet delivered.
    fn dispatch_queue_len(&self) -> usize {
        0
    }

    // ---- sending ----------------------------------------------------------

    /// Hint that we will talk to `dest` soon.
    fn prepare_dest(&self, _dest: &EntityInst) {}

    /// Send to a logical peer, opening a session if needed.
    fn send_message(&self, msg: Message, dest: &EntityInst) -> Result<()>;

    /// Send on an existing connection.
    fn send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()>;

    /// Send only if a session to `dest` already exists; otherwise drop.
    fn lazy_send_message(&self, msg: Message, dest: &EntityInst) -> Result<()> {
        self.send_message(msg, dest)
    }

    /// Send on `con` only if it is still up; otherwise drop.
    fn lazy_send_message_on(&self, msg: Message, con: &ConnectionRef) -> Result<()>;

    fn send_keepalive(&self, dest: &EntityInst) -> Result<()>;

    fn send_keepalive_on(&self, con: &ConnectionRef) -> Result<()>;

    // ---- teardown ---------------------------------------------------------

    /// Tear down any session with the peer at `addr`.
    fn mark_down(&self, addr: &EntityAddr);

    fn mark_down_connection(&self, con: &ConnectionRef);

    /// Tear down once every message already queued on `con` is flushed.
    fn mark_down_on_empty(&self, con: &ConnectionRef);

    /// Flag `con` for reclamation without forcing immediate teardown.
    fn mark_disposable(&self, con: &ConnectionRef);

    fn mark_down_all(&self);

    // ---- sessions ---------------------------------------------------------

    /// Handle to the session with `dest`, creating it if needed.
    ///
    /// Repeated calls return the same logical session until it is torn down.
    fn get_connection(&self, dest: &EntityInst) -> Result<ConnectionRef>;

    /// Move to a new local port, avoiding `avoid_port`.
    fn rebind(&self, _avoid_port: u16) -> Result<()> {
        Err(MessengerError::NotSupported("rebind"))
    }
}
