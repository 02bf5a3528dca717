//! Delivery protocol: how each event kind fans out over the chain.
//!
//! | Event                   | Rule      | Stops at                          |
//! |-------------------------|-----------|-----------------------------------|
//! | message dispatch        | claim     | first `Dispatched::Claimed`       |
//! | connection established  | broadcast | never                             |
//! | local reset             | claim     | first `true`                      |
//! | remote reset            | broadcast | never                             |
//! | authorizer issuance     | claim     | first `Some(authorizer)`          |
//! | authorizer verification | claim     | first `Some(verdict)`             |
//!
//! Every entry point walks a snapshot of the chain in registration order
//! and calls each dispatcher synchronously.
//!
//! An inbound message that nobody claims is fatal. Each local identity is
//! expected to cover every message type it can receive, so an unclaimed
//! message is a protocol-coverage bug and must not be dropped quietly.

use crate::auth::{AuthVerdict, Authorizer};
use crate::connection::ConnectionRef;
use crate::dispatch::chain::DispatcherChain;
use crate::dispatch::traits::Dispatched;
use crate::entity::EntityType;
use crate::message::Message;
use metrics::counter;
use tracing::{error, trace};

impl DispatcherChain {
    /// Stamp `msg` and offer it to each dispatcher until one claims it.
    ///
    /// # Aborts
    ///
    /// Aborts the process after logging a diagnostic if no dispatcher
    /// claims the message, including when the chain is empty. Unwinding is
    /// not enough: it would only end the calling delivery thread.
    pub fn deliver_dispatch(&self, mut msg: Message) {
        msg.set_dispatch_stamp(self.clock.now());
        let chain = self.snapshot();
        for dispatcher in chain.iter() {
            match dispatcher.on_dispatch(msg) {
                Dispatched::Claimed => {
                    trace!(dispatcher = dispatcher.name(), "message claimed");
                    counter!("msgr_dispatch_claimed_total").increment(1);
                    return;
                }
                Dispatched::Declined(declined) => msg = declined,
            }
        }
        unhandled(msg)
    }

    /// Tell every dispatcher that `con` is established.
    pub fn deliver_connect(&self, con: &ConnectionRef) {
        counter!("msgr_connect_total").increment(1);
        for dispatcher in self.snapshot().iter() {
            dispatcher.on_connect(con);
        }
    }

    /// Offer a local reset until one dispatcher takes it. Returns whether
    /// any did.
    pub fn deliver_reset(&self, con: &ConnectionRef) -> bool {
        counter!("msgr_reset_total").increment(1);
        for dispatcher in self.snapshot().iter() {
            if dispatcher.on_reset(con) {
                trace!(dispatcher = dispatcher.name(), connection = %con.id(), "reset handled");
                return true;
            }
        }
        false
    }

    /// Tell every dispatcher that the peer behind `con` reset its session.
    pub fn deliver_remote_reset(&self, con: &ConnectionRef) {
        counter!("msgr_remote_reset_total").increment(1);
        for dispatcher in self.snapshot().iter() {
            dispatcher.on_remote_reset(con);
        }
    }

    /// First authorizer any dispatcher issues for a `peer_type` peer.
    ///
    /// `None` must be treated by the transport as an authentication failure.
    pub fn deliver_get_authorizer(
        &self,
        peer_type: EntityType,
        force_new: bool,
    ) -> Option<Authorizer> {
        self.snapshot()
            .iter()
            .find_map(|d| d.issue_authorizer(peer_type, force_new))
    }

    /// First definitive verdict any dispatcher gives for `authorizer`.
    ///
    /// `None` means nobody recognised it; the transport must reject the peer.
    pub fn deliver_verify_authorizer(
        &self,
        con: &ConnectionRef,
        peer_type: EntityType,
        protocol: u32,
        authorizer: &[u8],
    ) -> Option<AuthVerdict> {
        self.snapshot()
            .iter()
            .find_map(|d| d.verify_authorizer(con, peer_type, protocol, authorizer))
    }
}

#[cold]
fn unhandled(msg: Message) -> ! {
    counter!("msgr_dispatch_unhandled_total").increment(1);
    let source = msg
        .source()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "<unknown>".to_string());
    let diagnostic = format!(
        "deliver_dispatch: fatal error: unhandled message {} {:?} from {}",
        msg, msg, source
    );
    error!(msg = %msg, source = %source, "{}", diagnostic);
    // abort skips subscriber flushing
    eprintln!("{}", diagnostic);
    std::process::abort()
}
