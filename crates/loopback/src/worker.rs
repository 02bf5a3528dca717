//! Per-endpoint dispatch worker.
//!
//! Each endpoint owns one FIFO event queue drained by one thread, so the
//! dispatcher chain sees events in the order they were enqueued. The
//! worker holds off until the chain is ready, then runs until it pops
//! [`Event::Stop`] or finds the endpoint halted.

use crate::connection::LoopbackConnection;
use crate::transport::Endpoint;
use metrics::counter;
use msgr_core::{Clock, Connection, ConnectionRef, Message, Throttle};
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) enum Event {
    /// Session established; broadcast to the chain.
    Connect(ConnectionRef),
    Message {
        msg: Message,
        charge: Option<Charge>,
    },
    Keepalive(Arc<LoopbackConnection>),
    /// The session died on our side; claim-based.
    Reset(ConnectionRef),
    /// The peer dropped the session; broadcast.
    RemoteReset(ConnectionRef),
    /// Tear down this connection now that everything queued before it
    /// has been delivered.
    CloseAfterDrain(Arc<LoopbackConnection>),
    Stop,
}

/// Throttle units held by a queued message; returned on drop.
pub(crate) struct Charge {
    throttle: Arc<Throttle>,
    units: u64,
}

impl Charge {
    /// Take `units` from `throttle`, blocking until they fit.
    pub(crate) fn take(throttle: Arc<Throttle>, units: u64) -> Self {
        throttle.take(units);
        Self { throttle, units }
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.throttle.put(self.units);
    }
}

pub(crate) fn run(endpoint: Arc<Endpoint>) {
    let rx = endpoint.receiver();
    let mut dropped = 0usize;
    if endpoint.wait_ready() {
        for event in rx.iter() {
            if let Event::Stop = event {
                break;
            }
            if endpoint.is_halted() {
                dropped += discard(&endpoint, event);
                break;
            }
            handle(&endpoint, event);
        }
    }

    // Whatever is left was queued after teardown began.
    for event in rx.try_iter() {
        dropped += discard(&endpoint, event);
    }
    if dropped > 0 {
        counter!("msgr_loopback_dropped_total").increment(dropped as u64);
    }
    debug!(addr = %endpoint.addr(), dropped, "dispatch worker exiting");
}

/// Drop an undelivered event, returning its throttle charge. Counts
/// messages only.
fn discard(endpoint: &Endpoint, event: Event) -> usize {
    match event {
        Event::Message { .. } => {
            endpoint.dequeued();
            1
        }
        _ => 0,
    }
}

fn handle(endpoint: &Endpoint, event: Event) {
    let chain = endpoint.chain();
    match event {
        Event::Connect(con) => chain.deliver_connect(&con),
        Event::Message { msg, charge } => {
            endpoint.dequeued();
            let live = msg.connection().map_or(true, |con| con.is_connected());
            if live {
                chain.deliver_dispatch(msg);
            } else {
                trace!(%msg, "dropping message for closed connection");
                counter!("msgr_loopback_dropped_total").increment(1);
            }
            drop(charge);
        }
        Event::Keepalive(con) => con.touch_keepalive(chain.clock().now()),
        Event::Reset(con) => {
            if !chain.deliver_reset(&con) {
                debug!(connection = %con.id(), peer = %con.peer_addr(), "reset not claimed");
            }
        }
        Event::RemoteReset(con) => chain.deliver_remote_reset(&con),
        Event::CloseAfterDrain(con) => {
            if let Some(owner) = con.owner() {
                owner.tear_down(&con);
            }
        }
        Event::Stop => {}
    }
}
