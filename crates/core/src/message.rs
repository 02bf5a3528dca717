//! Messages as seen by the messenger layer.
//!
//! Payload encoding belongs to protocol engines; here a message is an
//! opaque byte payload plus the routing metadata the transport and the
//! delivery protocol need.

use crate::connection::ConnectionRef;
use crate::entity::EntityInst;
use bytes::Bytes;
use std::fmt;
use std::time::SystemTime;

pub const PRIO_LOW: i32 = 64;
pub const PRIO_DEFAULT: i32 = 127;
pub const PRIO_HIGH: i32 = 196;
pub const PRIO_HIGHEST: i32 = 255;

/// Routing metadata carried with every message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Protocol-defined message type code.
    pub msg_type: u16,
    /// Zero means "use the messenger's default send priority".
    pub priority: i32,
    /// Per-connection sequence number, assigned by the transport.
    pub seq: u64,
    /// Sender instance, stamped by the transport on the way out.
    pub source: Option<EntityInst>,
}

/// An addressed message.
#[derive(Clone)]
pub struct Message {
    header: MessageHeader,
    payload: Bytes,
    dispatch_stamp: Option<SystemTime>,
    connection: Option<ConnectionRef>,
}

impl Message {
    pub fn new(msg_type: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            header: MessageHeader {
                msg_type,
                ..MessageHeader::default()
            },
            payload: payload.into(),
            dispatch_stamp: None,
            connection: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.header.priority = priority;
        self
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn msg_type(&self) -> u16 {
        self.header.msg_type
    }

    pub fn priority(&self) -> i32 {
        self.header.priority
    }

    pub fn set_priority(&mut self, priority: i32) {
        self.header.priority = priority;
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn set_seq(&mut self, seq: u64) {
        self.header.seq = seq;
    }

    pub fn source(&self) -> Option<&EntityInst> {
        self.header.source.as_ref()
    }

    pub fn set_source(&mut self, source: EntityInst) {
        self.header.source = Some(source);
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// When the delivery protocol handed the message to the chain.
    pub fn dispatch_stamp(&self) -> Option<SystemTime> {
        self.dispatch_stamp
    }

    pub fn set_dispatch_stamp(&mut self, stamp: SystemTime) {
        self.dispatch_stamp = Some(stamp);
    }

    /// Connection the message arrived on, if any.
    pub fn connection(&self) -> Option<&ConnectionRef> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, con: ConnectionRef) {
        self.connection = Some(con);
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("len", &self.payload.len())
            .field("dispatch_stamp", &self.dispatch_stamp)
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "msg(type={} seq={} prio={} len={})",
            self.header.msg_type,
            self.header.seq,
            self.header.priority,
            self.payload.len()
        )
    }
}
