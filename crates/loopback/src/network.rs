//! Shared registry of bound loopback endpoints.
//!
//! A [`LoopbackNetwork`] plays the role of the wire: every transport bound
//! to it is reachable by its [`EntityAddr`]. Cloning the network shares
//! the registry.

use crate::transport::Endpoint;
use dashmap::DashMap;
use msgr_core::{ConnectionId, EntityAddr, MessengerError, Result};
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// First port handed out by [`LoopbackNetwork::new`].
pub const DEFAULT_BASE_PORT: u16 = 6800;

#[derive(Clone, Debug)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Debug)]
struct NetworkInner {
    ip: IpAddr,
    base_port: u16,
    endpoints: DashMap<EntityAddr, Weak<Endpoint>>,
    next_port: Mutex<u16>,
    next_nonce: AtomicU32,
    next_connection: AtomicU64,
    /// Serializes session table updates across endpoints.
    sessions: Mutex<()>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_BASE_PORT)
    }

    /// Network handing out addresses on `ip` starting at `base_port`.
    pub fn with_ip(ip: IpAddr, base_port: u16) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                ip,
                base_port,
                endpoints: DashMap::new(),
                next_port: Mutex::new(base_port),
                next_nonce: AtomicU32::new(1),
                next_connection: AtomicU64::new(1),
                sessions: Mutex::new(()),
            }),
        }
    }

    /// Number of endpoints currently bound.
    pub fn len(&self) -> usize {
        self.inner.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.endpoints.is_empty()
    }

    pub fn is_bound(&self, addr: &EntityAddr) -> bool {
        self.lookup(addr).is_some()
    }

    /// Fresh address whose port differs from `avoid_port` and every bound port.
    pub(crate) fn allocate_addr(&self, avoid_port: Option<u16>) -> Result<EntityAddr> {
        let mut next = self.inner.next_port.lock();
        let span = u32::from(u16::MAX - self.inner.base_port) + 1;
        for _ in 0..span {
            let port = *next;
            *next = if port == u16::MAX {
                self.inner.base_port
            } else {
                port + 1
            };
            if Some(port) == avoid_port || self.port_in_use(port) {
                continue;
            }
            let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
            return Ok(EntityAddr::new(SocketAddr::new(self.inner.ip, port), nonce));
        }
        Err(MessengerError::Bind("no free loopback port".to_string()))
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.inner.endpoints.iter().any(|e| e.key().port() == port)
    }

    pub(crate) fn register(&self, addr: EntityAddr, endpoint: &Arc<Endpoint>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.inner.endpoints.entry(addr) {
            Entry::Occupied(mut slot) => {
                if slot.get().upgrade().is_some() {
                    return Err(MessengerError::Bind(format!("{} already in use", addr)));
                }
                slot.insert(Arc::downgrade(endpoint));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::downgrade(endpoint));
            }
        }
        debug!(%addr, "endpoint bound");
        Ok(())
    }

    pub(crate) fn unregister(&self, addr: &EntityAddr) {
        if self.inner.endpoints.remove(addr).is_some() {
            debug!(%addr, "endpoint unbound");
        }
    }

    pub(crate) fn lookup(&self, addr: &EntityAddr) -> Option<Arc<Endpoint>> {
        self.inner.endpoints.get(addr).and_then(|e| e.upgrade())
    }

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn session_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.inner.sessions.lock()
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}
