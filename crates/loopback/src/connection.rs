//! In-process peer session.
//!
//! A session is a pair of [`LoopbackConnection`]s, one owned by each
//! endpoint, linked to each other weakly. Sending on one side enqueues on
//! the endpoint that owns the other side.

use crate::transport::Endpoint;
use msgr_core::{Connection, ConnectionId, EntityAddr, EntityType, FeatureSet};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::SystemTime;

pub struct LoopbackConnection {
    id: ConnectionId,
    peer_addr: EntityAddr,
    peer_type: EntityType,
    features: FeatureSet,
    lossy: bool,
    connected: AtomicBool,
    disposable: AtomicBool,
    out_seq: AtomicU64,
    last_keepalive: Mutex<Option<SystemTime>>,
    owner: Weak<Endpoint>,
    peer: OnceLock<Weak<LoopbackConnection>>,
}

impl LoopbackConnection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: EntityAddr,
        peer_type: EntityType,
        features: FeatureSet,
        lossy: bool,
        owner: Weak<Endpoint>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            peer_type,
            features,
            lossy,
            connected: AtomicBool::new(true),
            disposable: AtomicBool::new(false),
            out_seq: AtomicU64::new(0),
            last_keepalive: Mutex::new(None),
            owner,
            peer: OnceLock::new(),
        }
    }

    /// Link the two halves of a session.
    pub(crate) fn pair(a: &Arc<Self>, b: &Arc<Self>) {
        let _ = a.peer.set(Arc::downgrade(b));
        let _ = b.peer.set(Arc::downgrade(a));
    }

    /// The other half of the session, if it still exists.
    pub(crate) fn peer(&self) -> Option<Arc<LoopbackConnection>> {
        self.peer.get().and_then(Weak::upgrade)
    }

    pub(crate) fn owner(&self) -> Option<Arc<Endpoint>> {
        self.owner.upgrade()
    }

    /// Session loss drops queued traffic instead of replaying it.
    pub fn is_lossy(&self) -> bool {
        self.lossy
    }

    pub fn is_disposable(&self) -> bool {
        self.disposable.load(Ordering::Acquire)
    }

    pub(crate) fn set_disposable(&self) {
        self.disposable.store(true, Ordering::Release);
    }

    /// Time the last keepalive from the peer was processed.
    pub fn last_keepalive(&self) -> Option<SystemTime> {
        *self.last_keepalive.lock()
    }

    pub(crate) fn touch_keepalive(&self, at: SystemTime) {
        *self.last_keepalive.lock() = Some(at);
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.out_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Flip to closed. Returns true for the caller that closed it.
    pub(crate) fn close(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }
}

impl Connection for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> EntityAddr {
        self.peer_addr
    }

    fn peer_type(&self) -> EntityType {
        self.peer_type
    }

    fn features(&self) -> FeatureSet {
        self.features
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("id", &self.id)
            .field("peer", &format_args!("{} {}", self.peer_type, self.peer_addr))
            .field("features", &self.features)
            .field("lossy", &self.lossy)
            .field("connected", &self.is_connected())
            .field("disposable", &self.is_disposable())
            .finish()
    }
}
