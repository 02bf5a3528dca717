//! Per-connection-class policies.
//!
//! A [`Policy`] is a passive value: it records whether a class of
//! connections is lossy, which side plays server, which features we
//! support and require, and an optional shared [`Throttle`]. Transports
//! consult it during handshake and flow control; nothing here enforces it.

use crate::entity::EntityType;
use crate::features::FeatureSet;
use crate::throttle::Throttle;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Negotiated behavior for one class of peer connections.
#[derive(Clone)]
pub struct Policy {
    /// Drop the session (rather than replay) when the connection faults.
    pub lossy: bool,
    /// We never initiate reconnects to this peer class.
    pub server: bool,
    /// Optional in-flight budget shared with other policies.
    pub throttler: Option<Arc<Throttle>>,
    /// Always includes [`FeatureSet::SUPPORTED_DEFAULT`].
    pub features_supported: FeatureSet,
    /// Features the peer must advertise for the handshake to succeed.
    pub features_required: FeatureSet,
}

impl Policy {
    fn with_role(lossy: bool, server: bool, sup: FeatureSet, req: FeatureSet) -> Self {
        Self {
            lossy,
            server,
            throttler: None,
            features_supported: sup | FeatureSet::SUPPORTED_DEFAULT,
            features_required: req,
        }
    }

    pub fn stateful_server(sup: FeatureSet, req: FeatureSet) -> Self {
        Self::with_role(false, true, sup, req)
    }

    pub fn stateless_server(sup: FeatureSet, req: FeatureSet) -> Self {
        Self::with_role(true, true, sup, req)
    }

    pub fn lossless_peer(sup: FeatureSet, req: FeatureSet) -> Self {
        Self::with_role(false, false, sup, req)
    }

    pub fn client(sup: FeatureSet, req: FeatureSet) -> Self {
        Self::with_role(false, false, sup, req)
    }

    pub fn with_throttler(mut self, throttler: Arc<Throttle>) -> Self {
        self.throttler = Some(throttler);
        self
    }

    /// Required features the peer does not advertise.
    pub fn missing_features(&self, peer_supported: FeatureSet) -> FeatureSet {
        self.features_required.missing_from(peer_supported)
    }

    /// True if a peer advertising `peer_supported` satisfies this policy.
    pub fn accepts(&self, peer_supported: FeatureSet) -> bool {
        self.missing_features(peer_supported).is_empty()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::with_role(false, false, FeatureSet::EMPTY, FeatureSet::EMPTY)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("lossy", &self.lossy)
            .field("server", &self.server)
            .field("throttler", &self.throttler.as_ref().map(|t| t.name()))
            .field("features_supported", &self.features_supported)
            .field("features_required", &self.features_required)
            .finish()
    }
}

/// Policy table keyed by peer entity type, with a fallback default.
#[derive(Clone, Debug, Default)]
pub struct PolicySet {
    default: Policy,
    by_type: BTreeMap<EntityType, Policy>,
}

impl PolicySet {
    pub fn new(default: Policy) -> Self {
        Self {
            default,
            by_type: BTreeMap::new(),
        }
    }

    pub fn set_default_policy(&mut self, policy: Policy) {
        self.default = policy;
    }

    pub fn set_policy(&mut self, peer_type: EntityType, policy: Policy) {
        self.by_type.insert(peer_type, policy);
    }

    /// Policy for `peer_type`, falling back to the default.
    pub fn policy_for(&self, peer_type: EntityType) -> &Policy {
        self.by_type.get(&peer_type).unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &Policy {
        &self.default
    }
}
