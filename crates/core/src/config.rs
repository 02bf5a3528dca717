//! Messenger configuration.
//!
//! Loaded from JSON; every field has a default so a partial document
//! (or `{}`) is valid.
//!
//! ```json
//! {
//!   "default_send_priority": 196,
//!   "default_policy": { "role": "client" },
//!   "peer_policies": {
//!     "osd": { "role": "stateless_server", "throttle_bytes": 104857600 }
//!   }
//! }
//! ```

use crate::entity::EntityType;
use crate::error::{MessengerError, Result};
use crate::features::FeatureSet;
use crate::message::PRIO_DEFAULT;
use crate::policy::{Policy, PolicySet};
use crate::throttle::Throttle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Which canonical policy constructor to use.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRole {
    StatefulServer,
    StatelessServer,
    LosslessPeer,
    #[default]
    Client,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub role: PolicyRole,
    /// Extra features on top of the baseline.
    pub features_supported: FeatureSet,
    pub features_required: FeatureSet,
    /// In-flight byte budget; 0 means no throttle.
    pub throttle_bytes: u64,
}

impl PolicyConfig {
    /// Build the policy. `throttle_name` labels the throttle, if any.
    pub fn to_policy(&self, throttle_name: &str) -> Policy {
        let (sup, req) = (self.features_supported, self.features_required);
        let policy = match self.role {
            PolicyRole::StatefulServer => Policy::stateful_server(sup, req),
            PolicyRole::StatelessServer => Policy::stateless_server(sup, req),
            PolicyRole::LosslessPeer => Policy::lossless_peer(sup, req),
            PolicyRole::Client => Policy::client(sup, req),
        };
        if self.throttle_bytes > 0 {
            policy.with_throttler(Arc::new(Throttle::new(throttle_name, self.throttle_bytes)))
        } else {
            policy
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    pub default_send_priority: i32,
    pub default_policy: PolicyConfig,
    pub peer_policies: BTreeMap<EntityType, PolicyConfig>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            default_send_priority: PRIO_DEFAULT,
            default_policy: PolicyConfig::default(),
            peer_policies: BTreeMap::new(),
        }
    }
}

impl MessengerConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| MessengerError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MessengerError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Policy table described by this config.
    pub fn policy_set(&self) -> PolicySet {
        let mut set = PolicySet::new(self.default_policy.to_policy("default"));
        for (peer_type, cfg) in &self.peer_policies {
            set.set_policy(*peer_type, cfg.to_policy(peer_type.as_str()));
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let cfg = MessengerConfig::from_json_str("{}").unwrap();
        assert_eq!(cfg, MessengerConfig::default());
        assert_eq!(cfg.default_send_priority, PRIO_DEFAULT);
    }

    #[test]
    fn test_peer_policies() {
        let cfg = MessengerConfig::from_json_str(
            r#"{
                "default_send_priority": 196,
                "peer_policies": {
                    "osd": { "role": "stateless_server", "throttle_bytes": 1024 },
                    "mon": { "role": "lossless_peer", "features_required": 4 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_send_priority, 196);

        let set = cfg.policy_set();
        let osd = set.policy_for(EntityType::Osd);
        assert!(osd.lossy && osd.server);
        assert_eq!(osd.throttler.as_ref().unwrap().max(), 1024);

        let mon = set.policy_for(EntityType::Mon);
        assert!(!mon.lossy && !mon.server);
        assert_eq!(mon.features_required, FeatureSet::MONCLOCKCHECK);

        assert!(set.policy_for(EntityType::Client).throttler.is_none());
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = MessengerConfig::from_json_str("{ nope").unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
