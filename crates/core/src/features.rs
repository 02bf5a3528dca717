//! Feature bitmasks exchanged during connection negotiation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Set of protocol features, one bit each.
///
/// Transports advertise a supported set and demand a required set; the
/// handshake fails when the peer's supported set does not cover ours.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet(pub u64);

impl FeatureSet {
    pub const EMPTY: FeatureSet = FeatureSet(0);

    pub const UID: FeatureSet = FeatureSet(1 << 0);
    pub const NOSRCADDR: FeatureSet = FeatureSet(1 << 1);
    pub const MONCLOCKCHECK: FeatureSet = FeatureSet(1 << 2);
    pub const FLOCK: FeatureSet = FeatureSet(1 << 3);
    pub const SUBSCRIBE2: FeatureSet = FeatureSet(1 << 4);
    pub const MONNAMES: FeatureSet = FeatureSet(1 << 5);
    pub const RECONNECT_SEQ: FeatureSet = FeatureSet(1 << 6);
    pub const DIRLAYOUTHASH: FeatureSet = FeatureSet(1 << 7);

    /// Baseline every policy advertises regardless of caller input.
    pub const SUPPORTED_DEFAULT: FeatureSet = FeatureSet(
        Self::UID.0
            | Self::NOSRCADDR.0
            | Self::MONCLOCKCHECK.0
            | Self::FLOCK.0
            | Self::SUBSCRIBE2.0
            | Self::MONNAMES.0
            | Self::RECONNECT_SEQ.0
            | Self::DIRLAYOUTHASH.0,
    );

    const NAMES: [(FeatureSet, &'static str); 8] = [
        (Self::UID, "uid"),
        (Self::NOSRCADDR, "nosrcaddr"),
        (Self::MONCLOCKCHECK, "monclockcheck"),
        (Self::FLOCK, "flock"),
        (Self::SUBSCRIBE2, "subscribe2"),
        (Self::MONNAMES, "monnames"),
        (Self::RECONNECT_SEQ, "reconnect_seq"),
        (Self::DIRLAYOUTHASH, "dirlayouthash"),
    ];

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set in `self`.
    #[inline]
    pub const fn contains(&self, other: FeatureSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bits of `self` that `available` does not provide.
    #[inline]
    pub const fn missing_from(&self, available: FeatureSet) -> FeatureSet {
        FeatureSet(self.0 & !available.0)
    }

    /// Names of the known bits that are set. Unknown bits are skipped.
    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: Self) -> Self::Output {
        FeatureSet(self.0 | rhs.0)
    }
}

impl BitOrAssign for FeatureSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FeatureSet {
    type Output = FeatureSet;

    fn bitand(self, rhs: Self) -> Self::Output {
        FeatureSet(self.0 & rhs.0)
    }
}

impl Not for FeatureSet {
    type Output = FeatureSet;

    fn not(self) -> Self::Output {
        FeatureSet(!self.0)
    }
}

impl From<u64> for FeatureSet {
    fn from(bits: u64) -> Self {
        FeatureSet(bits)
    }
}

impl fmt::Display for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeatureSet({:#x} {:?})", self.0, self.names())
    }
}
