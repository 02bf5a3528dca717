//! Entity identity: who a daemon is and where it can be reached.
//!
//! An [`EntityName`] is a type plus a number (`osd.3`, `client.99`). An
//! [`EntityAddr`] is the network location. Together they form an
//! [`EntityInst`], the pair used to address a peer. All three are small,
//! `Copy` where possible, and cheap to compare and hash.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Kind of daemon an entity is.
///
/// The discriminants match the bit values peers exchange during
/// capability negotiation.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum EntityType {
    Mon = 0x01,
    Mds = 0x02,
    Osd = 0x04,
    Client = 0x08,
    Auth = 0x20,
}

impl EntityType {
    /// All known entity types, in wire-value order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Mon,
        EntityType::Mds,
        EntityType::Osd,
        EntityType::Client,
        EntityType::Auth,
    ];

    /// Lowercase name used in `type.num` notation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Mon => "mon",
            EntityType::Mds => "mds",
            EntityType::Osd => "osd",
            EntityType::Client => "client",
            EntityType::Auth => "auth",
        }
    }

    /// Wire bit value.
    #[inline]
    pub fn bits(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseEntityError(format!("unknown entity type `{}`", s)))
    }
}

/// Error parsing an entity name from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEntityError(String);

impl fmt::Display for ParseEntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseEntityError {}

/// Logical name of a daemon: type plus number.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct EntityName {
    pub ty: EntityType,
    pub num: i64,
}

impl EntityName {
    /// Number used before a daemon has been assigned one.
    pub const NEW: i64 = -1;

    pub fn new(ty: EntityType, num: i64) -> Self {
        Self { ty, num }
    }

    pub fn mon(num: i64) -> Self {
        Self::new(EntityType::Mon, num)
    }

    pub fn mds(num: i64) -> Self {
        Self::new(EntityType::Mds, num)
    }

    pub fn osd(num: i64) -> Self {
        Self::new(EntityType::Osd, num)
    }

    pub fn client(num: i64) -> Self {
        Self::new(EntityType::Client, num)
    }

    /// True until a real number has been assigned.
    pub fn is_new(&self) -> bool {
        self.num < 0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_new() {
            write!(f, "{}.?", self.ty)
        } else {
            write!(f, "{}.{}", self.ty, self.num)
        }
    }
}

impl FromStr for EntityName {
    type Err = ParseEntityError;

    /// Parses `type.num`, e.g. `osd.12`. `type.?` yields [`EntityName::NEW`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ty, num) = s
            .split_once('.')
            .ok_or_else(|| ParseEntityError(format!("expected `type.num`, got `{}`", s)))?;
        let ty = ty.parse()?;
        let num = if num == "?" {
            Self::NEW
        } else {
            num.parse()
                .map_err(|_| ParseEntityError(format!("invalid entity number `{}`", num)))?
        };
        Ok(Self { ty, num })
    }
}

/// Network location of an entity.
///
/// The nonce distinguishes successive incarnations of a daemon bound to
/// the same socket address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct EntityAddr {
    pub addr: SocketAddr,
    pub nonce: u32,
}

impl EntityAddr {
    pub fn new(addr: SocketAddr, nonce: u32) -> Self {
        Self { addr, nonce }
    }

    /// Unbound placeholder (`0.0.0.0:0/0`).
    pub fn blank() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0)
    }

    pub fn is_blank(&self) -> bool {
        self.addr.ip().is_unspecified() && self.addr.port() == 0
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Replace the IP, keeping port and nonce.
    pub fn set_ip(&mut self, ip: IpAddr) {
        self.addr.set_ip(ip);
    }

    pub fn set_port(&mut self, port: u16) {
        self.addr.set_port(port);
    }
}

impl Default for EntityAddr {
    fn default() -> Self {
        Self::blank()
    }
}

impl fmt::Display for EntityAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.nonce)
    }
}

/// Addressable pair of name and location.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct EntityInst {
    pub name: EntityName,
    pub addr: EntityAddr,
}

impl EntityInst {
    pub fn new(name: EntityName, addr: EntityAddr) -> Self {
        Self { name, addr }
    }
}

impl fmt::Display for EntityInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.addr)
    }
}
