//! Node identity, addressing and protocol versions.

use std::{
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use serde::{Deserialize, Serialize};

/// Stable identifier of a cluster member.
pub type NodeId = String;

/// Protocol version of a node. Ordered; the lower of two peers' versions
/// governs which gated fields appear on the wire between them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Version(u32);

impl Version {
    /// Baseline version; fields gated on it are always present.
    pub const V_0: Self = Self(0);
    /// Version spoken by this build.
    pub const CURRENT: Self = Self(1);

    #[must_use]
    pub const fn from_id(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn on_or_after(self, other: Self) -> bool {
        self.0 >= other.0
    }

    #[must_use]
    pub const fn before(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Connection version negotiated between two peers.
    #[must_use]
    pub const fn min(self, other: Self) -> Self {
        if self.0 <= other.0 {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Reachable endpoint of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportAddress {
    /// In-process endpoint served by `LocalTransport`.
    Local(String),
    /// Socket endpoint served by `TcpTransport`.
    Inet(SocketAddr),
}

impl TransportAddress {
    /// Whether both addresses live on the same host.
    #[must_use]
    pub fn same_host(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Local(_), Self::Local(_)) => true,
            (Self::Inet(a), Self::Inet(b)) => a.ip() == b.ip(),
            _ => false,
        }
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local[{id}]"),
            Self::Inet(addr) => write!(f, "inet[{addr}]"),
        }
    }
}

/// Immutable identity, address and protocol version of a cluster member.
///
/// Two descriptors are equal iff their ids match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub address: TransportAddress,
    pub version: Version,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, address: TransportAddress, version: Version) -> Self {
        Self {
            id: id.into(),
            address,
            version,
        }
    }
}

impl PartialEq for NodeDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeDescriptor {}

impl Hash for NodeDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{{{}}}", self.id, self.address)
    }
}
