use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{ConfigError, NodeConfig};

/// Unique node identifier, conventionally `"ip:port"`
pub type NodeId = String;

/// Port assumed for seed addresses given without one
pub const DEFAULT_PORT: u16 = 9000;

/// Subnet label used when a node does not know its peer's subnet
pub const DEFAULT_SUBNET_ID: &str = "DEFAULT_SUBNET_ID";

/// Label advertised by nodes running without a second tier
pub const NO_SECOND_TIER: &str = "NO_SECOND_TIER";

/// A reachable peer address as given on the command line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub ip: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Parse `"ip:port"` or a bare `"ip"` (which gets [`DEFAULT_PORT`]).
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let mut parts = raw.split(':');
        let ip = parts.next().unwrap_or_default();
        let port = parts.next();
        if ip.is_empty() || parts.next().is_some() {
            return Err(ConfigError::MalformedAddress(raw.to_string()));
        }
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| ConfigError::BadPort(raw.to_string()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::new(ip, port))
    }

    pub fn node_id(&self) -> NodeId {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Topology tier of a node.
///
/// `Label` switches on subnet tracking: the node keeps a second set of
/// good neighbours sharing its label and measures satisfaction against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Subnet {
    Flat,
    Label(String),
}

impl Subnet {
    pub fn is_tiered(&self) -> bool {
        matches!(self, Subnet::Label(_))
    }

    /// The label this node advertises in outgoing messages
    pub fn label(&self) -> &str {
        match self {
            Subnet::Flat => NO_SECOND_TIER,
            Subnet::Label(l) => l,
        }
    }

    pub fn matches(&self, label: &str) -> bool {
        matches!(self, Subnet::Label(l) if l == label)
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Subnet::Label(DEFAULT_SUBNET_ID.to_string())
    }
}

/// What one node knows about another.
///
/// Entries are replaced wholesale on every update, never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub ip: String,
    pub port: u16,
    pub subnet: String,
    /// Time of the contact this entry records
    pub last_seen: DateTime<Utc>,
}

impl NodeEntry {
    pub fn new(
        ip: impl Into<String>,
        port: u16,
        subnet: impl Into<String>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        Self {
            ip: ip.into(),
            port,
            subnet: subnet.into(),
            last_seen,
        }
    }

    /// Same peer, observed at a different time
    pub fn seen_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            last_seen: at,
            ..self.clone()
        }
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}--{}--{}", self.ip, self.port, self.subnet, self.last_seen.to_rfc3339())
    }
}

/// Globally unique message id: origin node plus a per-node sequence number
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgId {
    pub origin: NodeId,
    pub seq: u64,
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin, self.seq)
    }
}

/// Hands out monotonically increasing message ids for one node.
/// Shared by the control and evolve planes.
#[derive(Debug)]
pub struct MsgIdFactory {
    origin: NodeId,
    last: AtomicU64,
}

impl MsgIdFactory {
    pub fn new(origin: impl Into<NodeId>) -> Self {
        Self {
            origin: origin.into(),
            last: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> MsgId {
        MsgId {
            origin: self.origin.clone(),
            seq: self.last.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }
}

/// Identity this node stamps on every message it sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Origin {
    pub id: NodeId,
    pub ip: String,
    pub port: u16,
    pub subnet: String,
}

impl Origin {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: config.node_id(),
            ip: config.addr.ip.clone(),
            port: config.addr.port,
            subnet: config.subnet.label().to_string(),
        }
    }
}
