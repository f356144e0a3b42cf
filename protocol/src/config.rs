use std::time::Duration;
use thiserror::Error;

use crate::types::{NodeId, PeerAddr, Subnet};

/// Time between two control loop ticks
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Period of the gossip signal (random ping / neighbour list requests)
pub const RANDOM_PING_INTERVAL: Duration = Duration::from_secs(6);
/// A ping or neighbour list request unanswered for this long fails its peer
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard deadline for a single outbound send
pub const SEND_TIMEOUT: Duration = Duration::from_secs(45);
/// TCP connect timeout inside a send
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);
/// How long an accepted connection may take to deliver its frame
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
/// Number of neighbours asked for their lists while under target
pub const NEIGHBORS_TO_QUERY: usize = 1;
/// Default capacity of each message queue
pub const DEFAULT_MAX_MSGS: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("malformed peer address: {0:?}")]
    MalformedAddress(String),
    #[error("invalid port in address: {0:?}")]
    BadPort(String),
    #[error("fleet size estimate must be at least 1")]
    EmptyFleet,
    #[error("queue depth must be at least 1")]
    ZeroQueueDepth,
    #[error("seed list contains this node's own address {0}")]
    SelfSeed(NodeId),
}

/// Timers driving the control loop and the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub tick_interval: Duration,
    pub gossip_interval: Duration,
    pub ping_timeout: Duration,
    pub send_timeout: Duration,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_interval: TICK_INTERVAL,
            gossip_interval: RANDOM_PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            send_timeout: SEND_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            recv_timeout: RECV_TIMEOUT,
        }
    }
}

/// Which failed sends count as evidence that the peer is down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendFailurePolicy {
    /// Only connect timeouts and exceeded send deadlines
    TimeoutOnly,
    /// Any transport error, including refused connections and broken streams
    #[default]
    AllErrors,
}

/// Configuration for one fleet node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address peers reach this node at; also its node id. Port 0 binds an
    /// ephemeral port and adopts it.
    pub addr: PeerAddr,
    pub subnet: Subnet,
    /// Peers known at startup
    pub seeds: Vec<PeerAddr>,
    /// Expected total number of nodes in the fleet
    pub fleet_size_estimate: usize,
    /// Capacity of each inbound and the outbound queue
    pub max_queue_depth: usize,
    pub timing: Timing,
    pub send_failure_policy: SendFailurePolicy,
}

impl NodeConfig {
    pub fn node_id(&self) -> NodeId {
        self.addr.node_id()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fleet_size_estimate == 0 {
            return Err(ConfigError::EmptyFleet);
        }
        if self.max_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        if self.addr.ip.is_empty() {
            return Err(ConfigError::MalformedAddress(self.addr.to_string()));
        }
        if self.addr.port != 0 {
            let me = self.node_id();
            if self.seeds.iter().any(|s| s.node_id() == me) {
                return Err(ConfigError::SelfSeed(me));
            }
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: PeerAddr::new("127.0.0.1", crate::types::DEFAULT_PORT),
            subnet: Subnet::default(),
            seeds: vec![],
            fleet_size_estimate: 100,
            max_queue_depth: DEFAULT_MAX_MSGS,
            timing: Timing::default(),
            send_failure_policy: SendFailurePolicy::default(),
        }
    }
}
