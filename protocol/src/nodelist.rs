use chrono::{DateTime, Utc};
use rand::seq::IteratorRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::*;

/// Lower bound on the neighbour target, whatever the fleet size
pub const MIN_NEIGHBORS: usize = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeListError {
    #[error("no neighbours available")]
    EmptyMembership,
    #[error("no entry for node {0}")]
    NoSuchNode(NodeId),
}

/// Which table, if any, holds a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Good,
    Bad,
    None,
}

/// Desired number of good neighbours: `sqrt(fleet)` kept within
/// `[MIN_NEIGHBORS, fleet - 1]`. The upper bound wins for tiny fleets.
pub fn target_node_count(fleet_size_estimate: usize) -> usize {
    let sqrt = (fleet_size_estimate as f64).sqrt().floor() as usize;
    sqrt.max(MIN_NEIGHBORS).min(fleet_size_estimate.saturating_sub(1))
}

/// Counters describing what one merge did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub good_delta: i64,
    pub good_to_good: usize,
    pub bad_to_good: usize,
    pub new_good: usize,
    pub bad_delta: i64,
    pub good_to_bad: usize,
    pub bad_to_bad: usize,
    pub new_bad: usize,
    pub incoming_good: usize,
    pub incoming_bad: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The two views differed in which nodes they knew about at all
    pub new_info: bool,
    pub stats: MergeStats,
}

/// A node's partial view of the fleet.
///
/// Known peers are split into `good` (recently reachable) and `bad`
/// (timed out or failed). A node id lives in at most one of the two tables
/// and the owner never appears in either. With a subnet label set, the good
/// peers sharing that label are additionally tracked as subnet neighbours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeList {
    owner: NodeId,
    subnet: Subnet,
    good: HashMap<NodeId, NodeEntry>,
    bad: HashMap<NodeId, NodeEntry>,
    subnet_neighbors: HashSet<NodeId>,
    target_node_count: usize,
}

impl NodeList {
    pub fn new(owner: impl Into<NodeId>, fleet_size_estimate: usize, subnet: Subnet) -> Self {
        Self {
            owner: owner.into(),
            subnet,
            good: HashMap::new(),
            bad: HashMap::new(),
            subnet_neighbors: HashSet::new(),
            target_node_count: target_node_count(fleet_size_estimate),
        }
    }

    /// A fresh list with every seed recorded as a successful contact at `at`
    pub fn seeded(
        owner: impl Into<NodeId>,
        fleet_size_estimate: usize,
        subnet: Subnet,
        seeds: &[PeerAddr],
        at: DateTime<Utc>,
    ) -> Self {
        let mut list = Self::new(owner, fleet_size_estimate, subnet);
        for seed in seeds {
            let entry = NodeEntry::new(&seed.ip, seed.port, DEFAULT_SUBNET_ID, at);
            list.succeed(&seed.node_id(), entry);
        }
        list
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    pub fn has_second_tier(&self) -> bool {
        self.subnet.is_tiered()
    }

    pub fn target_node_count(&self) -> usize {
        self.target_node_count
    }

    pub fn good(&self) -> &HashMap<NodeId, NodeEntry> {
        &self.good
    }

    pub fn bad(&self) -> &HashMap<NodeId, NodeEntry> {
        &self.bad
    }

    pub fn subnet_neighbors(&self) -> &HashSet<NodeId> {
        &self.subnet_neighbors
    }

    pub fn contains(&self, id: &str) -> Membership {
        if self.good.contains_key(id) {
            Membership::Good
        } else if self.bad.contains_key(id) {
            Membership::Bad
        } else {
            Membership::None
        }
    }

    pub fn get(&self, id: &str) -> Result<&NodeEntry, NodeListError> {
        self.good
            .get(id)
            .or_else(|| self.bad.get(id))
            .ok_or_else(|| NodeListError::NoSuchNode(id.to_string()))
    }

    /// Record a successful contact with `id`
    pub fn succeed(&mut self, id: &str, entry: NodeEntry) {
        if id == self.owner {
            return;
        }
        if self.bad.remove(id).is_some() {
            tracing::info!(peer = %id, addr = %entry.socket_addr(), "Peer recovered");
        } else if !self.good.contains_key(id) {
            tracing::info!(peer = %id, addr = %entry.socket_addr(), "Discovered new peer");
        } else {
            tracing::trace!(peer = %id, "Recording success");
        }
        // The fresh entry may carry a different label than the one it replaces
        if self.subnet.matches(&entry.subnet) {
            self.subnet_neighbors.insert(id.to_string());
        } else {
            self.subnet_neighbors.remove(id);
        }
        self.good.insert(id.to_string(), entry);
    }

    /// Record a failed contact with `id`
    pub fn fail(&mut self, id: &str, entry: NodeEntry) {
        if id == self.owner {
            return;
        }
        if self.good.remove(id).is_some() {
            tracing::info!(peer = %id, addr = %entry.socket_addr(), "Peer marked bad");
        } else {
            tracing::debug!(peer = %id, "Recording failure");
        }
        self.subnet_neighbors.remove(id);
        self.bad.insert(id.to_string(), entry);
    }

    /// Merge another node's view into this one.
    ///
    /// Returns true when the two views did not know about the same set of
    /// nodes, i.e. this list either kept nodes `other` lacked or learned
    /// nodes it had never heard of.
    pub fn merge(&mut self, other: NodeList) -> bool {
        self.merge_detailed(other).new_info
    }

    /// Last-writer-wins reconciliation of `other` into `self`.
    ///
    /// Our good table is reconciled first, then our bad table, then whatever
    /// `other` knows that we never heard of is absorbed. When timestamps are
    /// equal across tables the incoming entry decides the classification.
    pub fn merge_detailed(&mut self, mut other: NodeList) -> MergeOutcome {
        let mut stats = MergeStats {
            incoming_good: other.good.len(),
            incoming_bad: other.bad.len(),
            ..MergeStats::default()
        };
        let mut new_info = false;
        let old_good = self.good.len();
        let old_bad = self.bad.len();
        let mut good = HashMap::with_capacity(old_good + other.good.len());
        let mut bad = HashMap::with_capacity(old_bad + other.bad.len());

        for (id, ours) in std::mem::take(&mut self.good) {
            if let Some(theirs) = other.good.remove(&id) {
                good.insert(id, newer(ours, theirs));
                stats.good_to_good += 1;
            } else if let Some(theirs) = other.bad.remove(&id) {
                if theirs.last_seen < ours.last_seen {
                    good.insert(id, ours);
                    stats.good_to_good += 1;
                } else {
                    bad.insert(id, theirs);
                    stats.good_to_bad += 1;
                }
            } else {
                good.insert(id, ours);
                new_info = true;
                stats.good_to_good += 1;
            }
        }

        for (id, ours) in std::mem::take(&mut self.bad) {
            if let Some(theirs) = other.bad.remove(&id) {
                bad.insert(id, newer(ours, theirs));
                stats.bad_to_bad += 1;
            } else if let Some(theirs) = other.good.remove(&id) {
                if theirs.last_seen < ours.last_seen {
                    bad.insert(id, ours);
                    stats.bad_to_bad += 1;
                } else {
                    good.insert(id, theirs);
                    stats.bad_to_good += 1;
                }
            } else {
                bad.insert(id, ours);
                new_info = true;
                stats.bad_to_bad += 1;
            }
        }

        for (id, theirs) in other.good {
            if id == self.owner {
                continue;
            }
            good.insert(id, theirs);
            stats.new_good += 1;
            new_info = true;
        }
        for (id, theirs) in other.bad {
            if id == self.owner {
                continue;
            }
            // A malformed snapshot may list a node in both of its tables
            if let Some(ours) = good.get(&id) {
                if theirs.last_seen < ours.last_seen {
                    continue;
                }
                good.remove(&id);
            }
            bad.insert(id, theirs);
            stats.new_bad += 1;
            new_info = true;
        }

        stats.good_delta = good.len() as i64 - old_good as i64;
        stats.bad_delta = bad.len() as i64 - old_bad as i64;
        self.good = good;
        self.bad = bad;
        self.target_node_count = self.target_node_count.max(other.target_node_count);
        if self.has_second_tier() {
            self.subnet_neighbors = self
                .good
                .iter()
                .filter(|(_, e)| self.subnet.matches(&e.subnet))
                .map(|(id, _)| id.clone())
                .collect();
        }

        tracing::debug!(
            good_delta = stats.good_delta,
            good_to_good = stats.good_to_good,
            bad_to_good = stats.bad_to_good,
            new_good = stats.new_good,
            bad_delta = stats.bad_delta,
            good_to_bad = stats.good_to_bad,
            bad_to_bad = stats.bad_to_bad,
            new_bad = stats.new_bad,
            incoming_good = stats.incoming_good,
            incoming_bad = stats.incoming_bad,
            new_info,
            "Merged node list"
        );

        MergeOutcome { new_info, stats }
    }

    /// Do we have as many active neighbours as we want?
    pub fn satisfied(&self) -> bool {
        if self.has_second_tier() {
            self.subnet_neighbors.len() >= self.target_node_count
        } else {
            self.good.len() >= self.target_node_count
        }
    }

    /// Uniformly pick a neighbour: a subnet neighbour when tiered, else any good node.
    pub fn random_neighbor<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<NodeId, NodeListError> {
        let picked = if self.has_second_tier() {
            self.subnet_neighbors.iter().choose(rng)
        } else {
            self.good.keys().choose(rng)
        };
        picked.cloned().ok_or(NodeListError::EmptyMembership)
    }
}

fn newer(ours: NodeEntry, theirs: NodeEntry) -> NodeEntry {
    if ours.last_seen < theirs.last_seen {
        theirs
    } else {
        ours
    }
}

/// Equality of views; the owner id is not part of it.
impl PartialEq for NodeList {
    fn eq(&self, other: &Self) -> bool {
        self.good == other.good
            && self.bad == other.bad
            && self.target_node_count == other.target_node_count
            && self.subnet == other.subnet
            && self.subnet_neighbors == other.subnet_neighbors
    }
}

impl fmt::Display for NodeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeList[{}/{}, ", self.good.len(), self.target_node_count)?;
        if let Subnet::Label(label) = &self.subnet {
            let mut ids: Vec<_> = self.subnet_neighbors.iter().map(String::as_str).collect();
            ids.sort_unstable();
            write!(f, "subnet={} neighbors({}), ", label, ids.join(", "))?;
        }
        write!(f, "good({}), bad({})]", join_table(&self.good), join_table(&self.bad))
    }
}

fn join_table(table: &HashMap<NodeId, NodeEntry>) -> String {
    let mut rows: Vec<_> = table.iter().map(|(id, e)| format!("{id}: {e}")).collect();
    rows.sort_unstable();
    rows.join(", ")
}

/// The process-wide node list behind its single lock.
///
/// Every compound operation runs atomically under the lock. Long work such
/// as gossip runs against a [`SharedNodeList::snapshot`] instead.
#[derive(Clone)]
pub struct SharedNodeList {
    inner: Arc<Mutex<NodeList>>,
}

impl SharedNodeList {
    pub fn new(list: NodeList) -> Self {
        Self {
            inner: Arc::new(Mutex::new(list)),
        }
    }

    pub async fn succeed(&self, id: &str, entry: NodeEntry) {
        self.inner.lock().await.succeed(id, entry);
    }

    pub async fn fail(&self, id: &str, entry: NodeEntry) {
        self.inner.lock().await.fail(id, entry);
    }

    pub async fn merge(&self, other: NodeList) -> bool {
        self.inner.lock().await.merge(other)
    }

    pub async fn snapshot(&self) -> NodeList {
        self.inner.lock().await.clone()
    }

    pub async fn satisfied(&self) -> bool {
        self.inner.lock().await.satisfied()
    }

    pub async fn get(&self, id: &str) -> Option<NodeEntry> {
        self.inner.lock().await.get(id).ok().cloned()
    }

    /// Pick a neighbour and its entry in one step, so the entry cannot
    /// vanish between selection and lookup.
    pub async fn random_neighbor(&self) -> Result<(NodeId, NodeEntry), NodeListError> {
        let list = self.inner.lock().await;
        let id = list.random_neighbor(&mut rand::thread_rng())?;
        let entry = list.get(&id)?.clone();
        Ok((id, entry))
    }

    /// `(good, bad, subnet neighbours, target)`
    pub async fn counts(&self) -> (usize, usize, usize, usize) {
        let list = self.inner.lock().await;
        (
            list.good.len(),
            list.bad.len(),
            list.subnet_neighbors.len(),
            list.target_node_count,
        )
    }
}
