use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::{NodeConfig, Timing, NEIGHBORS_TO_QUERY};
use crate::message::*;
use crate::nodelist::SharedNodeList;
use crate::queue;
use crate::signal::Signal;
use crate::types::*;

/// An outstanding request awaiting its response
#[derive(Debug, Clone)]
pub struct PendingPing {
    pub id: MsgId,
    pub dest_id: NodeId,
    pub dest: NodeEntry,
    pub sent_at: DateTime<Utc>,
}

impl PendingPing {
    pub fn expired(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match now.signed_duration_since(self.sent_at).to_std() {
            Ok(elapsed) => elapsed > timeout,
            // sent_at lies in the future
            Err(_) => false,
        }
    }
}

/// Point-in-time summary of a node's membership view
#[derive(Debug, Clone, Serialize)]
pub struct ControlReport {
    pub node_id: NodeId,
    pub subnet: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub good: usize,
    pub bad: usize,
    pub subnet_neighbors: usize,
    pub target_node_count: usize,
    pub satisfied: bool,
    pub pending_pings: usize,
}

/// Read-only view of a running control loop
#[derive(Clone)]
pub struct ControlMonitor {
    origin: Origin,
    nodes: SharedNodeList,
    pending: Arc<AtomicUsize>,
    started_at: DateTime<Utc>,
}

impl ControlMonitor {
    pub async fn report(&self) -> ControlReport {
        let (good, bad, subnet_neighbors, target_node_count) = self.nodes.counts().await;
        ControlReport {
            node_id: self.origin.id.clone(),
            subnet: self.origin.subnet.clone(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            good,
            bad,
            subnet_neighbors,
            target_node_count,
            satisfied: self.nodes.satisfied().await,
            pending_pings: self.pending.load(Ordering::Relaxed),
        }
    }
}

/// Gossip scheduler and failure detector.
///
/// Each tick drains the inbound control queue, expires unanswered requests
/// and, when the gossip signal has fired, pings and queries neighbours.
/// The pending map is owned by this loop alone.
pub struct Control {
    origin: Origin,
    ids: Arc<MsgIdFactory>,
    nodes: SharedNodeList,
    inbox: mpsc::Receiver<ControlMessage>,
    outbound: mpsc::Sender<Outbound>,
    signal: Signal,
    pending: HashMap<MsgId, PendingPing>,
    pending_count: Arc<AtomicUsize>,
    timing: Timing,
    max_drain: usize,
    rng: StdRng,
    started_at: DateTime<Utc>,
}

impl Control {
    pub fn new(
        config: &NodeConfig,
        nodes: SharedNodeList,
        ids: Arc<MsgIdFactory>,
        inbox: mpsc::Receiver<ControlMessage>,
        outbound: mpsc::Sender<Outbound>,
        signal: Signal,
    ) -> Self {
        Self {
            origin: Origin::from_config(config),
            ids,
            nodes,
            inbox,
            outbound,
            signal,
            pending: HashMap::new(),
            pending_count: Arc::new(AtomicUsize::new(0)),
            timing: config.timing,
            max_drain: config.max_queue_depth,
            rng: StdRng::from_entropy(),
            started_at: Utc::now(),
        }
    }

    /// Use a fixed random seed for neighbour selection
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn monitor(&self) -> ControlMonitor {
        ControlMonitor {
            origin: self.origin.clone(),
            nodes: self.nodes.clone(),
            pending: self.pending_count.clone(),
            started_at: self.started_at,
        }
    }

    pub async fn report(&self) -> ControlReport {
        self.monitor().report().await
    }

    pub fn pending(&self) -> &HashMap<MsgId, PendingPing> {
        &self.pending
    }

    /// Run ticks until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let snapshot = self.nodes.snapshot().await;
        tracing::info!(
            subnet = %self.origin.subnet,
            target = snapshot.target_node_count(),
            seeds = snapshot.good().len(),
            "Control loop started"
        );

        let mut timer = tokio::time::interval(self.timing.tick_interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = timer.tick() => self.tick(Utc::now()).await,
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(pending = self.pending.len(), "Control loop stopped");
    }

    /// One iteration of the loop, with `now` as the current time
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        let mut drained = 0;
        while drained < self.max_drain {
            match self.inbox.try_recv() {
                Ok(msg) => {
                    self.handle(msg, now).await;
                    drained += 1;
                }
                Err(_) => break,
            }
        }

        self.expire(now).await;

        if self.signal.take() {
            self.gossip(now).await;
        }
        self.pending_count.store(self.pending.len(), Ordering::Relaxed);
    }

    async fn handle(&mut self, msg: ControlMessage, now: DateTime<Utc>) {
        let ControlMessage { header, payload } = msg;
        tracing::trace!(
            from = %header.source_id,
            kind = %header.kind,
            id = %header.id,
            "Control message"
        );

        // Receipt alone proves the sender is alive
        self.nodes.succeed(&header.source_id, header.source_entry(now)).await;

        if let Some(original) = &header.original_id {
            if let Some(p) = self.pending.remove(original) {
                tracing::debug!(peer = %p.dest_id, id = %original, "Request answered");
            }
        }

        match payload {
            ControlPayload::Ping => self.reply(&header, ControlPayload::PingResponse, now).await,
            ControlPayload::PingResponse => {}
            ControlPayload::NeighborListRequest { nodes } => {
                let reply = if self.nodes.merge(nodes).await {
                    ControlPayload::NeighborListResponse {
                        nodes: self.nodes.snapshot().await,
                    }
                } else {
                    ControlPayload::PingResponse
                };
                self.reply(&header, reply, now).await;
            }
            ControlPayload::NeighborListResponse { nodes } => {
                self.nodes.merge(nodes).await;
            }
        }
    }

    async fn reply(&mut self, to: &Header, payload: ControlPayload, now: DateTime<Utc>) {
        // The sender was just recorded, but the header alone is enough to answer
        let dest = match self.nodes.get(&to.source_id).await {
            Some(entry) => entry,
            None => to.source_entry(now),
        };
        let header =
            Header::new(&self.origin, self.ids.next_id(), payload.kind()).in_reply_to(&to.id);
        let out = Outbound {
            message: Message::control(header, payload),
            dest_id: to.source_id.clone(),
            dest,
        };
        queue::enqueue(&self.outbound, out, "outbound");
    }

    /// Send a request and remember it until answered or expired
    fn request(
        &mut self,
        dest_id: &str,
        dest: &NodeEntry,
        payload: ControlPayload,
        now: DateTime<Utc>,
    ) {
        let header = Header::new(&self.origin, self.ids.next_id(), payload.kind());
        let id = header.id.clone();
        let kind = header.kind;
        let out = Outbound {
            message: Message::control(header, payload),
            dest_id: dest_id.to_string(),
            dest: dest.clone(),
        };
        if queue::enqueue(&self.outbound, out, "outbound") {
            tracing::debug!(peer = %dest_id, %kind, %id, "Request sent");
            self.pending.insert(
                id.clone(),
                PendingPing {
                    id,
                    dest_id: dest_id.to_string(),
                    dest: dest.clone(),
                    sent_at: now,
                },
            );
        }
    }

    async fn expire(&mut self, now: DateTime<Utc>) {
        let timeout = self.timing.ping_timeout;
        let expired: Vec<MsgId> = self
            .pending
            .values()
            .filter(|p| p.expired(now, timeout))
            .map(|p| p.id.clone())
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                tracing::info!(peer = %p.dest_id, %id, "Request timed out");
                self.nodes.fail(&p.dest_id, p.dest.seen_at(now)).await;
            }
        }
    }

    async fn gossip(&mut self, now: DateTime<Utc>) {
        let snapshot = self.nodes.snapshot().await;
        if snapshot.good().is_empty() {
            tracing::warn!(bad = snapshot.bad().len(), "No neighbors available");
            return;
        }

        if !snapshot.satisfied() {
            let targets = snapshot.good().iter().choose_multiple(&mut self.rng, NEIGHBORS_TO_QUERY);
            for (id, entry) in targets {
                let payload = ControlPayload::NeighborListRequest {
                    nodes: snapshot.clone(),
                };
                self.request(id, entry, payload, now);
            }
        }

        let awaiting: Vec<&NodeId> = self.pending.values().map(|p| &p.dest_id).collect();
        let candidate = snapshot
            .good()
            .iter()
            .filter(|(id, _)| !awaiting.contains(id))
            .choose(&mut self.rng)
            .map(|(id, entry)| (id.clone(), entry.clone()));
        if let Some((id, entry)) = candidate {
            self.request(&id, &entry, ControlPayload::Ping, now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodelist::{Membership, NodeList};
    use chrono::Duration;

    const ME: &str = "10.0.0.1:9000";

    struct Harness {
        control: Control,
        inbox: mpsc::Sender<ControlMessage>,
        outbound: mpsc::Receiver<Outbound>,
        signal: Signal,
        nodes: SharedNodeList,
    }

    fn harness(fleet: usize, peers: &[&str]) -> Harness {
        let config = NodeConfig {
            addr: PeerAddr::parse(ME).unwrap(),
            subnet: Subnet::Flat,
            fleet_size_estimate: fleet,
            ..Default::default()
        };
        let seeds: Vec<PeerAddr> = peers.iter().map(|p| PeerAddr::parse(p).unwrap()).collect();
        let nodes =
            SharedNodeList::new(NodeList::seeded(ME, fleet, Subnet::Flat, &seeds, Utc::now()));
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, out_rx) = mpsc::channel(16);
        let signal = Signal::new();
        let control = Control::new(
            &config,
            nodes.clone(),
            Arc::new(MsgIdFactory::new(ME)),
            in_rx,
            out_tx,
            signal.clone(),
        )
        .with_seed(42);
        Harness {
            control,
            inbox: in_tx,
            outbound: out_rx,
            signal,
            nodes,
        }
    }

    fn from_peer(peer: &str, payload: ControlPayload, original: Option<&MsgId>) -> ControlMessage {
        let addr = PeerAddr::parse(peer).unwrap();
        let origin = Origin {
            id: addr.node_id(),
            ip: addr.ip.clone(),
            port: addr.port,
            subnet: NO_SECOND_TIER.into(),
        };
        let mut header = Header::new(&origin, MsgIdFactory::new(peer).next_id(), payload.kind());
        header.original_id = original.cloned();
        ControlMessage { header, payload }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = vec![];
        while let Ok(o) = rx.try_recv() {
            out.push(o);
        }
        out
    }

    #[tokio::test]
    async fn test_ping_gets_response() {
        let mut h = harness(100, &[]);
        let ping = from_peer("10.0.0.2:9000", ControlPayload::Ping, None);
        let ping_id = ping.header.id.clone();
        h.inbox.send(ping).await.unwrap();
        h.control.tick(Utc::now()).await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest_id, "10.0.0.2:9000");
        assert_eq!(sent[0].message.kind(), MessageKind::PING_RESPONSE);
        assert_eq!(sent[0].message.header.original_id, Some(ping_id));
        assert_eq!(sent[0].message.header.source_id, ME);
        // The pinger is now known good
        assert!(h.nodes.get("10.0.0.2:9000").await.is_some());
    }

    #[tokio::test]
    async fn test_unanswered_request_fails_peer() {
        let mut h = harness(100, &["10.0.0.2:9000"]);
        let t0 = Utc::now();
        h.signal.raise();
        h.control.tick(t0).await;

        // Under target: the only neighbour is queried; nobody is left to ping
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.kind(), MessageKind::NODE_LIST_REQUEST);
        assert_eq!(h.control.pending().len(), 1);

        h.control.tick(t0 + Duration::seconds(4)).await;
        assert_eq!(h.control.pending().len(), 1);

        h.control.tick(t0 + Duration::seconds(6)).await;
        assert!(h.control.pending().is_empty());
        assert_eq!(h.nodes.snapshot().await.contains("10.0.0.2:9000"), Membership::Bad);
        assert_eq!(h.control.report().await.bad, 1);
    }

    #[tokio::test]
    async fn test_response_clears_pending() {
        let mut h = harness(100, &["10.0.0.2:9000"]);
        let t0 = Utc::now();
        h.signal.raise();
        h.control.tick(t0).await;
        let sent = drain(&mut h.outbound);
        let request_id = sent[0].message.header.id.clone();

        let reply = from_peer("10.0.0.2:9000", ControlPayload::PingResponse, Some(&request_id));
        h.inbox.send(reply).await.unwrap();
        h.control.tick(t0 + Duration::seconds(1)).await;
        assert!(h.control.pending().is_empty());

        h.control.tick(t0 + Duration::seconds(30)).await;
        assert_eq!(h.nodes.snapshot().await.contains("10.0.0.2:9000"), Membership::Good);
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test]
    async fn test_satisfied_node_only_pings() {
        // Fleet of 3 wants 2 neighbours
        let mut h = harness(3, &["10.0.0.2:9000", "10.0.0.3:9000"]);
        h.signal.raise();
        h.control.tick(Utc::now()).await;
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.kind(), MessageKind::PING);

        // The next round picks the peer not already awaited
        let first = sent[0].dest_id.clone();
        h.signal.raise();
        h.control.tick(Utc::now()).await;
        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0].dest_id, first);

        // Both awaited: nothing left to ping
        h.signal.raise();
        h.control.tick(Utc::now()).await;
        assert!(drain(&mut h.outbound).is_empty());
        assert_eq!(h.control.report().await.pending_pings, 2);
    }

    #[tokio::test]
    async fn test_gossip_without_neighbors_sends_nothing() {
        let mut h = harness(100, &[]);
        h.signal.raise();
        h.control.tick(Utc::now()).await;
        assert!(drain(&mut h.outbound).is_empty());
        assert!(h.control.pending().is_empty());
    }

    #[tokio::test]
    async fn test_neighbor_list_request_with_news_gets_list() {
        let mut h = harness(100, &["10.0.0.2:9000"]);
        let mut theirs = NodeList::new("10.0.0.3:9000", 100, Subnet::Flat);
        theirs.succeed(
            "10.0.0.4:9000",
            NodeEntry::new("10.0.0.4", 9000, NO_SECOND_TIER, Utc::now()),
        );
        let req = from_peer(
            "10.0.0.3:9000",
            ControlPayload::NeighborListRequest { nodes: theirs },
            None,
        );
        h.inbox.send(req).await.unwrap();
        h.control.tick(Utc::now()).await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        match &sent[0].message.payload {
            Payload::Control(ControlPayload::NeighborListResponse { nodes }) => {
                assert_eq!(nodes.good().len(), 3);
                assert_eq!(nodes.contains("10.0.0.4:9000"), Membership::Good);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_neighbor_list_request_without_news_gets_ping_response() {
        let mut h = harness(100, &["10.0.0.3:9000"]);
        let entry = h.nodes.get("10.0.0.3:9000").await.unwrap();
        let mut theirs = NodeList::new("10.0.0.9:9000", 100, Subnet::Flat);
        theirs.succeed("10.0.0.3:9000", entry);
        // Both views know exactly the requester
        let req = from_peer(
            "10.0.0.3:9000",
            ControlPayload::NeighborListRequest { nodes: theirs },
            None,
        );
        h.inbox.send(req).await.unwrap();
        h.control.tick(Utc::now()).await;

        let sent = drain(&mut h.outbound);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message.kind(), MessageKind::PING_RESPONSE);
    }

    #[tokio::test]
    async fn test_neighbor_list_response_is_merged_silently() {
        let mut h = harness(100, &[]);
        let mut theirs = NodeList::new("10.0.0.3:9000", 100, Subnet::Flat);
        theirs.fail("10.0.0.5:9000", NodeEntry::new("10.0.0.5", 9000, NO_SECOND_TIER, Utc::now()));
        let resp = from_peer(
            "10.0.0.3:9000",
            ControlPayload::NeighborListResponse { nodes: theirs },
            None,
        );
        h.inbox.send(resp).await.unwrap();
        h.control.tick(Utc::now()).await;

        assert!(drain(&mut h.outbound).is_empty());
        let snap = h.nodes.snapshot().await;
        assert_eq!(snap.contains("10.0.0.3:9000"), Membership::Good);
        assert_eq!(snap.contains("10.0.0.5:9000"), Membership::Bad);
    }

    #[tokio::test]
    async fn test_drain_is_bounded_per_tick() {
        let mut h = harness(100, &[]);
        h.control.max_drain = 2;
        for i in 2..6 {
            let peer = format!("10.0.0.{i}:9000");
            h.inbox.send(from_peer(&peer, ControlPayload::PingResponse, None)).await.unwrap();
        }
        h.control.tick(Utc::now()).await;
        assert_eq!(h.nodes.counts().await.0, 2);
        h.control.tick(Utc::now()).await;
        assert_eq!(h.nodes.counts().await.0, 4);
    }

    #[test]
    fn test_pending_expiry_boundary() {
        let t0 = Utc::now();
        let p = PendingPing {
            id: MsgIdFactory::new("x").next_id(),
            dest_id: "y".into(),
            dest: NodeEntry::new("y", 1, "s", t0),
            sent_at: t0,
        };
        let timeout = std::time::Duration::from_secs(5);
        assert!(!p.expired(t0 + Duration::seconds(5), timeout));
        assert!(p.expired(t0 + Duration::milliseconds(5001), timeout));
        assert!(!p.expired(t0 - Duration::seconds(1), timeout));
    }
}
