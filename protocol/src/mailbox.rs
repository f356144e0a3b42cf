use chrono::Utc;
use serde::Serialize;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

use crate::config::{NodeConfig, SendFailurePolicy, Timing};
use crate::message::*;
use crate::nodelist::SharedNodeList;
use crate::queue;
use crate::sender;
use crate::wire;

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Consumer ends of the inbound queues plus a producer for the outbound one
pub struct Inboxes {
    pub control: mpsc::Receiver<ControlMessage>,
    pub evolve: mpsc::Receiver<EvolveMessage>,
    pub outbound: mpsc::Sender<Outbound>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MailboxReport {
    pub port: u16,
    pub control_queue: usize,
    pub evolve_queue: usize,
    pub outbound_queue: usize,
    pub capacity: usize,
    pub sends_in_flight: usize,
}

#[derive(Clone)]
pub struct MailboxMonitor {
    port: u16,
    control: mpsc::Sender<ControlMessage>,
    evolve: mpsc::Sender<EvolveMessage>,
    outbound: mpsc::Sender<Outbound>,
    in_flight: Arc<AtomicUsize>,
}

impl MailboxMonitor {
    pub fn report(&self) -> MailboxReport {
        MailboxReport {
            port: self.port,
            control_queue: queue::depth(&self.control),
            evolve_queue: queue::depth(&self.evolve),
            outbound_queue: queue::depth(&self.outbound),
            capacity: self.outbound.max_capacity(),
            sends_in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// TCP transport for one node.
///
/// Accepts one message per inbound connection and routes it by kind into
/// the control or evolve queue. Outbound messages each get their own short
/// lived connection, sent from a separate task under a deadline, and the
/// outcome is recorded against the node list.
pub struct Mailbox {
    listener: TcpListener,
    port: u16,
    control_tx: mpsc::Sender<ControlMessage>,
    evolve_tx: mpsc::Sender<EvolveMessage>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: mpsc::Receiver<Outbound>,
    timing: Timing,
    policy: SendFailurePolicy,
    in_flight: Arc<AtomicUsize>,
}

enum Event {
    Shutdown,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Send(Outbound),
    SendDone(Result<(), JoinError>),
}

impl Mailbox {
    /// Bind the listening socket on all interfaces at the configured port.
    /// Port 0 picks an ephemeral port; see [`Mailbox::port`].
    pub async fn bind(config: &NodeConfig) -> Result<(Self, Inboxes), MailboxError> {
        let addr = format!("0.0.0.0:{}", config.addr.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| MailboxError::Bind { addr: addr.clone(), source })?;
        let port = listener
            .local_addr()
            .map_err(|source| MailboxError::Bind { addr, source })?
            .port();

        let depth = config.max_queue_depth;
        let (control_tx, control_rx) = mpsc::channel(depth);
        let (evolve_tx, evolve_rx) = mpsc::channel(depth);
        let (outbound_tx, outbound_rx) = mpsc::channel(depth);

        let mailbox = Self {
            listener,
            port,
            control_tx,
            evolve_tx,
            outbound_tx: outbound_tx.clone(),
            outbound_rx,
            timing: config.timing,
            policy: config.send_failure_policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        let inboxes = Inboxes {
            control: control_rx,
            evolve: evolve_rx,
            outbound: outbound_tx,
        };
        Ok((mailbox, inboxes))
    }

    /// The port actually bound
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn monitor(&self) -> MailboxMonitor {
        MailboxMonitor {
            port: self.port,
            control: self.control_tx.clone(),
            evolve: self.evolve_tx.clone(),
            outbound: self.outbound_tx.clone(),
            in_flight: self.in_flight.clone(),
        }
    }

    pub async fn run(mut self, nodes: SharedNodeList, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(port = self.port, "Mailbox listening");
        let mut sends: JoinSet<()> = JoinSet::new();

        loop {
            let event = tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        Event::Shutdown
                    } else {
                        continue;
                    }
                }
                res = self.listener.accept() => Event::Accepted(res),
                Some(out) = self.outbound_rx.recv() => Event::Send(out),
                Some(res) = sends.join_next(), if !sends.is_empty() => Event::SendDone(res),
            };

            match event {
                Event::Shutdown => break,
                Event::Accepted(Ok((stream, peer))) => self.receive(stream, peer).await,
                Event::Accepted(Err(e)) => tracing::warn!(error = %e, "Accept failed"),
                Event::Send(out) => self.spawn_send(&mut sends, out, nodes.clone()),
                Event::SendDone(Err(e)) if e.is_panic() => {
                    tracing::error!(error = %e, "Send task panicked")
                }
                Event::SendDone(_) => {}
            }
        }

        let abandoned = sends.len();
        sends.shutdown().await;
        tracing::info!(abandoned, "Mailbox stopped");
    }

    async fn receive(&self, mut stream: TcpStream, peer: SocketAddr) {
        let read = wire::read_message(&mut stream);
        match tokio::time::timeout(self.timing.recv_timeout, read).await {
            Ok(Ok(msg)) => self.dispatch(msg, peer.ip()),
            Ok(Err(e)) => tracing::warn!(%peer, error = %e, "Failed to read inbound message"),
            Err(_) => tracing::warn!(%peer, "Inbound message not received in time"),
        }
    }

    /// Stamp the observed sender address and queue by kind range
    fn dispatch(&self, mut msg: Message, observed: IpAddr) {
        msg.header.source_ip = observed.to_string();
        let kind = msg.kind();
        let from = msg.header.source_id.clone();
        match msg.route() {
            Ok(Routed::Control(m)) => {
                queue::enqueue(&self.control_tx, m, "control");
            }
            Ok(Routed::Evolve(m)) => {
                queue::enqueue(&self.evolve_tx, m, "evolve");
            }
            Ok(Routed::Unsupported(_)) => {
                tracing::error!(%from, %kind, "Message kind not yet implemented, dropping");
            }
            Err(e) => tracing::warn!(%from, error = %e, "Dropping malformed message"),
        }
    }

    fn spawn_send(&self, sends: &mut JoinSet<()>, out: Outbound, nodes: SharedNodeList) {
        let timing = self.timing;
        let policy = self.policy;
        let in_flight = self.in_flight.clone();
        let span = tracing::debug_span!("send", peer = %out.dest_id, kind = %out.message.kind());
        in_flight.fetch_add(1, Ordering::Relaxed);
        sends.spawn(
            async move {
                let result = sender::deliver(&out, timing).await;
                record_send(&nodes, &out, result, policy).await;
                in_flight.fetch_sub(1, Ordering::Relaxed);
            }
            .instrument(span),
        );
    }
}

async fn record_send(
    nodes: &SharedNodeList,
    out: &Outbound,
    result: Result<usize, sender::SendError>,
    policy: SendFailurePolicy,
) {
    let now = Utc::now();
    match result {
        Ok(bytes) => {
            tracing::debug!(bytes, "Sent");
            nodes.succeed(&out.dest_id, out.dest.seen_at(now)).await;
        }
        Err(e) if e.counts_as_failure(policy) => {
            tracing::warn!(error = %e, "Send failed");
            nodes.fail(&out.dest_id, out.dest.seen_at(now)).await;
        }
        Err(e) => tracing::warn!(error = %e, "Send failed, peer left as is"),
    }
}
