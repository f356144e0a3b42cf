use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::message::*;
use crate::nodelist::{NodeListError, SharedNodeList};
use crate::queue;
use crate::types::*;

/// Receives migrants arriving from other nodes.
///
/// Implemented by the application owning the population; the transport
/// never looks inside a [`Migrant`].
pub trait MigrantSink: Send + 'static {
    fn accept_migrants(&mut self, from: &NodeId, migrants: Vec<Migrant>);
}

/// Drains the evolve queue into a [`MigrantSink`]
pub struct Evolve<S> {
    nodes: SharedNodeList,
    inbox: mpsc::Receiver<EvolveMessage>,
    sink: S,
}

impl<S: MigrantSink> Evolve<S> {
    pub fn new(nodes: SharedNodeList, inbox: mpsc::Receiver<EvolveMessage>, sink: S) -> Self {
        Self { nodes, inbox, sink }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Evolve loop stopped");
    }

    async fn handle(&mut self, msg: EvolveMessage) {
        let EvolveMessage { header, payload } = msg;
        self.nodes.succeed(&header.source_id, header.source_entry(Utc::now())).await;
        match payload {
            EvolvePayload::Migrants { migrants } => {
                tracing::info!(
                    from = %header.source_id,
                    count = migrants.len(),
                    "Migrants arrived"
                );
                self.sink.accept_migrants(&header.source_id, migrants);
            }
        }
    }
}

/// Application-side handle for sending on the evolve plane
#[derive(Clone)]
pub struct EvolveHandle {
    origin: Origin,
    ids: Arc<MsgIdFactory>,
    nodes: SharedNodeList,
    outbound: mpsc::Sender<Outbound>,
}

impl EvolveHandle {
    pub fn new(
        origin: Origin,
        ids: Arc<MsgIdFactory>,
        nodes: SharedNodeList,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            origin,
            ids,
            nodes,
            outbound,
        }
    }

    /// Queue an application message for `dest`. Returns false if the
    /// outbound queue was full.
    pub fn send_application_message(
        &self,
        payload: EvolvePayload,
        dest_id: &str,
        dest: NodeEntry,
    ) -> bool {
        let header = Header::new(&self.origin, self.ids.next_id(), payload.kind());
        let out = Outbound {
            message: Message::evolve(header, payload),
            dest_id: dest_id.to_string(),
            dest,
        };
        queue::enqueue(&self.outbound, out, "outbound")
    }

    /// Send `migrants` to one random neighbour, returning its id
    pub async fn emigrate(&self, migrants: Vec<Migrant>) -> Result<NodeId, NodeListError> {
        let (dest_id, dest) = match self.nodes.random_neighbor().await {
            Ok(picked) => picked,
            Err(e) => {
                tracing::warn!(count = migrants.len(), "No neighbors available to accept migrants");
                return Err(e);
            }
        };
        tracing::debug!(peer = %dest_id, count = migrants.len(), "Emigrating");
        self.send_application_message(EvolvePayload::Migrants { migrants }, &dest_id, dest);
        Ok(dest_id)
    }
}
