use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::config::{ConfigError, NodeConfig};
use crate::control::{Control, ControlMonitor, ControlReport};
use crate::evolve::{Evolve, EvolveHandle, MigrantSink};
use crate::mailbox::{Mailbox, MailboxError, MailboxMonitor, MailboxReport};
use crate::nodelist::{NodeList, SharedNodeList};
use crate::signal::Signal;
use crate::types::*;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub control: ControlReport,
    pub mailbox: MailboxReport,
}

/// Cloneable read side of a running node
#[derive(Clone)]
pub struct NodeMonitor {
    control: ControlMonitor,
    mailbox: MailboxMonitor,
}

impl NodeMonitor {
    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            control: self.control.report().await,
            mailbox: self.mailbox.report(),
        }
    }
}

/// A running node: its loops, shared state and shutdown switch
pub struct NodeHandle {
    id: NodeId,
    nodes: SharedNodeList,
    evolve: EvolveHandle,
    monitor: NodeMonitor,
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

pub struct Node;

impl Node {
    /// Validate `config`, bind the mailbox and spawn every loop.
    ///
    /// With port 0 the node takes whatever port the listener got, and that
    /// port becomes part of its id.
    pub async fn start<S: MigrantSink>(
        mut config: NodeConfig,
        sink: S,
    ) -> Result<NodeHandle, NodeError> {
        config.validate()?;
        let (mailbox, inboxes) = Mailbox::bind(&config).await?;
        config.addr.port = mailbox.port();
        let id = config.node_id();

        let nodes = SharedNodeList::new(NodeList::seeded(
            id.clone(),
            config.fleet_size_estimate,
            config.subnet.clone(),
            &config.seeds,
            Utc::now(),
        ));
        let ids = Arc::new(MsgIdFactory::new(id.clone()));
        let signal = Signal::new();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let control = Control::new(
            &config,
            nodes.clone(),
            ids.clone(),
            inboxes.control,
            inboxes.outbound.clone(),
            signal.clone(),
        );
        let monitor = NodeMonitor {
            control: control.monitor(),
            mailbox: mailbox.monitor(),
        };
        let evolve =
            EvolveHandle::new(Origin::from_config(&config), ids, nodes.clone(), inboxes.outbound);

        let mut tasks = JoinSet::new();
        tasks.spawn(
            control
                .run(shutdown_rx.clone())
                .instrument(tracing::info_span!("control", node = %id)),
        );
        tasks.spawn(
            mailbox
                .run(nodes.clone(), shutdown_rx.clone())
                .instrument(tracing::info_span!("mailbox", node = %id)),
        );
        tasks.spawn(
            Evolve::new(nodes.clone(), inboxes.evolve, sink)
                .run(shutdown_rx.clone())
                .instrument(tracing::info_span!("evolve", node = %id)),
        );
        tasks.spawn(
            signal
                .run_ticker(config.timing.gossip_interval, shutdown_rx)
                .instrument(tracing::info_span!("gossip_signal", node = %id)),
        );

        tracing::info!(
            node = %id,
            subnet = %config.subnet.label(),
            seeds = config.seeds.len(),
            fleet = config.fleet_size_estimate,
            "Node started"
        );

        Ok(NodeHandle {
            id,
            nodes,
            evolve,
            monitor,
            shutdown,
            tasks,
        })
    }
}

impl NodeHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port(&self) -> u16 {
        self.monitor.mailbox.report().port
    }

    pub fn nodes(&self) -> &SharedNodeList {
        &self.nodes
    }

    pub fn evolve(&self) -> &EvolveHandle {
        &self.evolve
    }

    pub fn monitor(&self) -> NodeMonitor {
        self.monitor.clone()
    }

    pub async fn status(&self) -> NodeStatus {
        self.monitor.status().await
    }

    /// Ask every loop to stop after its current iteration
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for every loop to finish
    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                tracing::error!(node = %self.id, error = %e, "Node task failed");
            }
        }
        tracing::info!(node = %self.id, "Node stopped");
    }
}
