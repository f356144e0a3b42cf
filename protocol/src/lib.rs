//! evonet node protocol
//!
//! Every process in an evonet fleet runs one node. Nodes keep a partial,
//! eventually consistent view of each other and exchange application
//! messages (migrating individuals) over short lived TCP connections.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────── Node ─────────────┐
//!  TCP  ───► │ Mailbox ──► control queue ──► Control ──┐
//!            │    │    └─► evolve queue  ──► Evolve   │
//!  TCP  ◄─── │    ◄──────── outbound queue ◄──────────┘
//!            │              SharedNodeList            │
//!            └────────────────────────────────────────┘
//! ```
//!
//! ## Membership
//! - Known peers are split into good and bad tables, never both
//! - Views are merged last-writer-wins on `last_seen`
//! - With a subnet label, same-subnet good peers form a second tier
//!
//! ## Failure detection
//! - Every gossip period a node pings one idle neighbour, and asks one for
//!   its node list while it has fewer neighbours than it wants
//! - Unanswered requests mark the peer bad after the ping timeout
//! - Message kinds are partitioned into control, evolve and data ranges

pub mod config;
pub mod control;
pub mod evolve;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod nodelist;
pub mod queue;
pub mod sender;
pub mod signal;
pub mod types;
pub mod wire;

pub use config::{ConfigError, NodeConfig, SendFailurePolicy, Timing};
pub use control::{Control, ControlReport, PendingPing};
pub use evolve::{Evolve, EvolveHandle, MigrantSink};
pub use mailbox::{Mailbox, MailboxError, MailboxReport};
pub use message::{Message, MessageKind, Migrant};
pub use node::{Node, NodeError, NodeHandle, NodeMonitor, NodeStatus};
pub use nodelist::{Membership, NodeList, NodeListError, SharedNodeList};
pub use types::*;
