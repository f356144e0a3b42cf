use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::nodelist::NodeList;
use crate::types::*;
use crate::wire::WireError;

/// Small integer tag carried by every message. Its range selects the plane
/// a message is delivered to, so producers and the mailbox must agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKind(pub u8);

impl MessageKind {
    pub const PING: Self = Self(0);
    pub const PING_RESPONSE: Self = Self(1);
    pub const STATUS: Self = Self(2);
    pub const STATUS_RESPONSE: Self = Self(3);
    pub const CONTROL_FLOW: Self = Self(4);
    pub const NODE_LIST_REQUEST: Self = Self(5);
    pub const NODE_LIST_RESPONSE: Self = Self(6);

    pub const MIGRANTS: Self = Self(32);
    pub const BEST_INDIVIDUAL: Self = Self(33);

    pub const DATA_DESCRIPTION: Self = Self(64);

    pub fn plane(self) -> Plane {
        match self.0 {
            0..=30 => Plane::Control,
            32..=63 => Plane::Evolve,
            64..=95 => Plane::Data,
            _ => Plane::Unknown,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::PING => "ping",
            Self::PING_RESPONSE => "ping-response",
            Self::STATUS => "status",
            Self::STATUS_RESPONSE => "status-response",
            Self::CONTROL_FLOW => "control-flow",
            Self::NODE_LIST_REQUEST => "node-list-request",
            Self::NODE_LIST_RESPONSE => "node-list-response",
            Self::MIGRANTS => "migrants",
            Self::BEST_INDIVIDUAL => "best-individual",
            Self::DATA_DESCRIPTION => "data-description",
            MessageKind(n) => return write!(f, "kind-{n}"),
        };
        f.write_str(name)
    }
}

/// Destination plane derived from a [`MessageKind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Control,
    Evolve,
    Data,
    Unknown,
}

/// Fields common to every message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub id: MsgId,
    pub source_id: NodeId,
    pub source_ip: String,
    pub source_port: u16,
    pub source_subnet: String,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
    /// Id of the request this message answers
    pub original_id: Option<MsgId>,
}

impl Header {
    pub fn new(origin: &Origin, id: MsgId, kind: MessageKind) -> Self {
        Self {
            id,
            source_id: origin.id.clone(),
            source_ip: origin.ip.clone(),
            source_port: origin.port,
            source_subnet: origin.subnet.clone(),
            kind,
            sent_at: Utc::now(),
            original_id: None,
        }
    }

    pub fn in_reply_to(mut self, original: &MsgId) -> Self {
        self.original_id = Some(original.clone());
        self
    }

    /// The sender as a node list entry observed at `at`
    pub fn source_entry(&self, at: DateTime<Utc>) -> NodeEntry {
        NodeEntry::new(&self.source_ip, self.source_port, &self.source_subnet, at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlPayload {
    Ping,
    PingResponse,
    NeighborListRequest { nodes: NodeList },
    NeighborListResponse { nodes: NodeList },
}

impl ControlPayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            ControlPayload::Ping => MessageKind::PING,
            ControlPayload::PingResponse => MessageKind::PING_RESPONSE,
            ControlPayload::NeighborListRequest { .. } => MessageKind::NODE_LIST_REQUEST,
            ControlPayload::NeighborListResponse { .. } => MessageKind::NODE_LIST_RESPONSE,
        }
    }
}

/// One individual in transit, opaque to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migrant(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolvePayload {
    Migrants { migrants: Vec<Migrant> },
}

impl EvolvePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            EvolvePayload::Migrants { .. } => MessageKind::MIGRANTS,
        }
    }
}

/// Reserved for the data plane; carried on the wire but never handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPayload(pub Vec<u8>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Control(ControlPayload),
    Evolve(EvolvePayload),
    Data(DataPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

/// A control message as queued for the control loop
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub header: Header,
    pub payload: ControlPayload,
}

/// An application message as queued for the evolve loop
#[derive(Debug, Clone, PartialEq)]
pub struct EvolveMessage {
    pub header: Header,
    pub payload: EvolvePayload,
}

/// A decoded message sorted by plane
#[derive(Debug)]
pub enum Routed {
    Control(ControlMessage),
    Evolve(EvolveMessage),
    /// Data plane or unassigned kind; only the header survives
    Unsupported(Header),
}

impl Message {
    pub fn control(header: Header, payload: ControlPayload) -> Self {
        Self {
            header,
            payload: Payload::Control(payload),
        }
    }

    pub fn evolve(header: Header, payload: EvolvePayload) -> Self {
        Self {
            header,
            payload: Payload::Evolve(payload),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.header.kind
    }

    /// Sort by the header's kind range, checking the payload agrees with it
    pub fn route(self) -> Result<Routed, WireError> {
        let kind = self.header.kind;
        match (kind.plane(), self.payload) {
            (Plane::Control, Payload::Control(payload)) => Ok(Routed::Control(ControlMessage {
                header: self.header,
                payload,
            })),
            (Plane::Evolve, Payload::Evolve(payload)) => Ok(Routed::Evolve(EvolveMessage {
                header: self.header,
                payload,
            })),
            (Plane::Data | Plane::Unknown, _) => Ok(Routed::Unsupported(self.header)),
            (plane, _) => Err(WireError::KindMismatch { kind, plane }),
        }
    }
}

impl From<ControlMessage> for Message {
    fn from(m: ControlMessage) -> Self {
        Message::control(m.header, m.payload)
    }
}

impl From<EvolveMessage> for Message {
    fn from(m: EvolveMessage) -> Self {
        Message::evolve(m.header, m.payload)
    }
}

/// A message waiting in the outbound queue
#[derive(Debug, Clone)]
pub struct Outbound {
    pub message: Message,
    pub dest_id: NodeId,
    pub dest: NodeEntry,
}
