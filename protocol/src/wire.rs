//! Message framing.
//!
//! Each connection carries exactly one frame:
//! `MAGIC (4) + LENGTH (4, little endian) + PAYLOAD`, with the payload
//! encoded by postcard.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageKind, Plane};

pub const FRAME_MAGIC: [u8; 4] = *b"EVNT";

/// Upper bound on a single encoded message
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] postcard::Error),
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("frame of {0} bytes exceeds limit of {max}", max = MAX_FRAME_LEN)]
    TooLarge(usize),
    #[error("kind {kind} does not belong to the {plane:?} plane payload")]
    KindMismatch { kind: MessageKind, plane: Plane },
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let payload = postcard::to_allocvec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<usize, WireError> {
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, WireError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic != FRAME_MAGIC {
        return Err(WireError::BadMagic(magic));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use crate::nodelist::NodeList;
    use crate::types::*;
    use chrono::Utc;

    fn origin() -> Origin {
        Origin {
            id: "10.1.1.1:9000".into(),
            ip: "10.1.1.1".into(),
            port: 9000,
            subnet: "s1".into(),
        }
    }

    async fn through_pipe(msg: &Message) -> Message {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let sent = msg.clone();
        let writer = tokio::spawn(async move { write_message(&mut a, &sent).await.unwrap() });
        let got = read_message(&mut b).await.unwrap();
        writer.await.unwrap();
        got
    }

    #[tokio::test]
    async fn test_control_messages_survive_the_wire() {
        let ids = MsgIdFactory::new("10.1.1.1:9000");
        let ping_id = ids.next_id();
        let ping = Message::control(
            Header::new(&origin(), ping_id.clone(), MessageKind::PING),
            ControlPayload::Ping,
        );
        assert_eq!(through_pipe(&ping).await, ping);

        let reply = Message::control(
            Header::new(&origin(), ids.next_id(), MessageKind::PING_RESPONSE).in_reply_to(&ping_id),
            ControlPayload::PingResponse,
        );
        let got = through_pipe(&reply).await;
        assert_eq!(got.header.original_id, Some(ping_id));

        let mut list = NodeList::new("10.1.1.1:9000", 100, Subnet::Label("s1".into()));
        list.succeed("10.1.1.2:9000", NodeEntry::new("10.1.1.2", 9000, "s1", Utc::now()));
        list.fail("10.1.1.3:9000", NodeEntry::new("10.1.1.3", 9000, "s2", Utc::now()));
        let req = Message::control(
            Header::new(&origin(), ids.next_id(), MessageKind::NODE_LIST_REQUEST),
            ControlPayload::NeighborListRequest { nodes: list.clone() },
        );
        match through_pipe(&req).await.payload {
            Payload::Control(ControlPayload::NeighborListRequest { nodes }) => {
                assert_eq!(nodes, list);
                assert_eq!(nodes.owner(), list.owner());
            }
            other => panic!("unexpected payload {other:?}"),
        }

        let request_id = req.header.id.clone();
        let resp = Message::control(
            Header::new(&origin(), ids.next_id(), MessageKind::NODE_LIST_RESPONSE)
                .in_reply_to(&request_id),
            ControlPayload::NeighborListResponse { nodes: list.clone() },
        );
        let got = through_pipe(&resp).await;
        assert_eq!(got, resp);
        assert_eq!(got.kind(), MessageKind::NODE_LIST_RESPONSE);
        assert_eq!(got.header.original_id, Some(request_id));
        match got.payload {
            Payload::Control(ControlPayload::NeighborListResponse { nodes }) => {
                assert_eq!(nodes.owner(), list.owner());
                assert!(nodes.subnet_neighbors().contains("10.1.1.2:9000"));
                assert_eq!(nodes.bad().len(), 1);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_migrant_cargo_sizes() {
        let ids = MsgIdFactory::new("10.1.1.1:9000");
        for n in [0usize, 1, 150] {
            let migrants = (0..n).map(|i| Migrant(vec![i as u8; 16])).collect();
            let msg = Message::evolve(
                Header::new(&origin(), ids.next_id(), MessageKind::MIGRANTS),
                EvolvePayload::Migrants { migrants },
            );
            assert_eq!(through_pipe(&msg).await, msg);
        }
    }

    #[tokio::test]
    async fn test_rejects_bad_magic() {
        let mut bytes: &[u8] = b"NOPE\x00\x00\x00\x00";
        assert!(matches!(read_message(&mut bytes).await, Err(WireError::BadMagic(_))));
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let mut frame = FRAME_MAGIC.to_vec();
        frame.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut bytes: &[u8] = &frame;
        assert!(matches!(read_message(&mut bytes).await, Err(WireError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_io_error() {
        let msg = Message::control(
            Header::new(&origin(), MsgIdFactory::new("x").next_id(), MessageKind::PING),
            ControlPayload::Ping,
        );
        let frame = encode(&msg).unwrap();
        let mut bytes: &[u8] = &frame[..frame.len() - 1];
        assert!(matches!(read_message(&mut bytes).await, Err(WireError::Io(_))));
    }
}
