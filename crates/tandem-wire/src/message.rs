//! Protocol messages and their payload encodings.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tandem_types::{Generation, ParticipantId, ReplicationParams, Snapshot, View};

use crate::error::{WireError, WireResult};
use crate::frame::Frame;

// ============================================================================
// Message Kind
// ============================================================================

/// Message type carried in the first four bytes of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Query = 1,
    ReportFailure = 2,
    ViewReply = 3,
    Hello = 4,
    InitBackupRequest = 5,
    InitBackupReply = 6,
    Sync = 7,
    SyncOk = 8,
    Heartbeat = 9,
    HeartbeatOk = 10,
}

impl MessageKind {
    /// Every message type, in wire-code order.
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Query,
        MessageKind::ReportFailure,
        MessageKind::ViewReply,
        MessageKind::Hello,
        MessageKind::InitBackupRequest,
        MessageKind::InitBackupReply,
        MessageKind::Sync,
        MessageKind::SyncOk,
        MessageKind::Heartbeat,
        MessageKind::HeartbeatOk,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::Query => "Query",
            MessageKind::ReportFailure => "ReportFailure",
            MessageKind::ViewReply => "View",
            MessageKind::Hello => "Hello",
            MessageKind::InitBackupRequest => "InitBackupRequest",
            MessageKind::InitBackupReply => "InitBackupReply",
            MessageKind::Sync => "Sync",
            MessageKind::SyncOk => "SyncOk",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::HeartbeatOk => "HeartbeatOk",
        }
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        let kind = match value {
            1 => MessageKind::Query,
            2 => MessageKind::ReportFailure,
            3 => MessageKind::ViewReply,
            4 => MessageKind::Hello,
            5 => MessageKind::InitBackupRequest,
            6 => MessageKind::InitBackupReply,
            7 => MessageKind::Sync,
            8 => MessageKind::SyncOk,
            9 => MessageKind::Heartbeat,
            10 => MessageKind::HeartbeatOk,
            other => return Err(WireError::UnknownMessageType(other)),
        };
        Ok(kind)
    }
}

// ============================================================================
// Payloads
// ============================================================================

/// Join or poll request to the view service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub name: ParticipantId,
    /// Address this participant accepts connections on if it becomes primary.
    pub address: SocketAddr,
}

/// Locally detected failure, proposing a replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFailure {
    /// Generation of the view the reporter observed the failure under.
    pub generation: Generation,
    pub failed: ParticipantId,
    pub replacement: ParticipantId,
}

/// The view service's answer to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewReply {
    pub view: View,
    pub params: ReplicationParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub name: ParticipantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBackupRequest {
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitBackupReply {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sync {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub name: ParticipantId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatOk {
    /// Generation the primary is currently serving.
    pub generation: Generation,
}

// ============================================================================
// Message
// ============================================================================

/// Every message the protocol exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query(Query),
    ReportFailure(ReportFailure),
    ViewReply(ViewReply),
    Hello(Hello),
    InitBackupRequest(InitBackupRequest),
    InitBackupReply(InitBackupReply),
    Sync(Sync),
    SyncOk,
    Heartbeat(Heartbeat),
    HeartbeatOk(HeartbeatOk),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Query(_) => MessageKind::Query,
            Message::ReportFailure(_) => MessageKind::ReportFailure,
            Message::ViewReply(_) => MessageKind::ViewReply,
            Message::Hello(_) => MessageKind::Hello,
            Message::InitBackupRequest(_) => MessageKind::InitBackupRequest,
            Message::InitBackupReply(_) => MessageKind::InitBackupReply,
            Message::Sync(_) => MessageKind::Sync,
            Message::SyncOk => MessageKind::SyncOk,
            Message::Heartbeat(_) => MessageKind::Heartbeat,
            Message::HeartbeatOk(_) => MessageKind::HeartbeatOk,
        }
    }

    /// Human-readable message name for logs.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Encodes the payload and wraps it in a frame.
    pub fn to_frame(&self) -> WireResult<Frame> {
        let kind = self.kind();
        let payload = match self {
            Message::Query(body) => encode_payload(kind, body)?,
            Message::ReportFailure(body) => encode_payload(kind, body)?,
            Message::ViewReply(body) => encode_payload(kind, body)?,
            Message::Hello(body) => encode_payload(kind, body)?,
            Message::InitBackupRequest(body) => encode_payload(kind, body)?,
            Message::InitBackupReply(body) => encode_payload(kind, body)?,
            Message::Sync(body) => encode_payload(kind, body)?,
            Message::SyncOk => Bytes::new(),
            Message::Heartbeat(body) => encode_payload(kind, body)?,
            Message::HeartbeatOk(body) => encode_payload(kind, body)?,
        };
        Ok(Frame::new(kind.as_u32(), payload))
    }

    /// Decodes a frame into a message.
    ///
    /// Trailing payload bytes after a complete body are rejected.
    pub fn from_frame(frame: &Frame) -> WireResult<Message> {
        let kind = MessageKind::try_from(frame.kind)?;
        let payload = &frame.payload[..];
        let message = match kind {
            MessageKind::Query => Message::Query(decode_payload(kind, payload)?),
            MessageKind::ReportFailure => Message::ReportFailure(decode_payload(kind, payload)?),
            MessageKind::ViewReply => Message::ViewReply(decode_payload(kind, payload)?),
            MessageKind::Hello => Message::Hello(decode_payload(kind, payload)?),
            MessageKind::InitBackupRequest => {
                Message::InitBackupRequest(decode_payload(kind, payload)?)
            }
            MessageKind::InitBackupReply => {
                Message::InitBackupReply(decode_payload(kind, payload)?)
            }
            MessageKind::Sync => Message::Sync(decode_payload(kind, payload)?),
            MessageKind::SyncOk => {
                if !payload.is_empty() {
                    return Err(WireError::LengthMismatch {
                        declared: 0,
                        actual: payload.len(),
                    });
                }
                Message::SyncOk
            }
            MessageKind::Heartbeat => Message::Heartbeat(decode_payload(kind, payload)?),
            MessageKind::HeartbeatOk => Message::HeartbeatOk(decode_payload(kind, payload)?),
        };
        Ok(message)
    }

    /// Appends this message as a frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> WireResult<()> {
        self.to_frame()?.encode(buf)
    }

    /// Encodes this message as a single datagram.
    pub fn to_datagram(&self) -> WireResult<Vec<u8>> {
        self.to_frame()?.encode_to_vec()
    }

    /// Decodes a datagram holding exactly one frame.
    pub fn from_datagram(datagram: &[u8]) -> WireResult<Message> {
        Message::from_frame(&Frame::from_datagram(datagram)?)
    }
}

fn encode_payload<T: Serialize>(kind: MessageKind, body: &T) -> WireResult<Bytes> {
    postcard::to_allocvec(body)
        .map(Bytes::from)
        .map_err(|source| WireError::Encode {
            kind: kind.name(),
            source,
        })
}

fn decode_payload<T: DeserializeOwned>(kind: MessageKind, payload: &[u8]) -> WireResult<T> {
    let (body, rest) =
        postcard::take_from_bytes(payload).map_err(|source| WireError::Decode {
            kind: kind.name(),
            source,
        })?;
    if !rest.is_empty() {
        return Err(WireError::LengthMismatch {
            declared: payload.len() - rest.len(),
            actual: payload.len(),
        });
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PAYLOAD_SIZE;
    use proptest::prelude::*;
    use test_case::test_case;

    fn id(name: &str) -> ParticipantId {
        ParticipantId::new(name).unwrap()
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:7000".parse().unwrap()
    }

    #[test_case(1 => Ok(MessageKind::Query))]
    #[test_case(8 => Ok(MessageKind::SyncOk))]
    #[test_case(10 => Ok(MessageKind::HeartbeatOk))]
    #[test_case(0 => Err(0))]
    #[test_case(11 => Err(11))]
    fn message_kind_from_u32(value: u32) -> Result<MessageKind, u32> {
        MessageKind::try_from(value).map_err(|e| match e {
            WireError::UnknownMessageType(t) => t,
            other => panic!("unexpected error: {other}"),
        })
    }

    #[test]
    fn all_kinds_are_listed_in_code_order() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(kind.as_u32() as usize, index + 1);
            assert_eq!(MessageKind::try_from(kind.as_u32()).unwrap(), *kind);
        }
    }

    #[test]
    fn sync_ok_has_empty_payload() {
        let frame = Message::SyncOk.to_frame().unwrap();
        assert_eq!(frame.kind, 8);
        assert!(frame.payload.is_empty());
        assert_eq!(Message::from_frame(&frame).unwrap(), Message::SyncOk);
    }

    #[test]
    fn sync_ok_with_payload_is_rejected() {
        let frame = Frame::new(8, vec![1]);
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let frame = Frame::new(MessageKind::Heartbeat.as_u32(), vec![0xFF; 3]);
        assert!(matches!(
            Message::from_frame(&frame),
            Err(WireError::Decode {
                kind: "Heartbeat",
                ..
            })
        ));
    }

    #[test]
    fn empty_participant_name_fails_to_decode() {
        let payload = postcard::to_allocvec(&String::new()).unwrap();
        let frame = Frame::new(MessageKind::Hello.as_u32(), payload);
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn snapshot_survives_a_stream_of_frames() {
        let snapshot = Snapshot::from(vec![7u8; 4096]);
        let mut buf = BytesMut::new();
        Message::Sync(Sync {
            snapshot: snapshot.clone(),
        })
        .encode(&mut buf)
        .unwrap();
        Message::SyncOk.encode(&mut buf).unwrap();

        let first = Frame::decode(&mut buf).unwrap().unwrap();
        let second = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            Message::from_frame(&first).unwrap(),
            Message::Sync(Sync { snapshot })
        );
        assert_eq!(Message::from_frame(&second).unwrap(), Message::SyncOk);
    }

    #[test]
    fn oversized_snapshot_is_not_queued() {
        let mut buf = BytesMut::new();
        let sync = Message::Sync(Sync {
            snapshot: Snapshot::from(vec![1u8; MAX_PAYLOAD_SIZE + 1]),
        });
        assert!(matches!(
            sync.encode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn report_failure_datagram() {
        let message = Message::ReportFailure(ReportFailure {
            generation: Generation::new(2),
            failed: id("a"),
            replacement: id("c"),
        });
        let datagram = message.to_datagram().unwrap();
        assert_eq!(&datagram[..4], &2u32.to_be_bytes());
        assert_eq!(Message::from_datagram(&datagram).unwrap(), message);
    }

    fn arb_id() -> impl Strategy<Value = ParticipantId> {
        "[a-z0-9_-]{1,16}".prop_map(|s| ParticipantId::new(s).unwrap())
    }

    fn arb_view() -> impl Strategy<Value = View> {
        (
            1u64..u64::MAX,
            arb_id(),
            proptest::option::of(arb_id()),
            any::<[u8; 4]>(),
            any::<u16>(),
        )
            .prop_map(|(generation, primary, backup, ip, port)| View {
                generation: Generation::new(generation),
                primary,
                backup,
                primary_address: SocketAddr::from((ip, port)),
            })
    }

    proptest! {
        #[test]
        fn view_reply_decodes_to_the_same_view(
            view in arb_view(),
            n in any::<u32>(),
            k in any::<u32>(),
        ) {
            let message = Message::ViewReply(ViewReply {
                view,
                params: ReplicationParams { n, k },
            });
            let decoded = Message::from_datagram(&message.to_datagram().unwrap()).unwrap();
            prop_assert_eq!(decoded, message);
        }
    }

    #[test]
    fn view_without_backup_keeps_none() {
        let message = Message::ViewReply(ViewReply {
            view: View::initial(id("a"), addr()),
            params: ReplicationParams::default(),
        });
        let decoded = Message::from_datagram(&message.to_datagram().unwrap()).unwrap();
        match decoded {
            Message::ViewReply(reply) => assert!(reply.view.backup.is_none()),
            other => panic!("expected view reply, got {other:?}"),
        }
    }
}
