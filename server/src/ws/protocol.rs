//! Signaling Wire Protocol
//!
//! JSON text frames over WebSocket. Client requests carry a numeric `id`
//! echoed in the matching ack; server-initiated notifications
//! (`newProducers`, `consumerClosed`) carry no id. Request payloads mix
//! `room_id`/`transport_id` with `rtpParameters`-style keys, matching what
//! the browser clients send, so fields are renamed explicitly.

use serde::{Deserialize, Serialize};

use crate::engine::{
    ConsumeParams, ConsumerId, DtlsParameters, MediaKind, PeerId, ProducerId, RoomId,
    RouterRtpCapabilities, RtpCapabilities, RtpParameters, TransportId, TransportParams,
};
use crate::session::SessionError;

/// A client request: correlation id plus the command itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: u64,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// Client-to-server signaling commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientCommand {
    /// Create a room with a client-chosen id.
    CreateRoom { room_id: RoomId },
    /// Join an existing room.
    Join { room_id: RoomId, name: String },
    /// Ask the server to (re)announce existing producers via `newProducers`.
    GetProducers,
    /// Fetch the room router's capability set.
    GetRouterRtpCapabilities,
    /// Create a bidirectional WebRTC transport.
    CreateWebRtcTransport,
    /// Complete the DTLS handshake on a transport.
    ConnectTransport {
        transport_id: TransportId,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    /// Start sending a stream.
    Produce {
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: RtpParameters,
        #[serde(rename = "producerTransportId")]
        producer_transport_id: TransportId,
    },
    /// Start receiving another peer's producer.
    Consume {
        #[serde(rename = "consumerTransportId")]
        consumer_transport_id: TransportId,
        #[serde(rename = "producerId")]
        producer_id: ProducerId,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: RtpCapabilities,
    },
    /// Resume a paused consumer.
    Resume {
        #[serde(rename = "consumerId")]
        consumer_id: ConsumerId,
    },
    /// Stop sending one stream.
    CloseProducer {
        #[serde(rename = "producerId")]
        producer_id: ProducerId,
    },
    /// Leave the current room.
    Leave,
}

/// One producer entry in listings and announcements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
}

/// One peer entry in a room summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: PeerId,
    pub name: String,
}

/// Serializable room view returned from `join`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: RoomId,
    pub peers: Vec<PeerSummary>,
}

/// Server-to-client messages: acks and notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Successful acknowledgement of request `id`.
    Ack { id: u64, data: AckData },
    /// Failed acknowledgement of request `id`.
    AckError {
        id: u64,
        code: ErrorCode,
        message: String,
    },
    /// Producers newly available (or re-announced) in the peer's room.
    NewProducers { producers: Vec<ProducerInfo> },
    /// A consumer of this peer was closed because its producer went away.
    ConsumerClosed { consumer_id: ConsumerId },
}

/// Typed success payload, one variant per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AckData {
    RoomCreated {
        room_id: RoomId,
    },
    Joined {
        #[serde(flatten)]
        room: RoomSummary,
    },
    ProducersRequested,
    RouterRtpCapabilities(RouterRtpCapabilities),
    TransportCreated(TransportParams),
    TransportConnected,
    Produced {
        producer_id: ProducerId,
    },
    ConsumerCreated(ConsumeParams),
    Resumed,
    ProducerClosed,
    Left,
}

/// Error classification carried in failed acks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    RoomExists,
    RoomClosed,
    PeerNotFound,
    AlreadyJoined,
    TransportNotFound,
    UnknownProducer,
    ConsumerNotFound,
    IncompatibleCapabilities,
    PeerClosed,
    NotInRoom,
    Engine,
    BadRequest,
}

impl From<&SessionError> for ErrorCode {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::RoomNotFound(_) => Self::RoomNotFound,
            SessionError::RoomExists(_) => Self::RoomExists,
            SessionError::RoomClosed(_) => Self::RoomClosed,
            SessionError::PeerNotFound(_) => Self::PeerNotFound,
            SessionError::AlreadyJoined(_) => Self::AlreadyJoined,
            SessionError::TransportNotFound(_) => Self::TransportNotFound,
            SessionError::UnknownProducer(_) => Self::UnknownProducer,
            SessionError::ConsumerNotFound(_) => Self::ConsumerNotFound,
            SessionError::IncompatibleCapabilities(_) => Self::IncompatibleCapabilities,
            SessionError::PeerClosed => Self::PeerClosed,
            SessionError::NotInRoom => Self::NotInRoom,
            SessionError::Engine(_) => Self::Engine,
        }
    }
}
