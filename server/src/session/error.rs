//! Session Coordination Errors

use thiserror::Error;

use crate::engine::{ConsumerId, EngineError, PeerId, ProducerId, RoomId, TransportId};

/// Errors that can occur while coordinating rooms and peer sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Room does not exist.
    #[error("room does not exist: {0}")]
    RoomNotFound(RoomId),

    /// Room identifier already taken.
    #[error("room already exists: {0}")]
    RoomExists(RoomId),

    /// Room has been torn down; a stale handle cannot accept peers.
    #[error("room is closed: {0}")]
    RoomClosed(RoomId),

    /// Peer not found in the room.
    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    /// Peer id already present in the room.
    #[error("peer already joined: {0}")]
    AlreadyJoined(PeerId),

    /// Transport not owned by the peer.
    #[error("transport not found: {0}")]
    TransportNotFound(TransportId),

    /// Producer not owned by any peer in the room.
    #[error("unknown producer: {0}")]
    UnknownProducer(ProducerId),

    /// Consumer not owned by the peer.
    #[error("consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Router capability check rejected the consume request.
    #[error("capabilities incompatible with producer {0}")]
    IncompatibleCapabilities(ProducerId),

    /// Operation arrived for a session that has already been closed.
    #[error("peer session is closed")]
    PeerClosed,

    /// Connection issued a room-scoped request before joining a room.
    #[error("not in a room")]
    NotInRoom,

    /// External engine call failed.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}
