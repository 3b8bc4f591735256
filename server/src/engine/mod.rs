//! Media Engine Boundary
//!
//! Abstract capability interface to the external SFU engine. The signaling
//! core only ever talks to these traits: create a router per room, create
//! transports on it, produce and consume streams, and observe lifecycle
//! events. Transport security, NAT traversal and RTP forwarding live behind
//! this boundary and are none of our business.
//!
//! Handles follow the webrtc-rs callback convention: one-shot `on_*` hooks
//! taking boxed closures that return pinned futures.

pub mod local;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use types::{
    ConsumeParams, ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState,
    IceCandidate, IceParameters, IceProtocol, ListenIp, MediaKind, PeerId, ProducerId, RoomId,
    RouterRtpCapabilities, RtpCapabilities, RtpCodecCapability, RtpCodecParameters, RtpParameters,
    TransportId, TransportParams, WebRtcTransportOptions,
};

/// Future returned by lifecycle event handlers.
pub type EventFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One-shot lifecycle hook (`close`, `transportclose`, `producerclose`).
pub type OnCloseHandler = Box<dyn FnOnce() -> EventFuture + Send + 'static>;

/// Repeating hook for DTLS state transitions.
pub type OnDtlsStateHandler = Box<dyn FnMut(DtlsState) -> EventFuture + Send + 'static>;

/// Errors surfaced by the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation on a transport that has already been closed.
    #[error("transport is closed")]
    TransportClosed,

    /// The referenced producer does not exist on the router.
    #[error("producer not found on router: {0}")]
    ProducerNotFound(ProducerId),

    /// The router rejected a consume request.
    #[error("consume rejected: {0}")]
    ConsumeRejected(String),

    /// Anything else the engine reports.
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Entry point into the external media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router negotiating the given codec set.
    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError>;

    /// Register a hook fired if the engine worker dies.
    async fn on_died(&self, handler: OnCloseHandler);
}

/// Per-room router hosting transports and negotiating shared capabilities.
#[async_trait]
pub trait Router: Send + Sync {
    /// Negotiated codec/capability set. Stable for the router lifetime.
    fn rtp_capabilities(&self) -> RouterRtpCapabilities;

    /// Create a bidirectional WebRTC transport bound to this router.
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError>;

    /// Whether a consumer with the given capabilities could consume the producer.
    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool;

    /// Close the router and everything hosted on it.
    async fn close(&self);
}

/// A secured network path used to send or receive media.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Handshake parameters for the client side.
    fn params(&self) -> TransportParams;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    /// Cap the inbound bitrate on this transport.
    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError>;

    /// Create an outbound stream on this transport.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError>;

    /// Create an inbound stream sourced from another peer's producer.
    /// Consumers start unpaused.
    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError>;

    /// Close the transport, cascading to everything created on it.
    async fn close(&self);

    async fn on_dtls_state_change(&self, handler: OnDtlsStateHandler);

    async fn on_close(&self, handler: OnCloseHandler);
}

/// An outbound media stream a peer sends into the room.
#[async_trait]
pub trait Producer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn close(&self);

    /// Fired when the owning transport closes underneath this producer.
    async fn on_transport_close(&self, handler: OnCloseHandler);
}

/// An inbound media stream a peer receives from another peer's producer.
#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn kind(&self) -> MediaKind;

    fn consumer_type(&self) -> ConsumerType;

    fn rtp_parameters(&self) -> RtpParameters;

    fn producer_paused(&self) -> bool;

    /// Resume a paused consumer.
    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);

    /// Fired when the owning transport closes underneath this consumer.
    async fn on_transport_close(&self, handler: OnCloseHandler);

    /// Fired when the upstream producer closes.
    async fn on_producer_close(&self, handler: OnCloseHandler);
}
