//! Peer Session State
//!
//! Per-connection bookkeeping: the transports, producers and consumers a
//! peer owns. Every handle is reachable from exactly one session; cleanup
//! hooks guard against a producer or consumer outliving its transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::error::SessionError;
use crate::engine::{
    ConsumeParams, Consumer, ConsumerId, DtlsParameters, MediaKind, PeerId, Producer, ProducerId,
    RtpCapabilities, RtpParameters, Transport, TransportId,
};
use crate::ws::ServerEvent;

/// A peer's session within one room.
pub struct PeerSession {
    /// Connection identifier, stable for the connection lifetime.
    pub id: PeerId,
    /// Human-readable label, set at join time.
    pub display_name: String,
    /// Channel to send signaling events back to the peer.
    pub signal_tx: mpsc::Sender<ServerEvent>,
    /// Set once the session is torn down; late registrations are rejected.
    closed: AtomicBool,
    transports: RwLock<HashMap<TransportId, Arc<dyn Transport>>>,
    /// Insertion-ordered so producer listings are stable per peer.
    producers: RwLock<IndexMap<ProducerId, Arc<dyn Producer>>>,
    consumers: RwLock<HashMap<ConsumerId, Arc<dyn Consumer>>>,
}

impl PeerSession {
    #[must_use]
    pub fn new(id: PeerId, display_name: String, signal_tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            display_name,
            signal_tx,
            closed: AtomicBool::new(false),
            transports: RwLock::new(HashMap::new()),
            producers: RwLock::new(IndexMap::new()),
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// Whether this session has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Attach a transport to this session.
    ///
    /// If the session raced a disconnect and is already closed, the transport
    /// is closed instead of leaking into a dead session.
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) -> Result<(), SessionError> {
        if self.is_closed() {
            transport.close().await;
            return Err(SessionError::PeerClosed);
        }
        self.transports
            .write()
            .await
            .insert(transport.id(), transport);
        Ok(())
    }

    /// Complete the DTLS handshake on one of this peer's transports.
    pub async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SessionError> {
        let transport = self
            .transport(transport_id)
            .await
            .ok_or(SessionError::TransportNotFound(transport_id))?;
        transport.connect(dtls_parameters).await?;
        Ok(())
    }

    /// Create a producer on the named transport and register it.
    pub async fn create_producer(
        self: &Arc<Self>,
        transport_id: TransportId,
        rtp_parameters: RtpParameters,
        kind: MediaKind,
    ) -> Result<Arc<dyn Producer>, SessionError> {
        let transport = self
            .transport(transport_id)
            .await
            .ok_or(SessionError::TransportNotFound(transport_id))?;

        let producer = transport.produce(kind, rtp_parameters).await?;

        if self.is_closed() {
            // Disconnect won the race while the engine call was in flight.
            producer.close().await;
            return Err(SessionError::PeerClosed);
        }

        let producer_id = producer.id();
        self.producers
            .write()
            .await
            .insert(producer_id, producer.clone());

        // Guard against the producer outliving its transport.
        let weak = Arc::downgrade(self);
        producer
            .on_transport_close(Box::new(move || {
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        debug!(
                            peer = %peer.display_name,
                            producer_id = %producer_id,
                            "Producer transport closed, dropping producer"
                        );
                        peer.producers.write().await.shift_remove(&producer_id);
                    }
                })
            }))
            .await;

        Ok(producer)
    }

    /// Create a consumer (initially unpaused) for a remote producer.
    ///
    /// Returns the live handle plus the serializable parameter bundle for
    /// relay to the client.
    pub async fn create_consumer(
        self: &Arc<Self>,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(Arc<dyn Consumer>, ConsumeParams), SessionError> {
        let transport = self
            .transport(transport_id)
            .await
            .ok_or(SessionError::TransportNotFound(transport_id))?;

        let consumer = transport.consume(producer_id, rtp_capabilities).await?;

        if self.is_closed() {
            consumer.close().await;
            return Err(SessionError::PeerClosed);
        }

        let consumer_id = consumer.id();
        self.consumers
            .write()
            .await
            .insert(consumer_id, consumer.clone());

        let weak = Arc::downgrade(self);
        consumer
            .on_transport_close(Box::new(move || {
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        debug!(
                            peer = %peer.display_name,
                            consumer_id = %consumer_id,
                            "Consumer transport closed, dropping consumer"
                        );
                        peer.consumers.write().await.remove(&consumer_id);
                    }
                })
            }))
            .await;

        let params = ConsumeParams {
            producer_id,
            id: consumer_id,
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        };

        Ok((consumer, params))
    }

    /// Close one producer and drop it from the session.
    pub async fn close_producer(&self, producer_id: ProducerId) -> Result<(), SessionError> {
        let producer = self
            .producers
            .write()
            .await
            .shift_remove(&producer_id)
            .ok_or(SessionError::UnknownProducer(producer_id))?;
        producer.close().await;
        Ok(())
    }

    /// Resume one of this peer's consumers.
    pub async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), SessionError> {
        let consumer = {
            let consumers = self.consumers.read().await;
            consumers
                .get(&consumer_id)
                .cloned()
                .ok_or(SessionError::ConsumerNotFound(consumer_id))?
        };
        consumer.resume().await?;
        Ok(())
    }

    /// Bookkeeping-only removal of a consumer.
    pub async fn remove_consumer(&self, consumer_id: ConsumerId) {
        self.consumers.write().await.remove(&consumer_id);
    }

    /// Ids of every producer this peer is currently sending.
    pub async fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.read().await.keys().copied().collect()
    }

    /// Whether this peer owns the given producer.
    pub async fn has_producer(&self, producer_id: ProducerId) -> bool {
        self.producers.read().await.contains_key(&producer_id)
    }

    pub async fn transport_count(&self) -> usize {
        self.transports.read().await.len()
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Close every owned transport and mark the session dead.
    ///
    /// Producer/consumer cleanup cascades through the engine's own
    /// transport-close events.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let transports: Vec<Arc<dyn Transport>> = {
            let mut map = self.transports.write().await;
            map.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.close().await;
        }
    }

    async fn transport(&self, transport_id: TransportId) -> Option<Arc<dyn Transport>> {
        self.transports.read().await.get(&transport_id).cloned()
    }
}
