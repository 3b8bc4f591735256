//! Room Coordination
//!
//! Mediates all peer actions within one room: transport creation,
//! produce/consume, notifications and teardown. A peer can only reach
//! another peer's handles through the explicit produce/consume protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::peer::PeerSession;
use crate::config::Config;
use crate::engine::{
    ConsumeParams, ConsumerId, DtlsParameters, DtlsState, MediaEngine, MediaKind, PeerId,
    ProducerId, RoomId, Router, RouterRtpCapabilities, RtpCapabilities, RtpParameters, Transport,
    TransportId, TransportParams,
};
use crate::ws::{PeerSummary, ProducerInfo, RoomSummary, ServerEvent};

/// A room: one shared router plus the set of peer sessions in it.
pub struct Room {
    /// Room identifier, globally unique while the room exists.
    pub id: RoomId,
    /// Router handle, created once at room creation and shared read-only.
    router: Arc<dyn Router>,
    /// Insertion-ordered so producer listings follow join order.
    peers: RwLock<IndexMap<PeerId, Arc<PeerSession>>>,
    /// Set once the room is torn down; stale handles must not admit peers.
    closed: AtomicBool,
    config: Arc<Config>,
}

impl Room {
    /// Create a room, requesting a router from the engine up front so the
    /// capability set is available before the room becomes visible.
    pub async fn new(
        id: RoomId,
        engine: &dyn MediaEngine,
        config: Arc<Config>,
    ) -> Result<Self, SessionError> {
        let router = engine.create_router(config.router_codecs.clone()).await?;
        Ok(Self {
            id,
            router,
            peers: RwLock::new(IndexMap::new()),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Whether this room has been torn down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Add a peer to the room. Rejects a duplicate peer id rather than
    /// silently replacing the prior session, and rejects joins through a
    /// handle whose room was already torn down.
    pub async fn add_peer(&self, peer: Arc<PeerSession>) -> Result<(), SessionError> {
        let mut peers = self.peers.write().await;
        if self.is_closed() {
            return Err(SessionError::RoomClosed(self.id.clone()));
        }
        if peers.contains_key(&peer.id) {
            return Err(SessionError::AlreadyJoined(peer.id));
        }
        peers.insert(peer.id, peer);
        Ok(())
    }

    /// Get a peer by id.
    pub async fn get_peer(&self, peer_id: PeerId) -> Option<Arc<PeerSession>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    /// Every producer across every peer, in peer join order then per-peer
    /// producer creation order. Not stable across calls; producers come and
    /// go concurrently.
    pub async fn producer_list(&self) -> Vec<ProducerInfo> {
        let peers: Vec<Arc<PeerSession>> = self.peers.read().await.values().cloned().collect();

        let mut producers = Vec::new();
        for peer in peers {
            for producer_id in peer.producer_ids().await {
                producers.push(ProducerInfo { producer_id });
            }
        }
        producers
    }

    /// The router's negotiated codec/capability set.
    pub fn rtp_capabilities(&self) -> RouterRtpCapabilities {
        self.router.rtp_capabilities()
    }

    /// Create a bidirectional transport for a peer and attach it to the
    /// session. Returns the handshake parameters for the client.
    pub async fn create_transport(&self, peer_id: PeerId) -> Result<TransportParams, SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;

        let transport = self
            .router
            .create_webrtc_transport(self.config.webrtc_transport_options())
            .await?;

        if let Some(bitrate) = self.config.max_incoming_bitrate {
            // Best effort; a transport without the cap still works.
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!(
                    transport_id = %transport.id(),
                    error = %e,
                    "Failed to apply incoming bitrate cap"
                );
            }
        }

        let weak = Arc::downgrade(&transport);
        let peer_name = peer.display_name.clone();
        transport
            .on_dtls_state_change(Box::new(move |state: DtlsState| {
                let weak = weak.clone();
                let peer_name = peer_name.clone();
                Box::pin(async move {
                    if state == DtlsState::Closed {
                        info!(peer = %peer_name, "DTLS closed, closing transport");
                        if let Some(transport) = weak.upgrade() {
                            transport.close().await;
                        }
                    }
                })
            }))
            .await;

        let peer_name = peer.display_name.clone();
        transport
            .on_close(Box::new(move || {
                Box::pin(async move {
                    debug!(peer = %peer_name, "Transport closed");
                })
            }))
            .await;

        let params = transport.params();
        debug!(peer_id = %peer_id, transport_id = %params.id, "Attaching transport");
        peer.add_transport(transport).await?;

        Ok(params)
    }

    /// Forward the client's DTLS parameters to the named transport.
    pub async fn connect_transport(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;
        peer.connect_transport(transport_id, dtls_parameters).await
    }

    /// Create a producer for a peer and announce it to every other peer.
    ///
    /// The returned producer id and the `newProducers` broadcast are not
    /// ordered relative to each other from the clients' point of view.
    pub async fn produce(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        rtp_parameters: RtpParameters,
        kind: MediaKind,
    ) -> Result<ProducerId, SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;

        let producer = peer
            .create_producer(transport_id, rtp_parameters, kind)
            .await?;
        let producer_id = producer.id();

        info!(
            room_id = %self.id,
            peer = %peer.display_name,
            kind = %kind,
            producer_id = %producer_id,
            "Producer created"
        );

        self.broadcast_except(
            peer_id,
            ServerEvent::NewProducers {
                producers: vec![ProducerInfo { producer_id }],
            },
        )
        .await;

        Ok(producer_id)
    }

    /// Create a consumer for a peer over another peer's producer.
    ///
    /// Fails fast when the producer is unknown to this room or the
    /// capability check rejects the pairing.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeParams, SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;

        if !self.has_producer(producer_id).await {
            return Err(SessionError::UnknownProducer(producer_id));
        }
        if !self.router.can_consume(producer_id, &rtp_capabilities).await {
            return Err(SessionError::IncompatibleCapabilities(producer_id));
        }

        let (consumer, params) = peer
            .create_consumer(transport_id, producer_id, rtp_capabilities.clone())
            .await?;

        // When the upstream producer goes away, drop the consumer and tell
        // this one peer, directed, not broadcast.
        let weak = Arc::downgrade(&peer);
        let consumer_id = consumer.id();
        consumer
            .on_producer_close(Box::new(move || {
                Box::pin(async move {
                    if let Some(peer) = weak.upgrade() {
                        info!(
                            peer = %peer.display_name,
                            consumer_id = %consumer_id,
                            "Consumer closed due to producer close"
                        );
                        peer.remove_consumer(consumer_id).await;
                        if peer
                            .signal_tx
                            .send(ServerEvent::ConsumerClosed { consumer_id })
                            .await
                            .is_err()
                        {
                            debug!(consumer_id = %consumer_id, "Peer channel gone, skipping consumerClosed");
                        }
                    }
                })
            }))
            .await;

        // The producer can close between consumer creation and the hook
        // registration above, firing into an empty handler slot. The router
        // drops closed producers, so a failed recheck means it is gone.
        if !self.router.can_consume(producer_id, &rtp_capabilities).await {
            peer.remove_consumer(params.id).await;
            consumer.close().await;
            return Err(SessionError::UnknownProducer(producer_id));
        }

        debug!(
            room_id = %self.id,
            peer = %peer.display_name,
            producer_id = %producer_id,
            consumer_id = %params.id,
            "Consumer created"
        );

        Ok(params)
    }

    /// Close and remove a single producer owned by a peer.
    pub async fn close_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<(), SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;
        peer.close_producer(producer_id).await
    }

    /// Resume one of a peer's consumers.
    pub async fn resume_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SessionError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or(SessionError::PeerNotFound(peer_id))?;
        peer.resume_consumer(consumer_id).await
    }

    /// Remove a peer and close everything it owns.
    pub async fn remove_peer(&self, peer_id: PeerId) -> Option<Arc<PeerSession>> {
        let peer = self.peers.write().await.shift_remove(&peer_id)?;
        peer.close().await;
        info!(room_id = %self.id, peer = %peer.display_name, "Peer removed");
        Some(peer)
    }

    /// Send an event to every peer in the room except one.
    ///
    /// Sender handles are cloned out first so the peer map lock is not held
    /// during I/O.
    pub async fn broadcast_except(&self, exclude_peer_id: PeerId, event: ServerEvent) {
        let senders: Vec<(PeerId, mpsc::Sender<ServerEvent>)> = {
            let peers = self.peers.read().await;
            peers
                .iter()
                .filter(|(id, _)| **id != exclude_peer_id)
                .map(|(id, peer)| (*id, peer.signal_tx.clone()))
                .collect()
        };

        for (peer_id, tx) in senders {
            if let Err(e) = tx.send(event.clone()).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to send event to peer");
            }
        }
    }

    /// Directed event to a single peer.
    pub async fn send_to(&self, peer_id: PeerId, event: ServerEvent) {
        let tx = {
            let peers = self.peers.read().await;
            peers.get(&peer_id).map(|peer| peer.signal_tx.clone())
        };
        if let Some(tx) = tx {
            if let Err(e) = tx.send(event).await {
                warn!(peer_id = %peer_id, error = %e, "Failed to send event to peer");
            }
        }
    }

    /// Serializable view of the room for client display.
    pub async fn summary(&self) -> RoomSummary {
        let peers = self.peers.read().await;
        RoomSummary {
            id: self.id.clone(),
            peers: peers
                .values()
                .map(|peer| PeerSummary {
                    id: peer.id,
                    name: peer.display_name.clone(),
                })
                .collect(),
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Tear the room down: every peer session, then the router.
    ///
    /// The closed flag goes up before the peer map is drained, so a `join`
    /// racing the teardown either gets [`SessionError::RoomClosed`] or its
    /// session is closed along with the rest.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<Arc<PeerSession>> = {
            let mut map = self.peers.write().await;
            map.drain(..).map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            peer.close().await;
        }
        self.router.close().await;
    }

    /// Whether any peer in the room owns the given producer.
    async fn has_producer(&self, producer_id: ProducerId) -> bool {
        let peers: Vec<Arc<PeerSession>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            if peer.has_producer(producer_id).await {
                return true;
            }
        }
        false
    }

    #[cfg(test)]
    pub(crate) async fn has_producer_for_test(&self, producer_id: ProducerId) -> bool {
        self.has_producer(producer_id).await
    }
}
