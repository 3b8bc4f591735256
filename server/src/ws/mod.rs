//! Signaling Gateway
//!
//! One long-lived WebSocket per client. Parses signaling requests,
//! dispatches them to the room registry and coordinator, and replies with
//! acks correlated by request id; server-initiated notifications ride the
//! same connection.

pub mod protocol;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub use protocol::{
    AckData, ClientCommand, ClientRequest, ErrorCode, PeerSummary, ProducerInfo, RoomSummary,
    ServerEvent,
};

use crate::engine::PeerId;
use crate::session::{PeerSession, Room, RoomRegistry, SessionError};

/// Shared state handed to every connection.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<RoomRegistry>,
}

/// Build the axum router for the gateway.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// WebSocket upgrade handler.
pub async fn handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-connection signaling state.
struct Connection {
    peer_id: PeerId,
    registry: Arc<RoomRegistry>,
    /// Set once `join` succeeds; room-scoped commands require it.
    room: Option<Arc<Room>>,
    tx: mpsc::Sender<ServerEvent>,
}

/// Handle one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let peer_id = PeerId::new();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound channel; a writer task owns the sink so room broadcasts and
    // acks share one ordered pipe.
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(100);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    info!(peer_id = %peer_id, "Client connected");

    let mut conn = Connection {
        peer_id,
        registry: state.registry.clone(),
        room: None,
        tx: tx.clone(),
    };

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                Ok(request) => conn.dispatch(request).await,
                Err(e) => {
                    warn!(peer_id = %peer_id, error = %e, "Malformed request");
                    let _ = tx
                        .send(ServerEvent::AckError {
                            id: 0,
                            code: ErrorCode::BadRequest,
                            message: e.to_string(),
                        })
                        .await;
                }
            },
            Ok(Message::Close(_)) => {
                debug!(peer_id = %peer_id, "Close frame received");
                break;
            }
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "WebSocket error");
                break;
            }
            // Ping/pong handled by axum; binary frames have no meaning here.
            _ => {}
        }
    }

    conn.disconnect().await;
    writer.abort();

    info!(peer_id = %peer_id, "Client disconnected");
}

impl Connection {
    /// Run one command and send the matching ack.
    async fn dispatch(&mut self, request: ClientRequest) {
        let id = request.id;
        let result = self.handle(request.command).await;

        let event = match result {
            Ok(data) => ServerEvent::Ack { id, data },
            Err(e) => {
                debug!(peer_id = %self.peer_id, error = %e, "Request failed");
                ServerEvent::AckError {
                    id,
                    code: ErrorCode::from(&e),
                    message: e.to_string(),
                }
            }
        };

        if self.tx.send(event).await.is_err() {
            debug!(peer_id = %self.peer_id, "Connection gone before ack");
        }
    }

    async fn handle(&mut self, command: ClientCommand) -> Result<AckData, SessionError> {
        match command {
            ClientCommand::CreateRoom { room_id } => {
                let room = self.registry.create_room(room_id).await?;
                Ok(AckData::RoomCreated {
                    room_id: room.id.clone(),
                })
            }

            ClientCommand::Join { room_id, name } => {
                if self.room.is_some() {
                    return Err(SessionError::AlreadyJoined(self.peer_id));
                }

                let peer = Arc::new(PeerSession::new(self.peer_id, name, self.tx.clone()));
                let room = loop {
                    let room = self
                        .registry
                        .get_room(&room_id)
                        .await
                        .ok_or_else(|| SessionError::RoomNotFound(room_id.clone()))?;
                    match room.add_peer(peer.clone()).await {
                        Ok(()) => break room,
                        // Teardown raced the lookup; the registry dropped the
                        // room before closing it, so look it up again.
                        Err(SessionError::RoomClosed(_)) => continue,
                        Err(e) => return Err(e),
                    }
                };
                info!(peer_id = %self.peer_id, room_id = %room.id, "Peer joined room");

                let summary = room.summary().await;
                self.room = Some(room);
                Ok(AckData::Joined { room: summary })
            }

            ClientCommand::GetProducers => {
                let room = self.room()?;
                let producers = room.producer_list().await;
                // The catalog answers this with a newProducers notification,
                // same shape as a live announcement.
                let _ = self.tx.send(ServerEvent::NewProducers { producers }).await;
                Ok(AckData::ProducersRequested)
            }

            ClientCommand::GetRouterRtpCapabilities => {
                let room = self.room()?;
                Ok(AckData::RouterRtpCapabilities(room.rtp_capabilities()))
            }

            ClientCommand::CreateWebRtcTransport => {
                let room = self.room()?;
                let params = room.create_transport(self.peer_id).await?;
                Ok(AckData::TransportCreated(params))
            }

            ClientCommand::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room = self.room()?;
                room.connect_transport(self.peer_id, transport_id, dtls_parameters)
                    .await?;
                Ok(AckData::TransportConnected)
            }

            ClientCommand::Produce {
                kind,
                rtp_parameters,
                producer_transport_id,
            } => {
                let room = self.room()?;
                let producer_id = room
                    .produce(self.peer_id, producer_transport_id, rtp_parameters, kind)
                    .await?;
                Ok(AckData::Produced { producer_id })
            }

            ClientCommand::Consume {
                consumer_transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let room = self.room()?;
                let params = room
                    .consume(
                        self.peer_id,
                        consumer_transport_id,
                        producer_id,
                        rtp_capabilities,
                    )
                    .await?;
                Ok(AckData::ConsumerCreated(params))
            }

            ClientCommand::Resume { consumer_id } => {
                let room = self.room()?;
                room.resume_consumer(self.peer_id, consumer_id).await?;
                Ok(AckData::Resumed)
            }

            ClientCommand::CloseProducer { producer_id } => {
                let room = self.room()?;
                room.close_producer(self.peer_id, producer_id).await?;
                Ok(AckData::ProducerClosed)
            }

            ClientCommand::Leave => {
                self.leave().await?;
                Ok(AckData::Left)
            }
        }
    }

    fn room(&self) -> Result<&Arc<Room>, SessionError> {
        self.room.as_ref().ok_or(SessionError::NotInRoom)
    }

    async fn leave(&mut self) -> Result<(), SessionError> {
        let room = self.room.take().ok_or(SessionError::NotInRoom)?;
        room.remove_peer(self.peer_id).await;
        self.registry.close_if_empty(&room.id).await;
        Ok(())
    }

    /// Connection-close cleanup: same path as an explicit leave.
    async fn disconnect(&mut self) {
        if let Some(room) = self.room.take() {
            room.remove_peer(self.peer_id).await;
            self.registry.close_if_empty(&room.id).await;
        }
    }
}
