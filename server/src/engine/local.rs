//! In-Process Media Engine
//!
//! A loopback implementation of the engine capability traits with faithful
//! lifecycle semantics: closing a transport closes the producers and
//! consumers created on it, and closing a producer fires `producerclose`
//! on every consumer sourced from it, router-wide. ICE/DTLS parameters are
//! synthetic. Used by the development binary and the test suite; a real SFU
//! backend plugs in through the same traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    Consumer, ConsumerId, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState,
    EngineError, IceCandidate, IceParameters, IceProtocol, MediaEngine, MediaKind, OnCloseHandler,
    OnDtlsStateHandler, Producer, ProducerId, Router, RouterRtpCapabilities, RtpCapabilities,
    RtpCodecCapability, RtpParameters, Transport, TransportId, TransportParams,
    WebRtcTransportOptions,
};

/// Fire a one-shot lifecycle hook if one is registered.
async fn fire_once(slot: &Mutex<Option<OnCloseHandler>>) {
    let handler = slot.lock().await.take();
    if let Some(handler) = handler {
        handler().await;
    }
}

/// Fire the DTLS state hook without holding its lock across the await.
async fn fire_dtls(slot: &Mutex<Option<OnDtlsStateHandler>>, state: DtlsState) {
    let fut = {
        let mut guard = slot.lock().await;
        guard.as_mut().map(|handler| handler(state))
    };
    if let Some(fut) = fut {
        fut.await;
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_fingerprint() -> DtlsFingerprint {
    let bytes: [u8; 32] = rand::random();
    let value = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".into(),
        value,
    }
}

/// The in-process engine. Never dies on its own.
pub struct LocalEngine {
    died: Mutex<Option<OnCloseHandler>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            died: Mutex::new(None),
        }
    }
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(
        &self,
        codecs: Vec<RtpCodecCapability>,
    ) -> Result<Arc<dyn Router>, EngineError> {
        debug!(codec_count = codecs.len(), "Creating local router");
        Ok(Arc::new(LocalRouter::new(codecs)))
    }

    async fn on_died(&self, handler: OnCloseHandler) {
        *self.died.lock().await = Some(handler);
    }
}

/// Producer bookkeeping shared across the router.
struct ProducerEntry {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
}

/// State shared between a router and the handles hosted on it.
struct RouterShared {
    producers: Mutex<HashMap<ProducerId, ProducerEntry>>,
    /// Consumers keyed by the producer they are sourced from.
    consumers: Mutex<HashMap<ProducerId, Vec<Weak<LocalConsumer>>>>,
}

impl RouterShared {
    fn codecs_compatible(entry: &ProducerEntry, capabilities: &RtpCapabilities) -> bool {
        if entry.rtp_parameters.codecs.is_empty() {
            // Producer without an explicit codec list: kind match is enough.
            return capabilities.codecs.iter().any(|c| c.kind == entry.kind);
        }
        capabilities.codecs.iter().any(|cap| {
            cap.kind == entry.kind
                && entry
                    .rtp_parameters
                    .codecs
                    .iter()
                    .any(|pc| pc.mime_type.eq_ignore_ascii_case(&cap.mime_type))
        })
    }

    /// Drop a producer and fire `producerclose` on every consumer of it.
    async fn close_producer(&self, producer_id: ProducerId) {
        self.producers.lock().await.remove(&producer_id);

        let consumers: Vec<Arc<LocalConsumer>> = self
            .consumers
            .lock()
            .await
            .remove(&producer_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .collect();

        for consumer in consumers {
            consumer.producer_closed().await;
        }
    }
}

/// Per-room router of the local engine.
pub struct LocalRouter {
    capabilities: RouterRtpCapabilities,
    shared: Arc<RouterShared>,
    closed: AtomicBool,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
}

impl LocalRouter {
    fn new(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            capabilities: RouterRtpCapabilities { codecs },
            shared: Arc::new(RouterShared {
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
            }),
            closed: AtomicBool::new(false),
            transports: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn rtp_capabilities(&self) -> RouterRtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn Transport>, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("router is closed".into()));
        }

        let transport = Arc::new(LocalTransport::new(&options, self.shared.clone()));
        self.transports.lock().await.push(transport.clone());
        debug!(transport_id = %transport.id, "Created local transport");
        Ok(transport)
    }

    async fn can_consume(&self, producer_id: ProducerId, capabilities: &RtpCapabilities) -> bool {
        let producers = self.shared.producers.lock().await;
        producers
            .get(&producer_id)
            .is_some_and(|entry| RouterShared::codecs_compatible(entry, capabilities))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports = std::mem::take(&mut *self.transports.lock().await);
        for transport in transports {
            transport.close().await;
        }
    }
}

/// A transport of the local engine.
pub struct LocalTransport {
    id: TransportId,
    params: TransportParams,
    router: Arc<RouterShared>,
    closed: AtomicBool,
    max_incoming_bitrate: Mutex<Option<u32>>,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    on_dtls: Mutex<Option<OnDtlsStateHandler>>,
    on_close_handler: Mutex<Option<OnCloseHandler>>,
}

impl LocalTransport {
    fn new(options: &WebRtcTransportOptions, router: Arc<RouterShared>) -> Self {
        let id = TransportId::new();
        let mut candidates = Vec::new();
        let mut priority: u32 = 1_015_621_471;

        for listen_ip in &options.listen_ips {
            let ip = listen_ip
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.ip.clone());
            let port = rand::thread_rng().gen_range(40_000..=49_999);

            if options.enable_udp {
                candidates.push(IceCandidate {
                    foundation: "udpcandidate".into(),
                    priority,
                    ip: ip.clone(),
                    protocol: IceProtocol::Udp,
                    port,
                    candidate_type: "host".into(),
                });
                priority -= 1;
            }
            if options.enable_tcp {
                candidates.push(IceCandidate {
                    foundation: "tcpcandidate".into(),
                    priority,
                    ip,
                    protocol: IceProtocol::Tcp,
                    port,
                    candidate_type: "host".into(),
                });
                priority -= 1;
            }
        }

        let params = TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
        };

        Self {
            id,
            params,
            router,
            closed: AtomicBool::new(false),
            max_incoming_bitrate: Mutex::new(None),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            on_dtls: Mutex::new(None),
            on_close_handler: Mutex::new(None),
        }
    }

    /// Drive the DTLS state machine from a test or an embedding.
    pub async fn simulate_dtls_state(&self, state: DtlsState) {
        fire_dtls(&self.on_dtls, state).await;
    }

    /// Currently applied inbound bitrate cap.
    pub async fn current_max_incoming_bitrate(&self) -> Option<u32> {
        *self.max_incoming_bitrate.lock().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        fire_dtls(&self.on_dtls, DtlsState::Connecting).await;
        fire_dtls(&self.on_dtls, DtlsState::Connected).await;
        Ok(())
    }

    async fn set_max_incoming_bitrate(&self, bitrate: u32) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        *self.max_incoming_bitrate.lock().await = Some(bitrate);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn Producer>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(),
            kind,
            router: self.router.clone(),
            closed: AtomicBool::new(false),
            on_transport_close: Mutex::new(None),
        });

        self.router.producers.lock().await.insert(
            producer.id,
            ProducerEntry {
                kind,
                rtp_parameters,
                paused: false,
            },
        );
        self.producers.lock().await.push(producer.clone());

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Arc<dyn Consumer>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }

        let (kind, rtp_parameters, producer_paused) = {
            let producers = self.router.producers.lock().await;
            let entry = producers
                .get(&producer_id)
                .ok_or(EngineError::ProducerNotFound(producer_id))?;
            if !RouterShared::codecs_compatible(entry, &rtp_capabilities) {
                return Err(EngineError::ConsumeRejected(format!(
                    "capabilities do not cover producer {producer_id}"
                )));
            }
            (entry.kind, entry.rtp_parameters.clone(), entry.paused)
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(),
            kind,
            // An SFU would rewrite payload types here; the loopback engine
            // mirrors the producer's parameters.
            rtp_parameters,
            producer_paused,
            closed: AtomicBool::new(false),
            on_transport_close: Mutex::new(None),
            on_producer_close: Mutex::new(None),
        });

        self.router
            .consumers
            .lock()
            .await
            .entry(producer_id)
            .or_default()
            .push(Arc::downgrade(&consumer));
        self.consumers.lock().await.push(consumer.clone());

        Ok(consumer)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers = std::mem::take(&mut *self.producers.lock().await);
        let consumers = std::mem::take(&mut *self.consumers.lock().await);

        for producer in producers {
            producer.transport_closed().await;
        }
        for consumer in consumers {
            consumer.transport_closed().await;
        }

        fire_once(&self.on_close_handler).await;
    }

    async fn on_dtls_state_change(&self, handler: OnDtlsStateHandler) {
        *self.on_dtls.lock().await = Some(handler);
    }

    async fn on_close(&self, handler: OnCloseHandler) {
        *self.on_close_handler.lock().await = Some(handler);
    }
}

/// A producer of the local engine.
pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    router: Arc<RouterShared>,
    closed: AtomicBool,
    on_transport_close: Mutex<Option<OnCloseHandler>>,
}

impl LocalProducer {
    /// Owning transport closed underneath this producer.
    async fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        fire_once(&self.on_transport_close).await;
        self.router.close_producer(self.id).await;
    }
}

#[async_trait]
impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.close_producer(self.id).await;
    }

    async fn on_transport_close(&self, handler: OnCloseHandler) {
        *self.on_transport_close.lock().await = Some(handler);
    }
}

/// A consumer of the local engine.
pub struct LocalConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    producer_paused: bool,
    closed: AtomicBool,
    on_transport_close: Mutex<Option<OnCloseHandler>>,
    on_producer_close: Mutex<Option<OnCloseHandler>>,
}

impl LocalConsumer {
    /// Upstream producer closed.
    async fn producer_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        fire_once(&self.on_producer_close).await;
    }

    /// Owning transport closed underneath this consumer.
    async fn transport_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        fire_once(&self.on_transport_close).await;
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn consumer_type(&self) -> ConsumerType {
        ConsumerType::Simple
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("consumer is closed".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn on_transport_close(&self, handler: OnCloseHandler) {
        *self.on_transport_close.lock().await = Some(handler);
    }

    async fn on_producer_close(&self, handler: OnCloseHandler) {
        *self.on_producer_close.lock().await = Some(handler);
    }
}
