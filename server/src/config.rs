//! Server Configuration
//!
//! Loads configuration from environment variables.

use std::env;

use anyhow::Result;

use crate::engine::{ListenIp, MediaKind, RtpCodecCapability, WebRtcTransportOptions};

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:3016")
    pub bind_address: String,

    /// Local IP WebRTC transports listen on
    pub listen_ip: String,

    /// Public IP announced to clients when behind NAT (optional)
    pub announced_ip: Option<String>,

    /// Inbound bitrate cap per transport in bps (optional)
    pub max_incoming_bitrate: Option<u32>,

    /// Initial outgoing bitrate estimate per transport in bps
    pub initial_available_outgoing_bitrate: u32,

    /// Codec set each room router negotiates
    pub router_codecs: Vec<RtpCodecCapability>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3016".into()),
            listen_ip: env::var("LISTEN_IP").unwrap_or_else(|_| "0.0.0.0".into()),
            announced_ip: env::var("ANNOUNCED_IP").ok(),
            max_incoming_bitrate: env::var("MAX_INCOMING_BITRATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(Some(1_500_000)),
            initial_available_outgoing_bitrate: env::var("INITIAL_OUTGOING_BITRATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            router_codecs: default_router_codecs(),
        })
    }

    /// Transport options derived from this configuration.
    #[must_use]
    pub fn webrtc_transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: self.listen_ip.clone(),
                announced_ip: self.announced_ip.clone(),
            }],
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_available_outgoing_bitrate,
        }
    }

    /// Create a default configuration for testing.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:3016".into(),
            listen_ip: "127.0.0.1".into(),
            announced_ip: None,
            max_incoming_bitrate: Some(1_500_000),
            initial_available_outgoing_bitrate: 1_000_000,
            router_codecs: default_router_codecs(),
        }
    }
}

/// Opus audio plus VP8 video, enough for voice rooms with webcam streams.
fn default_router_codecs() -> Vec<RtpCodecCapability> {
    let mut opus_params = serde_json::Map::new();
    opus_params.insert("useinbandfec".into(), 1.into());

    let mut vp8_params = serde_json::Map::new();
    vp8_params.insert("x-google-start-bitrate".into(), 1000.into());

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".into(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: opus_params,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".into(),
            clock_rate: 90_000,
            channels: None,
            parameters: vp8_params,
        },
    ]
}
