//! Parley Server
//!
//! Room and peer signaling in front of an external SFU media engine.
//! The engine does the heavy lifting (DTLS/ICE, RTP forwarding); this crate
//! owns room membership, handle bookkeeping and the WebSocket protocol.

pub mod config;
pub mod engine;
pub mod session;
pub mod ws;
