//! WebRTC signaling coordinator for recording and playback
//!
//! Brokers WebRTC session setup between browser clients and a Kurento-style
//! media server: a browser either records its stream to a media URI or
//! replays what was recorded there. This crate owns the signaling state
//! machine, ICE candidate buffering, and the lifetime of the backend
//! pipelines and endpoints each session creates.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Browser clients                                       │
//! │  ↓ (WebSocket, JSON messages keyed by `id`)            │
//! │  SignalingServer / handle_connection                   │
//! │  └─ SignalingSession (per connection state machine)    │
//! │     ├─ SessionRegistry (live calls, stop tombstones)   │
//! │     │   └─ CandidateBuffer / CandidateLane             │
//! │     └─ PipelineManager (pipelines, endpoints, wiring)  │
//! │        ↓                                               │
//! │  ClientHandle (one shared backend connection)          │
//! │  └─ KurentoClient (JSON-RPC 2.0 over WebSocket)        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use recplay_signaling::SignalingConfig;
//!
//! let config = SignalingConfig::default()
//!     .with_backend_url("ws://kms.internal:8888/kurento")
//!     .with_media_uri("file:///var/recordings/demo.webm");
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Running the server
//!
//! ```no_run
//! use recplay_signaling::{KurentoConnector, SignalingConfig, SignalingServer};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SignalingConfig::default();
//! let connector = Arc::new(KurentoConnector::new(config.backend_ping_interval()));
//!
//! let handle = SignalingServer::new(config, connector)?.start().await?;
//! println!("listening on {}", handle.local_addr());
//! # Ok::<(), recplay_signaling::Error>(())
//! # });
//! ```

#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod websocket;

// Re-exports for public API
pub use backend::{
    BackendConnector, BackendEvent, ClientHandle, EndpointKind, EndpointSpec, EventKind,
    KurentoClient, KurentoConnector, MediaBackend, ObjectId,
};
pub use config::SignalingConfig;
pub use error::{Error, Result};
pub use pipeline::{Endpoint, PipelineHandle, PipelineManager};
pub use protocol::{ClientMessage, IceCandidate, ServerMessage};
pub use session::{PendingCall, SessionPhase, SessionRegistry, SignalingContext, SignalingSession};
pub use websocket::{SignalingServer, SignalingServerHandle};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
