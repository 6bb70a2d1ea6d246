//! Signaling integration test harness
//!
//! Provides:
//! - [`FakeBackend`]: in-memory media backend with call log and failure injection
//! - [`FakeConnector`]: connector for the backend, switchable unreachable
//! - [`Harness`]: a signaling context wired to both, plus session helpers
//!
//! Basic usage pattern:
//!
//! 1. Create a `Harness`
//! 2. Open sessions with `harness.session(id)`
//! 3. Drive them and assert on `harness.backend` and `harness.registry()`

#![allow(dead_code)]

pub mod fake_backend;

use recplay_signaling::{
    ClientHandle, ServerMessage, SessionRegistry, SignalingConfig, SignalingContext,
    SignalingSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub use fake_backend::{Call, FakeBackend, FakeConnector, Op, FAKE_ANSWER};

pub const BACKEND_URL: &str = "ws://fake-kms:8888/kurento";
pub const MEDIA_URI: &str = "file:///tmp/recplay-test.webm";
pub const OFFER: &str = "v=0\r\no=- 1 1 IN IP4 192.168.1.2\r\ns=browser offer\r\n";

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

pub struct Harness {
    pub backend: Arc<FakeBackend>,
    pub connector: Arc<FakeConnector>,
    pub ctx: SignalingContext,
}

impl Harness {
    pub fn new() -> Self {
        init_logging();

        let backend = FakeBackend::new();
        let connector = FakeConnector::new(Arc::clone(&backend));
        let config = SignalingConfig::default()
            .with_backend_url(BACKEND_URL)
            .with_media_uri(MEDIA_URI);
        let handle = Arc::new(ClientHandle::new(BACKEND_URL, connector.clone()));

        Self {
            backend,
            connector,
            ctx: SignalingContext::new(handle, Arc::new(config)),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.ctx.registry
    }

    /// Open a session; the receiver sees its asynchronous outbound messages
    pub fn session(&self, id: &str) -> (SignalingSession, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (SignalingSession::new(id, self.ctx.clone(), tx), rx)
    }

    /// Transport endpoint of an active session
    pub fn transport_of(&self, id: &str) -> String {
        self.registry()
            .bundle(id)
            .map(|bundle| bundle.transport.id.to_string())
            .unwrap_or_else(|| panic!("session {} has no bundle", id))
    }

    /// Player endpoint of an active playback session
    pub fn player_of(&self, id: &str) -> String {
        self.registry()
            .bundle(id)
            .and_then(|bundle| bundle.player)
            .map(|player| player.id.to_string())
            .unwrap_or_else(|| panic!("session {} has no player", id))
    }
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) -> HarnessResult<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Next outbound message, failing after two seconds
pub async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> HarnessResult<ServerMessage> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .map_err(|_| HarnessError::Timeout("outbound message".to_string()))?
        .ok_or_else(|| HarnessError::ConnectionError("outbound channel closed".to_string()))
}

pub fn candidate(name: &str) -> recplay_signaling::IceCandidate {
    let mut candidate =
        recplay_signaling::IceCandidate::new(format!("candidate:{} 1 UDP 2122252543 192.168.1.2 5000 typ host", name));
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_m_line_index = Some(0);
    candidate
}

/// The candidate line `candidate(name)` produces
pub fn candidate_line(name: &str) -> String {
    candidate(name).candidate
}
