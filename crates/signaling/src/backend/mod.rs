//! Media backend boundary
//!
//! The signaling state machine never talks to the media server directly; it
//! goes through [`MediaBackend`], a narrow RPC surface over pipelines,
//! endpoints and their events. [`kurento`] implements it over the Kurento
//! JSON-RPC protocol, and [`ClientHandle`] hands out one shared connection.

pub mod handle;
pub mod kurento;

pub use handle::ClientHandle;
pub use kurento::{KurentoClient, KurentoConnector};

use crate::protocol::IceCandidate;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reference to an object living inside the media backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of media endpoint that can live inside a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Peer-facing WebRTC endpoint
    WebRtc,
    /// Writes incoming media to a URI
    Recorder,
    /// Reads media from a URI
    Player,
}

impl EndpointKind {
    /// Backend type name
    pub fn type_name(&self) -> &'static str {
        match self {
            EndpointKind::WebRtc => "WebRtcEndpoint",
            EndpointKind::Recorder => "RecorderEndpoint",
            EndpointKind::Player => "PlayerEndpoint",
        }
    }
}

/// Endpoint creation request: kind plus its constructor parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSpec {
    /// WebRTC endpoint, no parameters
    WebRtc,
    /// Recorder writing to `uri`
    Recorder { uri: String },
    /// Player reading from `uri`
    Player { uri: String },
}

impl EndpointSpec {
    pub fn kind(&self) -> EndpointKind {
        match self {
            EndpointSpec::WebRtc => EndpointKind::WebRtc,
            EndpointSpec::Recorder { .. } => EndpointKind::Recorder,
            EndpointSpec::Player { .. } => EndpointKind::Player,
        }
    }
}

/// Backend event types a caller can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The WebRTC endpoint gathered a local ICE candidate
    IceCandidateFound,
    /// The player reached the end of its source
    EndOfStream,
}

impl EventKind {
    /// Backend event type name
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::IceCandidateFound => "IceCandidateFound",
            EventKind::EndOfStream => "EndOfStream",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "IceCandidateFound" | "OnIceCandidate" => Some(EventKind::IceCandidateFound),
            "EndOfStream" => Some(EventKind::EndOfStream),
            _ => None,
        }
    }
}

/// Event raised by a backend object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Local ICE candidate to forward to the browser
    IceCandidate(IceCandidate),
    /// Playback finished
    EndOfStream,
}

/// Stream of events for one subscription. Dropping it ends the subscription.
pub type EventStream = mpsc::UnboundedReceiver<BackendEvent>;

/// RPC surface of the media backend
///
/// Every call is a single request/response round trip; implementations do
/// not retry.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Create a new media pipeline
    async fn create_pipeline(&self) -> Result<ObjectId>;

    /// Create endpoints inside `pipeline` in one atomic batch
    ///
    /// Returned ids are in the same order as `specs`.
    async fn create_endpoints(
        &self,
        pipeline: &ObjectId,
        specs: &[EndpointSpec],
    ) -> Result<Vec<ObjectId>>;

    /// Connect each element of `chain` to the next one in one atomic call
    async fn connect(&self, chain: &[ObjectId]) -> Result<()>;

    /// Process an SDP offer on a WebRTC endpoint and return the answer
    async fn process_offer(&self, endpoint: &ObjectId, offer: &str) -> Result<String>;

    /// Start gathering local ICE candidates on a WebRTC endpoint
    async fn gather_candidates(&self, endpoint: &ObjectId) -> Result<()>;

    /// Hand a remote ICE candidate to a WebRTC endpoint
    async fn add_ice_candidate(&self, endpoint: &ObjectId, candidate: &IceCandidate)
        -> Result<()>;

    /// Start recording
    async fn record(&self, recorder: &ObjectId) -> Result<()>;

    /// Start playback
    async fn play(&self, player: &ObjectId) -> Result<()>;

    /// Stop a recorder or player
    async fn stop(&self, endpoint: &ObjectId) -> Result<()>;

    /// Release an object, and everything it owns
    async fn release(&self, object: &ObjectId) -> Result<()>;

    /// Subscribe to events of `kind` raised by `object`
    async fn subscribe(&self, object: &ObjectId, kind: EventKind) -> Result<EventStream>;

    /// Whether the underlying connection is still usable
    fn is_connected(&self) -> bool {
        true
    }
}

/// Establishes backend connections by address
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaBackend>>;
}
