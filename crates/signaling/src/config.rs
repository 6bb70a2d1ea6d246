//! Configuration types for the signaling coordinator

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the signaling server and its backend connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Address the WebSocket listener binds to (default: 0.0.0.0:8443)
    pub listen_addr: String,

    /// Request path accepted for WebSocket upgrades (default: /recorder)
    pub path: String,

    /// Media backend JSON-RPC endpoint (ws:// or wss://)
    pub backend_url: String,

    /// URI of the recording target, also used as the playback source
    pub media_uri: String,

    /// Cookie carrying the session identifier on the upgrade request
    pub session_cookie: String,

    /// Backend keepalive ping interval in seconds (0 disables pings)
    pub backend_ping_interval_secs: u64,

    /// Outbound message queue size per client connection
    pub outbound_queue_size: usize,

    /// ICE candidates held per session before its transport endpoint exists
    pub max_buffered_candidates: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            path: "/recorder".to_string(),
            backend_url: "ws://localhost:8888/kurento".to_string(),
            media_uri: "file:///tmp/recorder_demo.webm".to_string(),
            session_cookie: "recplay.sid".to_string(),
            backend_ping_interval_secs: 240,
            outbound_queue_size: 128,
            max_buffered_candidates: 64,
        }
    }
}

impl SignalingConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backend_url` is not a WebSocket URL
    /// - `media_uri` does not parse as an absolute URI
    /// - `path` does not start with `/`
    /// - `outbound_queue_size` or `max_buffered_candidates` is zero
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if !self.backend_url.starts_with("ws://") && !self.backend_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "backend_url must start with ws:// or wss://, got {}",
                self.backend_url
            )));
        }

        url::Url::parse(&self.media_uri).map_err(|e| {
            Error::InvalidConfig(format!("media_uri {} is not a valid URI: {}", self.media_uri, e))
        })?;

        if !self.path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "path must start with '/', got {}",
                self.path
            )));
        }

        if self.outbound_queue_size == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_size must be at least 1".to_string(),
            ));
        }

        if self.max_buffered_candidates == 0 {
            return Err(Error::InvalidConfig(
                "max_buffered_candidates must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a TOML or YAML file, chosen by extension
    ///
    /// Fields missing from the file keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        use crate::Error;

        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents).map_err(|e| {
                Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
            }),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents).map_err(|e| {
                Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
            }),
            _ => Err(Error::InvalidConfig(format!(
                "Unsupported config file format: {}",
                path.display()
            ))),
        }
    }

    /// Keepalive interval for the backend connection, if enabled
    pub fn backend_ping_interval(&self) -> Option<Duration> {
        (self.backend_ping_interval_secs > 0)
            .then(|| Duration::from_secs(self.backend_ping_interval_secs))
    }

    /// Set the backend address
    pub fn with_backend_url(mut self, backend_url: &str) -> Self {
        self.backend_url = backend_url.to_string();
        self
    }

    /// Set the recording/playback URI
    pub fn with_media_uri(mut self, media_uri: &str) -> Self {
        self.media_uri = media_uri.to_string();
        self
    }

    /// Set the listener address
    pub fn with_listen_addr(mut self, listen_addr: &str) -> Self {
        self.listen_addr = listen_addr.to_string();
        self
    }

    /// Set the WebSocket upgrade path
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }
}
