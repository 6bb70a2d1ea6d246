//! Client-facing signaling protocol
//!
//! Every frame is a JSON object discriminated by its `id` field:
//!
//! ```text
//! browser -> server   start{sdpOffer} | play{sdpOffer} | stop | onIceCandidate{candidate}
//! server  -> browser  startResponse{sdpAnswer} | playResponse{sdpAnswer}
//!                     | iceCandidate{candidate} | playEnd | error{message}
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// ICE candidate as exchanged with browsers (`RTCIceCandidateInit` shape)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the m-line the candidate belongs to
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Inbound message from a browser client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id")]
pub enum ClientMessage {
    /// Start recording the client's stream
    #[serde(rename = "start")]
    Start {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },

    /// Replay the recorded stream to the client
    #[serde(rename = "play")]
    Play {
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
    },

    /// Tear down the current call
    #[serde(rename = "stop")]
    Stop,

    /// Trickled ICE candidate from the browser
    #[serde(rename = "onIceCandidate")]
    OnIceCandidate { candidate: IceCandidate },
}

impl ClientMessage {
    /// Parse an inbound frame
    ///
    /// Anything that is not one of the known kinds is rejected with
    /// [`Error::InvalidMessage`] carrying the raw frame, so it can be echoed
    /// back to the client.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|_| Error::InvalidMessage(text.to_string()))
    }

    /// Get the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Start { .. } => "start",
            ClientMessage::Play { .. } => "play",
            ClientMessage::Stop => "stop",
            ClientMessage::OnIceCandidate { .. } => "onIceCandidate",
        }
    }
}

/// Outbound message to a browser client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "id")]
pub enum ServerMessage {
    /// SDP answer for a recording session
    #[serde(rename = "startResponse")]
    StartResponse {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },

    /// SDP answer for a playback session
    #[serde(rename = "playResponse")]
    PlayResponse {
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },

    /// ICE candidate gathered by the backend
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: IceCandidate },

    /// Playback reached the end of the recording
    #[serde(rename = "playEnd")]
    PlayEnd,

    /// Request failed
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Build an error message from any displayable error
    pub fn error(err: impl std::fmt::Display) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
        }
    }

    /// Convert message to JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::SerializationError(format!("Failed to serialize server message: {}", e))
        })
    }

    /// Get the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::StartResponse { .. } => "startResponse",
            ServerMessage::PlayResponse { .. } => "playResponse",
            ServerMessage::IceCandidate { .. } => "iceCandidate",
            ServerMessage::PlayEnd => "playEnd",
            ServerMessage::Error { .. } => "error",
        }
    }
}
