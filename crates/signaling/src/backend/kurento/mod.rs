//! Kurento media server backend
//!
//! Talks JSON-RPC 2.0 over a single WebSocket. The first response carries a
//! server-issued `sessionId`, which is attached to every later request.

mod client;
pub mod protocol;

pub use client::{KurentoClient, KurentoConnector};
