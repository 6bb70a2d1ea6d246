//! WebSocket transport for browser clients

pub mod handler;
pub mod server;

pub use server::{SignalingServer, SignalingServerHandle};
