//! WebSocket connection handler
//!
//! One task per client connection. The upgrade is only accepted on the
//! configured path; the session id comes from the session cookie when the
//! browser sends one.

use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{PendingCall, SignalingContext, SignalingSession};
use crate::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderMap, StatusCode},
        Message,
    },
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handle a single client connection until it closes
pub async fn handle_connection(stream: TcpStream, ctx: SignalingContext) -> Result<()> {
    let addr = stream.peer_addr()?;
    debug!("New connection from: {}", addr);

    let expected_path = ctx.config.path.clone();
    let cookie_name = ctx.config.session_cookie.clone();
    let mut cookie_session = None;

    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if request.uri().path() != expected_path {
            warn!("Rejecting upgrade from {} on path {}", addr, request.uri().path());
            return Err(not_found());
        }
        cookie_session = session_cookie(request.headers(), &cookie_name);
        Ok(response)
    })
    .await?;

    let session_id = cookie_session.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(%session_id, "WebSocket connection from {}", addr);

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let ws_tx = Arc::new(RwLock::new(ws_tx));

    // Outbound queue shared by direct replies and asynchronous notifications
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(ctx.config.outbound_queue_size);

    let ws_tx_clone = Arc::clone(&ws_tx);
    let forward_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("{}", e);
                    continue;
                }
            };
            let mut ws_tx = ws_tx_clone.write().await;
            if let Err(e) = ws_tx.send(Message::Text(json)).await {
                warn!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    let session = SignalingSession::new(session_id.clone(), ctx, tx.clone());
    let mut negotiations: Vec<JoinHandle<()>> = Vec::new();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => match ClientMessage::parse(&text) {
                Ok(ClientMessage::Start { sdp_offer }) => {
                    let call = session.begin_start(&sdp_offer);
                    negotiations.retain(|task| !task.is_finished());
                    negotiations.push(spawn_negotiation(call, tx.clone()));
                }
                Ok(ClientMessage::Play { sdp_offer }) => {
                    let call = session.begin_play(&sdp_offer);
                    negotiations.retain(|task| !task.is_finished());
                    negotiations.push(spawn_negotiation(call, tx.clone()));
                }
                Ok(message) => {
                    if let Some(reply) = session.handle_message(message).await {
                        send(&tx, reply).await;
                    }
                }
                Err(e) => {
                    warn!(%session_id, "{}", e);
                    send(&tx, ServerMessage::error(e)).await;
                }
            },
            Ok(Message::Close(_)) => {
                info!(%session_id, "Connection closed by client");
                break;
            }
            Ok(Message::Ping(data)) => {
                let mut ws_tx = ws_tx.write().await;
                let _ = ws_tx.send(Message::Pong(data)).await;
            }
            Err(e) => {
                warn!(%session_id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup on disconnect. Every call was claimed before this point, so
    // in-flight negotiations find their tickets stale and unwind.
    session.close().await;
    for task in negotiations {
        if let Err(e) = task.await {
            error!(%session_id, "Negotiation task failed: {}", e);
        }
    }

    drop(session);
    drop(tx);
    forward_task.abort();

    info!(%session_id, "Connection cleaned up");
    Ok(())
}

/// Run a claimed call beside the read loop so stop and candidates keep
/// flowing meanwhile
fn spawn_negotiation(call: PendingCall, tx: mpsc::Sender<ServerMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reply = call.run().await;
        send(&tx, reply).await;
    })
}

async fn send(tx: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    let kind = message.kind();
    if tx.send(message).await.is_err() {
        warn!("Client gone, dropping {} message", kind);
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("Not Found".to_string()));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

/// Value of the `name` cookie, if the request carries one
fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
