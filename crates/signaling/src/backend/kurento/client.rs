//! WebSocket JSON-RPC client for the Kurento media server

use super::protocol::{self, EventNotification, IncomingFrame, JsonRpcRequest};
use crate::backend::{
    BackendConnector, BackendEvent, EndpointSpec, EventKind, EventStream, MediaBackend, ObjectId,
};
use crate::protocol::IceCandidate;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

type SubscriberMap = HashMap<(String, EventKind), mpsc::UnboundedSender<BackendEvent>>;

/// State shared between the client and its socket tasks
struct Shared {
    next_id: AtomicU64,
    pending: Mutex<PendingMap>,
    subscribers: Mutex<SubscriberMap>,
    session_id: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl Shared {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            session_id: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// Mark the connection dead and fail every request still waiting
    fn shut_down(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending.lock());
        for (_, waiter) in pending {
            let _ = waiter.send(Err(Error::ConnectionClosed(reason.to_string())));
        }
        self.subscribers.lock().clear();
    }

    /// Drop subscriptions whose receiver is gone, plus every subscription
    /// on `released` and the objects it owns
    fn prune_subscribers(&self, released: Option<&ObjectId>) {
        let child_prefix = released.map(|object| format!("{}/", object));
        self.subscribers.lock().retain(|(object, _), subscriber| {
            let owned = released.is_some_and(|released| object == released.as_str())
                || child_prefix
                    .as_deref()
                    .is_some_and(|prefix| object.starts_with(prefix));
            !owned && !subscriber.is_closed()
        });
    }
}

/// Request side of the connection, cloned into the keepalive task
#[derive(Clone)]
struct RpcChannel {
    tx: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl RpcChannel {
    /// Send a request and wait for its `value`
    async fn request(&self, method: &str, mut params: Value) -> Result<Value> {
        let session_id = self.shared.session_id.lock().clone();
        if let (Some(session_id), Some(map)) = (session_id, params.as_object_mut()) {
            map.insert("sessionId".to_string(), Value::String(session_id));
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let json = JsonRpcRequest::new(method, params, Some(id)).to_json()?;

        let (waiter, response) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed("media server connection lost".to_string()));
            }
            pending.insert(id, waiter);
        }

        debug!(id, method, "Sending backend request");
        if self.tx.send(Message::Text(json)).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(Error::ConnectionClosed("media server connection lost".to_string()));
        }

        response
            .await
            .map_err(|_| Error::ConnectionClosed(format!("no response to {} request", method)))?
    }

    async fn invoke(&self, object: &ObjectId, operation: &str, params: Option<Value>) -> Result<Value> {
        self.request("invoke", protocol::invoke_params(object, operation, params))
            .await
    }

    /// Run several operations as one backend transaction
    async fn transaction(&self, operations: &[(&str, Value)]) -> Result<Vec<Value>> {
        let value = self
            .request("transaction", protocol::transaction_params(operations))
            .await?;
        protocol::transaction_values(value, operations.len())
    }
}

/// Kurento media server client
///
/// One WebSocket carries every request; responses are matched back by id
/// and `onEvent` notifications are routed to subscribers.
pub struct KurentoClient {
    url: String,
    rpc: RpcChannel,
    keepalive: Option<JoinHandle<()>>,
}

impl KurentoClient {
    /// Connect to the media server
    ///
    /// # Arguments
    ///
    /// * `url` - JSON-RPC WebSocket endpoint, e.g. `ws://localhost:8888/kurento`
    /// * `ping_interval` - keepalive period, `None` to disable
    pub async fn connect(url: &str, ping_interval: Option<Duration>) -> Result<Self> {
        info!("Connecting to media server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect to {}: {}", url, e)))?;

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());

        tokio::spawn(Self::sender_task(write, rx, Arc::clone(&shared)));
        tokio::spawn(Self::receiver_task(read, Arc::clone(&shared)));

        let rpc = RpcChannel { tx, shared };
        let keepalive = ping_interval.map(|interval| tokio::spawn(Self::keepalive_task(rpc.clone(), interval)));

        Ok(Self {
            url: url.to_string(),
            rpc,
            keepalive,
        })
    }

    /// Media server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session id assigned by the media server, once known
    pub fn session_id(&self) -> Option<String> {
        self.rpc.shared.session_id.lock().clone()
    }

    /// Sender task: writes queued frames to the WebSocket
    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
        shared: Arc<Shared>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send backend message: {}", e);
                shared.shut_down("failed to write to media server");
                break;
            }
        }

        debug!("Backend sender task terminated");
    }

    /// Receiver task: resolves pending requests and routes events
    async fn receiver_task(mut read: SplitStream<WsStream>, shared: Arc<Shared>) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match IncomingFrame::from_json(&text) {
                    Ok(frame) => Self::handle_frame(frame, &shared),
                    Err(e) => warn!("Ignoring malformed backend frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("Media server closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Media server WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        shared.shut_down("media server connection closed");
        debug!("Backend receiver task terminated");
    }

    fn handle_frame(frame: IncomingFrame, shared: &Shared) {
        if let Some(id) = frame.id {
            if frame.result.is_none() && frame.error.is_none() {
                debug!(id, "Ignoring backend request frame");
                return;
            }

            let Some(waiter) = shared.pending.lock().remove(&id) else {
                warn!(id, "Response for unknown backend request");
                return;
            };

            let outcome = match (frame.error, frame.result) {
                (Some(error), _) => Err(error.into()),
                (None, Some(result)) => {
                    if let Some(session_id) = result.get("sessionId").and_then(Value::as_str) {
                        shared
                            .session_id
                            .lock()
                            .get_or_insert_with(|| session_id.to_string());
                    }
                    Ok(result.get("value").cloned().unwrap_or(Value::Null))
                }
                (None, None) => Ok(Value::Null),
            };
            let _ = waiter.send(outcome);
            return;
        }

        if frame.method.as_deref() == Some("onEvent") {
            let Some(event) = frame.params.as_ref().and_then(EventNotification::from_params) else {
                warn!("Malformed onEvent notification");
                return;
            };
            Self::dispatch_event(event, shared);
        }
    }

    fn dispatch_event(event: EventNotification, shared: &Shared) {
        let Some(kind) = EventKind::from_type_name(&event.event_type) else {
            debug!(event_type = %event.event_type, "Unhandled backend event");
            return;
        };

        let payload = match kind {
            EventKind::IceCandidateFound => match event.candidate() {
                Some(candidate) => BackendEvent::IceCandidate(candidate),
                None => {
                    warn!(object = %event.object, "IceCandidateFound without candidate");
                    return;
                }
            },
            EventKind::EndOfStream => BackendEvent::EndOfStream,
        };

        let key = (event.object, kind);
        let mut subscribers = shared.subscribers.lock();
        if let Some(subscriber) = subscribers.get(&key) {
            if subscriber.send(payload).is_err() {
                debug!(object = %key.0, "Dropping closed event subscription");
                subscribers.remove(&key);
            }
        }
    }

    /// Keepalive task: pings the media server so it keeps our session
    async fn keepalive_task(rpc: RpcChannel, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !rpc.shared.connected.load(Ordering::SeqCst) {
                break;
            }
            let params = json!({ "interval": interval.as_millis() as u64 });
            if let Err(e) = rpc.request("ping", params).await {
                warn!("Media server ping failed: {}", e);
            }
        }
    }
}

impl Drop for KurentoClient {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        let _ = self.rpc.tx.send(Message::Close(None));
    }
}

#[async_trait]
impl MediaBackend for KurentoClient {
    async fn create_pipeline(&self) -> Result<ObjectId> {
        let value = self
            .rpc
            .request("create", protocol::create_params("MediaPipeline", json!({})))
            .await?;
        protocol::object_id(&value)
    }

    async fn create_endpoints(
        &self,
        pipeline: &ObjectId,
        specs: &[EndpointSpec],
    ) -> Result<Vec<ObjectId>> {
        match specs {
            [] => Ok(Vec::new()),
            [spec] => {
                let value = self
                    .rpc
                    .request("create", protocol::endpoint_params(pipeline, spec))
                    .await?;
                Ok(vec![protocol::object_id(&value)?])
            }
            specs => {
                let operations: Vec<(&str, Value)> = specs
                    .iter()
                    .map(|spec| ("create", protocol::endpoint_params(pipeline, spec)))
                    .collect();
                self.rpc
                    .transaction(&operations)
                    .await?
                    .iter()
                    .map(protocol::object_id)
                    .collect()
            }
        }
    }

    async fn connect(&self, chain: &[ObjectId]) -> Result<()> {
        let operations: Vec<(&str, Value)> = chain
            .windows(2)
            .map(|pair| {
                let params = json!({ "sink": pair[1].as_str() });
                ("invoke", protocol::invoke_params(&pair[0], "connect", Some(params)))
            })
            .collect();

        match operations.as_slice() {
            [] => Ok(()),
            [(method, params)] => self.rpc.request(method, params.clone()).await.map(|_| ()),
            operations => self.rpc.transaction(operations).await.map(|_| ()),
        }
    }

    async fn process_offer(&self, endpoint: &ObjectId, offer: &str) -> Result<String> {
        let value = self
            .rpc
            .invoke(endpoint, "processOffer", Some(json!({ "offer": offer })))
            .await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::UnexpectedResponse(format!("expected SDP answer, got {}", value)))
    }

    async fn gather_candidates(&self, endpoint: &ObjectId) -> Result<()> {
        self.rpc.invoke(endpoint, "gatherCandidates", None).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, endpoint: &ObjectId, candidate: &IceCandidate) -> Result<()> {
        let params = json!({ "candidate": protocol::candidate_value(candidate) });
        self.rpc.invoke(endpoint, "addIceCandidate", Some(params)).await?;
        Ok(())
    }

    async fn record(&self, recorder: &ObjectId) -> Result<()> {
        self.rpc.invoke(recorder, "record", None).await?;
        Ok(())
    }

    async fn play(&self, player: &ObjectId) -> Result<()> {
        self.rpc.invoke(player, "play", None).await?;
        Ok(())
    }

    async fn stop(&self, endpoint: &ObjectId) -> Result<()> {
        self.rpc.invoke(endpoint, "stop", None).await?;
        Ok(())
    }

    async fn release(&self, object: &ObjectId) -> Result<()> {
        let result = self
            .rpc
            .request("release", protocol::release_params(object))
            .await;
        self.rpc
            .shared
            .prune_subscribers(result.is_ok().then_some(object));
        result.map(|_| ())
    }

    async fn subscribe(&self, object: &ObjectId, kind: EventKind) -> Result<EventStream> {
        let key = (object.as_str().to_string(), kind);
        let (tx, rx) = mpsc::unbounded_channel();

        // Registered before the request so no event slips in between.
        self.rpc.shared.prune_subscribers(None);
        self.rpc.shared.subscribers.lock().insert(key.clone(), tx);

        let params = protocol::subscribe_params(object, kind.type_name());
        if let Err(e) = self.rpc.request("subscribe", params).await {
            self.rpc.shared.subscribers.lock().remove(&key);
            return Err(e);
        }

        Ok(rx)
    }

    fn is_connected(&self) -> bool {
        self.rpc.shared.connected.load(Ordering::SeqCst)
    }
}

/// Connects [`KurentoClient`]s for the [`ClientHandle`](crate::backend::ClientHandle)
#[derive(Debug, Clone, Default)]
pub struct KurentoConnector {
    ping_interval: Option<Duration>,
}

impl KurentoConnector {
    pub fn new(ping_interval: Option<Duration>) -> Self {
        Self { ping_interval }
    }
}

#[async_trait]
impl BackendConnector for KurentoConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaBackend>> {
        let client = KurentoClient::connect(address, self.ping_interval).await?;
        Ok(Arc::new(client))
    }
}
