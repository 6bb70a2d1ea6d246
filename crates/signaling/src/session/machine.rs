//! Per-connection signaling state machine

use super::candidates::CandidateLane;
use super::registry::{CandidateRoute, ResourceBundle, SessionRegistry, SessionTicket, Teardown};
use crate::backend::{BackendEvent, ClientHandle, EndpointSpec, EventKind};
use crate::config::SignalingConfig;
use crate::pipeline::{Endpoint, PipelineHandle, PipelineManager};
use crate::protocol::{ClientMessage, IceCandidate, ServerMessage};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared state every session handler works against
#[derive(Clone)]
pub struct SignalingContext {
    pub handle: Arc<ClientHandle>,
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<SignalingConfig>,
}

impl SignalingContext {
    pub fn new(handle: Arc<ClientHandle>, config: Arc<SignalingConfig>) -> Self {
        Self {
            handle,
            registry: Arc::new(SessionRegistry::with_candidate_limit(
                config.max_buffered_candidates,
            )),
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Recording,
    Playback,
}

/// A `start` or `play` whose session slot is already claimed
///
/// Created by [`SignalingSession::begin_start`] or
/// [`SignalingSession::begin_play`]. Messages for the same session handled
/// after the claim see the call as negotiating, so a `stop` that follows
/// the offer cancels it even if the sequence has not started yet. Must be
/// [`run`](PendingCall::run) to release the claim.
pub struct PendingCall {
    session: SignalingSession,
    flow: Flow,
    sdp_offer: String,
    claim: Result<(SessionTicket, Option<Teardown>)>,
}

impl PendingCall {
    /// Run the negotiation; always yields exactly one response or `error`
    pub async fn run(self) -> ServerMessage {
        let result = match self.claim {
            Ok((ticket, previous)) => {
                self.session
                    .negotiate(self.flow, ticket, previous, &self.sdp_offer)
                    .await
            }
            Err(e) => Err(e),
        };

        match (self.flow, result) {
            (Flow::Recording, Ok(sdp_answer)) => ServerMessage::StartResponse { sdp_answer },
            (Flow::Playback, Ok(sdp_answer)) => ServerMessage::PlayResponse { sdp_answer },
            (flow, Err(e)) => {
                warn!(session_id = %self.session.id, ?flow, "Negotiation failed: {}", e);
                ServerMessage::error(e)
            }
        }
    }
}

/// Signaling handler for one client session
///
/// `tx` carries asynchronous outbound messages (`iceCandidate`, `playEnd`)
/// to the client; direct responses are returned to the caller.
#[derive(Clone)]
pub struct SignalingSession {
    id: String,
    ctx: SignalingContext,
    tx: mpsc::Sender<ServerMessage>,
}

impl SignalingSession {
    pub fn new(id: impl Into<String>, ctx: SignalingContext, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: id.into(),
            ctx,
            tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one inbound message, returning the direct response if the
    /// message kind has one
    pub async fn handle_message(&self, message: ClientMessage) -> Option<ServerMessage> {
        debug!(session_id = %self.id, kind = message.kind(), "Handling client message");

        match message {
            ClientMessage::Start { sdp_offer } => Some(self.start(&sdp_offer).await),
            ClientMessage::Play { sdp_offer } => Some(self.play(&sdp_offer).await),
            ClientMessage::Stop => {
                self.stop().await;
                None
            }
            ClientMessage::OnIceCandidate { candidate } => {
                self.on_ice_candidate(candidate).await;
                None
            }
        }
    }

    /// Parse and handle a raw frame; malformed frames get an error reply
    pub async fn dispatch(&self, raw: &str) -> Option<ServerMessage> {
        match ClientMessage::parse(raw) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!(session_id = %self.id, "{}", e);
                Some(ServerMessage::error(e))
            }
        }
    }

    /// Start recording; always yields exactly one `startResponse` or `error`
    pub async fn start(&self, sdp_offer: &str) -> ServerMessage {
        self.begin_start(sdp_offer).run().await
    }

    /// Start playback; always yields exactly one `playResponse` or `error`
    pub async fn play(&self, sdp_offer: &str) -> ServerMessage {
        self.begin_play(sdp_offer).run().await
    }

    /// Claim the session for a recording call without running it yet
    pub fn begin_start(&self, sdp_offer: &str) -> PendingCall {
        self.begin(Flow::Recording, sdp_offer)
    }

    /// Claim the session for a playback call without running it yet
    pub fn begin_play(&self, sdp_offer: &str) -> PendingCall {
        self.begin(Flow::Playback, sdp_offer)
    }

    fn begin(&self, flow: Flow, sdp_offer: &str) -> PendingCall {
        let claim = if self.id.is_empty() {
            Err(Error::MissingSessionId)
        } else {
            Ok(self.ctx.registry.begin(&self.id))
        };

        PendingCall {
            session: self.clone(),
            flow,
            sdp_offer: sdp_offer.to_string(),
            claim,
        }
    }

    /// Tear down the session's call, if any. Idempotent.
    pub async fn stop(&self) {
        if self.id.is_empty() {
            return;
        }

        match self.ctx.registry.stop(&self.id) {
            Some(teardown) => {
                info!(session_id = %self.id, "Stopping session");
                teardown.run().await;
            }
            None => debug!(session_id = %self.id, "Stop for inactive session"),
        }
    }

    /// Deliver or buffer a remote candidate. Never fails.
    pub async fn on_ice_candidate(&self, candidate: IceCandidate) {
        if self.id.is_empty() {
            warn!("Dropping ICE candidate without session id");
            return;
        }

        match self.ctx.registry.route_candidate(&self.id, candidate) {
            CandidateRoute::Deliver { lane, candidate } => lane.deliver(&candidate).await,
            CandidateRoute::Buffered => {
                debug!(session_id = %self.id, "Buffered ICE candidate");
            }
            CandidateRoute::Dropped => {
                debug!(session_id = %self.id, "Dropped ICE candidate for stopped session");
            }
            CandidateRoute::Overflow => {
                warn!(session_id = %self.id, "Candidate buffer full, dropping ICE candidate");
            }
        }
    }

    /// Transport closed or failed: stop, then forget the id entirely
    pub async fn close(&self) {
        self.stop().await;
        self.ctx.registry.forget(&self.id);
    }

    async fn negotiate(
        &self,
        flow: Flow,
        ticket: SessionTicket,
        previous: Option<Teardown>,
        sdp_offer: &str,
    ) -> Result<String> {
        if let Some(previous) = previous {
            info!(session_id = %self.id, "Replacing call in progress");
            previous.run().await;
        }

        if !self.ctx.registry.is_current(&ticket) {
            return Err(Error::SessionStopped(self.id.clone()));
        }

        let mut pipeline = None;
        let result = match flow {
            Flow::Recording => self.record_sequence(&ticket, sdp_offer, &mut pipeline).await,
            Flow::Playback => self.playback_sequence(&ticket, sdp_offer, &mut pipeline).await,
        };

        if result.is_err() {
            if let Some(teardown) = self.ctx.registry.abandon(&ticket) {
                teardown.run().await;
            }
            if let Some(pipeline) = pipeline {
                pipeline.release().await;
            }
        } else {
            info!(session_id = %self.id, ?flow, "Session active");
        }

        result
    }

    async fn record_sequence(
        &self,
        ticket: &SessionTicket,
        sdp_offer: &str,
        pipeline_slot: &mut Option<PipelineHandle>,
    ) -> Result<String> {
        let manager = PipelineManager::new(self.ctx.handle.acquire().await?);

        let pipeline = manager.create_pipeline().await?;
        *pipeline_slot = Some(pipeline.clone());
        self.track_pipeline(ticket, &pipeline)?;

        let specs = [
            EndpointSpec::Recorder {
                uri: self.ctx.config.media_uri.clone(),
            },
            EndpointSpec::WebRtc,
        ];
        let [recorder, transport] = into_array::<2>(manager.create_endpoints(&pipeline, &specs).await?)?;

        self.open_candidate_lane(ticket, &manager, &transport).await?;
        manager.connect(&[&transport, &transport, &recorder]).await?;
        self.forward_local_candidates(ticket, &manager, &transport).await?;

        let sdp_answer = manager.backend().process_offer(&transport.id, sdp_offer).await?;

        let bundle = ResourceBundle {
            pipeline,
            transport: transport.clone(),
            recorder: Some(recorder.clone()),
            player: None,
        };
        self.publish(ticket, bundle)?;

        self.spawn_gathering(&manager, transport);

        let backend = Arc::clone(manager.backend());
        let session_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.record(&recorder.id).await {
                warn!(%session_id, "Failed to start recording: {}", e);
            }
        });

        Ok(sdp_answer)
    }

    async fn playback_sequence(
        &self,
        ticket: &SessionTicket,
        sdp_offer: &str,
        pipeline_slot: &mut Option<PipelineHandle>,
    ) -> Result<String> {
        let manager = PipelineManager::new(self.ctx.handle.acquire().await?);

        let pipeline = manager.create_pipeline().await?;
        *pipeline_slot = Some(pipeline.clone());
        self.track_pipeline(ticket, &pipeline)?;

        let player_spec = EndpointSpec::Player {
            uri: self.ctx.config.media_uri.clone(),
        };
        let [player] = into_array::<1>(manager.create_endpoints(&pipeline, &[player_spec]).await?)?;

        self.watch_end_of_stream(ticket, &manager, &player).await?;
        manager.backend().play(&player.id).await?;

        let [transport] = into_array::<1>(
            manager
                .create_endpoints(&pipeline, &[EndpointSpec::WebRtc])
                .await?,
        )?;
        self.forward_local_candidates(ticket, &manager, &transport).await?;
        self.open_candidate_lane(ticket, &manager, &transport).await?;

        let sdp_answer = manager.backend().process_offer(&transport.id, sdp_offer).await?;
        manager.connect(&[&player, &transport]).await?;

        let bundle = ResourceBundle {
            pipeline,
            transport: transport.clone(),
            recorder: None,
            player: Some(player),
        };
        self.publish(ticket, bundle)?;
        self.spawn_gathering(&manager, transport);

        Ok(sdp_answer)
    }

    /// Ask the backend to gather local candidates; failures are only logged
    fn spawn_gathering(&self, manager: &PipelineManager, transport: Endpoint) {
        let backend = Arc::clone(manager.backend());
        let session_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.gather_candidates(&transport.id).await {
                warn!(%session_id, "Failed to gather ICE candidates: {}", e);
            }
        });
    }

    fn track_pipeline(&self, ticket: &SessionTicket, pipeline: &PipelineHandle) -> Result<()> {
        if self.ctx.registry.track_pipeline(ticket, pipeline) {
            Ok(())
        } else {
            Err(Error::SessionStopped(self.id.clone()))
        }
    }

    fn publish(&self, ticket: &SessionTicket, bundle: ResourceBundle) -> Result<()> {
        self.ctx
            .registry
            .publish(ticket, bundle)
            .map_err(|_| Error::SessionStopped(self.id.clone()))
    }

    /// Switch candidate routing to the transport endpoint and replay the
    /// ones buffered so far
    async fn open_candidate_lane(
        &self,
        ticket: &SessionTicket,
        manager: &PipelineManager,
        transport: &Endpoint,
    ) -> Result<()> {
        let lane = Arc::new(CandidateLane::sealed(
            Arc::clone(manager.backend()),
            transport.id.clone(),
        ));
        self.ctx.registry.attach_lane(ticket, Arc::clone(&lane))?;
        self.ctx.registry.drain_candidates(&self.id, &lane).await;
        Ok(())
    }

    /// Forward candidates gathered by the backend to the client
    async fn forward_local_candidates(
        &self,
        ticket: &SessionTicket,
        manager: &PipelineManager,
        transport: &Endpoint,
    ) -> Result<()> {
        let mut events = manager
            .backend()
            .subscribe(&transport.id, EventKind::IceCandidateFound)
            .await?;

        let tx = self.tx.clone();
        let session_id = self.id.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let BackendEvent::IceCandidate(candidate) = event else {
                    continue;
                };
                if tx.send(ServerMessage::IceCandidate { candidate }).await.is_err() {
                    debug!(%session_id, "Client gone, stopping candidate forwarding");
                    break;
                }
            }
        });

        if self.ctx.registry.track_listener(ticket, listener.abort_handle()) {
            Ok(())
        } else {
            Err(Error::SessionStopped(self.id.clone()))
        }
    }

    /// End the session when the player runs out of media
    async fn watch_end_of_stream(
        &self,
        ticket: &SessionTicket,
        manager: &PipelineManager,
        player: &Endpoint,
    ) -> Result<()> {
        let mut events = manager
            .backend()
            .subscribe(&player.id, EventKind::EndOfStream)
            .await?;

        let registry = Arc::clone(&self.ctx.registry);
        let tx = self.tx.clone();
        let ticket_for_listener = ticket.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event != BackendEvent::EndOfStream {
                    continue;
                }

                let session_id = ticket_for_listener.session_id();
                info!(%session_id, "Playback reached end of stream");
                if let Some(teardown) = registry.end_if_current(&ticket_for_listener) {
                    if tx.send(ServerMessage::PlayEnd).await.is_err() {
                        debug!(%session_id, "Client gone before playEnd");
                    }
                    // Teardown aborts this listener, so it runs on its own task.
                    tokio::spawn(teardown.run());
                }
                break;
            }
        });

        if self.ctx.registry.track_listener(ticket, listener.abort_handle()) {
            Ok(())
        } else {
            Err(Error::SessionStopped(self.id.clone()))
        }
    }
}

fn into_array<const N: usize>(endpoints: Vec<Endpoint>) -> Result<[Endpoint; N]> {
    endpoints.try_into().map_err(|endpoints: Vec<Endpoint>| {
        Error::UnexpectedResponse(format!("expected {} endpoints, got {}", N, endpoints.len()))
    })
}
