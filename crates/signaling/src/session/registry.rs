//! Session registry
//!
//! Source of truth for which sessions are live and which backend resources
//! they own. Every mutation happens under one lock, and the candidate buffer
//! is only touched while that lock is held, so a `stop` racing a late
//! candidate for the same id can never leave a buffer behind.

use super::candidates::{CandidateBuffer, CandidateLane};
use crate::pipeline::{Endpoint, PipelineHandle};
use crate::protocol::IceCandidate;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Negotiation phase of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No call in progress
    Idle,
    /// `start`/`play` sequence running
    Negotiating,
    /// Answer sent, resources registered
    Active,
    /// Torn down; late candidates are dropped
    Stopped,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Idle => write!(f, "idle"),
            SessionPhase::Negotiating => write!(f, "negotiating"),
            SessionPhase::Active => write!(f, "active"),
            SessionPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Backend objects representing one active call
#[derive(Debug, Clone)]
pub struct ResourceBundle {
    pub pipeline: PipelineHandle,
    pub transport: Endpoint,
    /// Recording flow only
    pub recorder: Option<Endpoint>,
    /// Playback flow only
    pub player: Option<Endpoint>,
}

/// Proof that a caller began a particular negotiation
///
/// A ticket goes stale once its session is stopped or restarted; stale
/// tickets cannot publish or attach anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    id: String,
    generation: u64,
}

impl SessionTicket {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

/// Where an inbound candidate should go
pub enum CandidateRoute {
    /// Transport endpoint exists, deliver through its lane
    Deliver {
        lane: Arc<CandidateLane>,
        candidate: IceCandidate,
    },
    /// Held until the transport endpoint exists
    Buffered,
    /// Session was stopped
    Dropped,
    /// Buffer for the session is full
    Overflow,
}

/// Resources taken out of the registry that still need releasing
pub struct Teardown {
    session_id: String,
    pipeline: Option<PipelineHandle>,
    recorder: Option<Endpoint>,
    listeners: Vec<AbortHandle>,
}

impl Teardown {
    pub fn pipeline(&self) -> Option<&PipelineHandle> {
        self.pipeline.as_ref()
    }

    /// Cancel event listeners, stop the recorder, release the pipeline
    pub async fn run(self) {
        for listener in &self.listeners {
            listener.abort();
        }

        let Some(pipeline) = self.pipeline else {
            return;
        };

        if let Some(recorder) = &self.recorder {
            if !pipeline.is_released() {
                if let Err(e) = pipeline.backend().stop(&recorder.id).await {
                    warn!(session_id = %self.session_id, "Failed to stop recorder: {}", e);
                }
            }
        }

        pipeline.release().await;
        debug!(session_id = %self.session_id, "Session resources released");
    }
}

struct SessionSlot {
    generation: u64,
    phase: SessionPhase,
    pipeline: Option<PipelineHandle>,
    listeners: Vec<AbortHandle>,
    lane: Option<Arc<CandidateLane>>,
    bundle: Option<ResourceBundle>,
}

impl SessionSlot {
    fn into_teardown(self, session_id: &str) -> Teardown {
        if let Some(lane) = &self.lane {
            lane.open();
        }

        let (pipeline, recorder) = match self.bundle {
            Some(bundle) => (Some(bundle.pipeline), bundle.recorder),
            None => (self.pipeline, None),
        };

        Teardown {
            session_id: session_id.to_string(),
            pipeline,
            recorder,
            listeners: self.listeners,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    slots: HashMap<String, SessionSlot>,
    stopped: HashSet<String>,
    next_generation: u64,
}

impl RegistryState {
    fn current(&mut self, ticket: &SessionTicket) -> Option<&mut SessionSlot> {
        self.slots
            .get_mut(&ticket.id)
            .filter(|slot| slot.generation == ticket.generation)
    }
}

/// Maps session ids to their live resources
#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    candidates: CandidateBuffer,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry buffering at most `limit` early candidates per session
    pub fn with_candidate_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            candidates: CandidateBuffer::with_limit(limit),
        }
    }

    /// Begin a new negotiation for `session_id`
    ///
    /// Any call already in progress for the id is taken out and returned for
    /// teardown. Buffered candidates are kept for the new call.
    pub fn begin(&self, session_id: &str) -> (SessionTicket, Option<Teardown>) {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        state.stopped.remove(session_id);
        let previous = state
            .slots
            .insert(
                session_id.to_string(),
                SessionSlot {
                    generation,
                    phase: SessionPhase::Negotiating,
                    pipeline: None,
                    listeners: Vec::new(),
                    lane: None,
                    bundle: None,
                },
            )
            .map(|slot| slot.into_teardown(session_id));

        let ticket = SessionTicket {
            id: session_id.to_string(),
            generation,
        };
        (ticket, previous)
    }

    /// Record the pipeline a negotiation created
    ///
    /// Returns false when the ticket is stale; the caller then owns the
    /// pipeline and must release it.
    pub fn track_pipeline(&self, ticket: &SessionTicket, pipeline: &PipelineHandle) -> bool {
        match self.state.lock().current(ticket) {
            Some(slot) => {
                slot.pipeline = Some(pipeline.clone());
                true
            }
            None => false,
        }
    }

    /// Record an event listener task; stale tickets get it aborted
    pub fn track_listener(&self, ticket: &SessionTicket, listener: AbortHandle) -> bool {
        match self.state.lock().current(ticket) {
            Some(slot) => {
                slot.listeners.push(listener);
                true
            }
            None => {
                listener.abort();
                false
            }
        }
    }

    /// Route the session's future candidates into `lane`
    ///
    /// From here on candidates are no longer buffered, so the caller must
    /// drain the buffer into the lane next.
    pub fn attach_lane(&self, ticket: &SessionTicket, lane: Arc<CandidateLane>) -> Result<()> {
        match self.state.lock().current(ticket) {
            Some(slot) => {
                slot.lane = Some(lane);
                Ok(())
            }
            None => {
                lane.open();
                Err(Error::SessionStopped(ticket.id.clone()))
            }
        }
    }

    /// Replay buffered candidates into `lane` and open it
    pub async fn drain_candidates(&self, session_id: &str, lane: &CandidateLane) -> usize {
        self.candidates.drain_into(session_id, lane).await
    }

    /// Register the finished call and mark the session active
    ///
    /// Fails, handing the bundle back, if the session was stopped or
    /// restarted while negotiating.
    pub fn publish(
        &self,
        ticket: &SessionTicket,
        bundle: ResourceBundle,
    ) -> std::result::Result<(), ResourceBundle> {
        let mut state = self.state.lock();
        match state.current(ticket) {
            Some(slot) if slot.phase == SessionPhase::Negotiating => {
                slot.phase = SessionPhase::Active;
                slot.bundle = Some(bundle);
                Ok(())
            }
            _ => Err(bundle),
        }
    }

    /// Drop a failed negotiation, returning the session to idle
    ///
    /// Candidates buffered for the failed call are discarded with it.
    pub fn abandon(&self, ticket: &SessionTicket) -> Option<Teardown> {
        let mut state = self.state.lock();
        state.current(ticket)?;
        self.candidates.discard(&ticket.id);
        state
            .slots
            .remove(&ticket.id)
            .map(|slot| slot.into_teardown(&ticket.id))
    }

    /// Remove the session and its buffered candidates
    ///
    /// Idempotent. Until the next [`begin`](Self::begin) or
    /// [`forget`](Self::forget), candidates for the id are dropped.
    pub fn stop(&self, session_id: &str) -> Option<Teardown> {
        let mut state = self.state.lock();
        let discarded = self.candidates.discard(session_id);
        if discarded > 0 {
            debug!(session_id, discarded, "Discarded buffered ICE candidates");
        }
        state.stopped.insert(session_id.to_string());
        state
            .slots
            .remove(session_id)
            .map(|slot| slot.into_teardown(session_id))
    }

    /// Stop the session only if `ticket` still names its current call
    pub fn end_if_current(&self, ticket: &SessionTicket) -> Option<Teardown> {
        let mut state = self.state.lock();
        state.current(ticket)?;
        self.candidates.discard(&ticket.id);
        state.stopped.insert(ticket.id.clone());
        state
            .slots
            .remove(&ticket.id)
            .map(|slot| slot.into_teardown(&ticket.id))
    }

    /// Decide where an inbound candidate goes, buffering it if needed
    pub fn route_candidate(&self, session_id: &str, candidate: IceCandidate) -> CandidateRoute {
        let state = self.state.lock();
        if state.stopped.contains(session_id) {
            return CandidateRoute::Dropped;
        }

        match state.slots.get(session_id).and_then(|slot| slot.lane.clone()) {
            Some(lane) => CandidateRoute::Deliver { lane, candidate },
            None if self.candidates.enqueue(session_id, candidate) => CandidateRoute::Buffered,
            None => CandidateRoute::Overflow,
        }
    }

    /// Forget everything about a session id whose transport is gone
    pub fn forget(&self, session_id: &str) {
        let mut state = self.state.lock();
        state.stopped.remove(session_id);
        self.candidates.discard(session_id);
    }

    pub fn phase(&self, session_id: &str) -> SessionPhase {
        let state = self.state.lock();
        match state.slots.get(session_id) {
            Some(slot) => slot.phase,
            None if state.stopped.contains(session_id) => SessionPhase::Stopped,
            None => SessionPhase::Idle,
        }
    }

    /// Bundle of an active session
    pub fn bundle(&self, session_id: &str) -> Option<ResourceBundle> {
        self.state
            .lock()
            .slots
            .get(session_id)
            .and_then(|slot| slot.bundle.clone())
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.bundle.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `ticket` still names the session's current call
    pub fn is_current(&self, ticket: &SessionTicket) -> bool {
        self.state.lock().current(ticket).is_some()
    }

    /// Number of candidates buffered for `session_id`
    pub fn buffered_len(&self, session_id: &str) -> usize {
        self.candidates.len(session_id)
    }
}
