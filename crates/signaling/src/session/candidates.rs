//! ICE candidate buffering and ordered delivery

use crate::backend::{MediaBackend, ObjectId};
use crate::protocol::IceCandidate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Candidates held per session when no limit is configured
pub const DEFAULT_BUFFER_LIMIT: usize = 64;

/// Per-session queue of candidates that arrived before the session's
/// transport endpoint existed
pub struct CandidateBuffer {
    queues: Mutex<HashMap<String, Vec<IceCandidate>>>,
    limit: usize,
}

impl Default for CandidateBuffer {
    fn default() -> Self {
        Self::with_limit(DEFAULT_BUFFER_LIMIT)
    }
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer holding at most `limit` candidates per session
    pub fn with_limit(limit: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            limit,
        }
    }

    /// Append `candidate` to the session's queue, creating it if absent
    ///
    /// Returns false, dropping the candidate, once the queue is full.
    pub fn enqueue(&self, session_id: &str, candidate: IceCandidate) -> bool {
        let mut queues = self.queues.lock();
        let queue = queues.entry(session_id.to_string()).or_default();
        if queue.len() >= self.limit {
            return false;
        }
        queue.push(candidate);
        true
    }

    /// Remove and return the session's queue, in arrival order
    pub fn take(&self, session_id: &str) -> Vec<IceCandidate> {
        self.queues.lock().remove(session_id).unwrap_or_default()
    }

    /// Drop the session's queue without delivering it
    pub fn discard(&self, session_id: &str) -> usize {
        self.queues
            .lock()
            .remove(session_id)
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    /// Number of candidates waiting for `session_id`
    pub fn len(&self, session_id: &str) -> usize {
        self.queues
            .lock()
            .get(session_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.queues.lock().contains_key(session_id)
    }

    /// Deliver every buffered candidate to `lane` in FIFO order, then open
    /// the lane for direct delivery
    ///
    /// The queue is removed before delivery starts, so it is never drained
    /// twice. Returns the number of replayed candidates.
    pub async fn drain_into(&self, session_id: &str, lane: &CandidateLane) -> usize {
        let queued = self.take(session_id);
        let count = queued.len();

        for candidate in &queued {
            lane.push(candidate).await;
        }
        lane.open();

        if count > 0 {
            debug!(session_id, count, "Replayed buffered ICE candidates");
        }
        count
    }
}

/// Ordered path for candidates into one transport endpoint
///
/// A lane starts sealed: [`deliver`](CandidateLane::deliver) calls queue up
/// behind the seal until [`open`](CandidateLane::open), which the buffer
/// drain calls after the replay. Waiters are woken in the order they called
/// `deliver`.
pub struct CandidateLane {
    backend: Arc<dyn MediaBackend>,
    endpoint: ObjectId,
    order: Arc<tokio::sync::Mutex<()>>,
    seal: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl CandidateLane {
    /// Create a sealed lane into `endpoint`
    pub fn sealed(backend: Arc<dyn MediaBackend>, endpoint: ObjectId) -> Self {
        let order = Arc::new(tokio::sync::Mutex::new(()));
        let seal = Arc::clone(&order).try_lock_owned().ok();

        Self {
            backend,
            endpoint,
            order,
            seal: Mutex::new(seal),
        }
    }

    pub fn endpoint(&self) -> &ObjectId {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.seal.lock().is_none()
    }

    /// Let queued and future deliveries through. Idempotent.
    pub fn open(&self) {
        self.seal.lock().take();
    }

    /// Deliver a candidate after every earlier delivery on this lane
    pub async fn deliver(&self, candidate: &IceCandidate) {
        let _turn = self.order.lock().await;
        self.push(candidate).await;
    }

    /// Hand a candidate to the backend, bypassing the ordering lock
    async fn push(&self, candidate: &IceCandidate) {
        if let Err(e) = self.backend.add_ice_candidate(&self.endpoint, candidate).await {
            warn!(endpoint = %self.endpoint, "Failed to add ICE candidate: {}", e);
        }
    }
}
