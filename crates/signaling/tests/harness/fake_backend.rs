//! In-memory media backend
//!
//! Records every call, fails chosen operations on demand, can hold offer
//! processing until the test releases it, and lets tests raise backend
//! events on any object.

use async_trait::async_trait;
use parking_lot::Mutex;
use recplay_signaling::backend::EventStream;
use recplay_signaling::{
    BackendConnector, BackendEvent, EndpointKind, EndpointSpec, Error, EventKind, IceCandidate,
    MediaBackend, ObjectId, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Backend operation, for failure injection and call-order assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreatePipeline,
    CreateEndpoints,
    Connect,
    ProcessOffer,
    GatherCandidates,
    AddIceCandidate,
    Record,
    Play,
    Stop,
    Release,
    Subscribe,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreatePipeline { pipeline: String },
    CreateEndpoints { pipeline: String, kinds: Vec<EndpointKind>, ids: Vec<String> },
    Connect { chain: Vec<String> },
    ProcessOffer { endpoint: String, offer: String },
    GatherCandidates { endpoint: String },
    AddIceCandidate { endpoint: String, candidate: String },
    Record { recorder: String },
    Play { player: String },
    Stop { endpoint: String },
    Release { object: String },
    Subscribe { object: String, kind: EventKind },
}

impl Call {
    pub fn op(&self) -> Op {
        match self {
            Call::CreatePipeline { .. } => Op::CreatePipeline,
            Call::CreateEndpoints { .. } => Op::CreateEndpoints,
            Call::Connect { .. } => Op::Connect,
            Call::ProcessOffer { .. } => Op::ProcessOffer,
            Call::GatherCandidates { .. } => Op::GatherCandidates,
            Call::AddIceCandidate { .. } => Op::AddIceCandidate,
            Call::Record { .. } => Op::Record,
            Call::Play { .. } => Op::Play,
            Call::Stop { .. } => Op::Stop,
            Call::Release { .. } => Op::Release,
            Call::Subscribe { .. } => Op::Subscribe,
        }
    }
}

pub const FAKE_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=fake answer\r\n";

#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    failures: Mutex<HashSet<Op>>,
    offer_gate: Mutex<Option<Arc<Notify>>>,
    gather_gate: Mutex<Option<Arc<Notify>>>,
    subscribers: Mutex<HashMap<(String, EventKind), mpsc::UnboundedSender<BackendEvent>>>,
    next_object: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every future call of `op` fail
    pub fn fail(&self, op: Op) {
        self.failures.lock().insert(op);
    }

    /// Hold `process_offer` until the returned gate is notified
    pub fn gate_offers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.offer_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Hold `gather_candidates` until the returned gate is notified
    pub fn gate_gathering(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gather_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.calls.lock().iter().map(Call::op).collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls.lock().iter().filter(|call| call.op() == op).count()
    }

    /// Objects released so far, in order
    pub fn released(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::Release { object } => Some(object.clone()),
                _ => None,
            })
            .collect()
    }

    /// Pipelines created and not yet released
    pub fn live_pipelines(&self) -> Vec<String> {
        let calls = self.calls.lock();
        let released: HashSet<&String> = calls
            .iter()
            .filter_map(|call| match call {
                Call::Release { object } => Some(object),
                _ => None,
            })
            .collect();
        calls
            .iter()
            .filter_map(|call| match call {
                Call::CreatePipeline { pipeline } if !released.contains(pipeline) => {
                    Some(pipeline.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Candidates handed to `endpoint`, in delivery order
    pub fn candidates_added(&self, endpoint: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::AddIceCandidate {
                    endpoint: target,
                    candidate,
                } if target == endpoint => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Raise an event on `object`; false if nobody is subscribed
    pub fn emit(&self, object: &str, kind: EventKind, event: BackendEvent) -> bool {
        let subscribers = self.subscribers.lock();
        match subscribers.get(&(object.to_string(), kind)) {
            Some(subscriber) => subscriber.send(event).is_ok(),
            None => false,
        }
    }

    pub fn emit_ice_candidate(&self, endpoint: &str, candidate: IceCandidate) -> bool {
        self.emit(
            endpoint,
            EventKind::IceCandidateFound,
            BackendEvent::IceCandidate(candidate),
        )
    }

    pub fn emit_end_of_stream(&self, player: &str) -> bool {
        self.emit(player, EventKind::EndOfStream, BackendEvent::EndOfStream)
    }

    fn log_call(&self, call: Call) -> Result<()> {
        let op = call.op();
        self.calls.lock().push(call);
        if self.failures.lock().contains(&op) {
            return Err(Error::BackendError {
                code: 40000,
                message: format!("injected {:?} failure", op),
            });
        }
        Ok(())
    }

    fn object_id(&self, type_name: &str) -> String {
        let n = self.next_object.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", type_name, n)
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn create_pipeline(&self) -> Result<ObjectId> {
        let pipeline = self.object_id("MediaPipeline");
        self.log_call(Call::CreatePipeline {
            pipeline: pipeline.clone(),
        })?;
        Ok(ObjectId::new(pipeline))
    }

    async fn create_endpoints(
        &self,
        pipeline: &ObjectId,
        specs: &[EndpointSpec],
    ) -> Result<Vec<ObjectId>> {
        let kinds: Vec<EndpointKind> = specs.iter().map(EndpointSpec::kind).collect();
        let ids: Vec<String> = kinds
            .iter()
            .map(|kind| self.object_id(kind.type_name()))
            .collect();
        self.log_call(Call::CreateEndpoints {
            pipeline: pipeline.to_string(),
            kinds,
            ids: ids.clone(),
        })?;
        Ok(ids.into_iter().map(ObjectId::new).collect())
    }

    async fn connect(&self, chain: &[ObjectId]) -> Result<()> {
        self.log_call(Call::Connect {
            chain: chain.iter().map(ToString::to_string).collect(),
        })
    }

    async fn process_offer(&self, endpoint: &ObjectId, offer: &str) -> Result<String> {
        self.log_call(Call::ProcessOffer {
            endpoint: endpoint.to_string(),
            offer: offer.to_string(),
        })?;

        let gate = self.offer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(FAKE_ANSWER.to_string())
    }

    async fn gather_candidates(&self, endpoint: &ObjectId) -> Result<()> {
        self.log_call(Call::GatherCandidates {
            endpoint: endpoint.to_string(),
        })?;

        let gate = self.gather_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, endpoint: &ObjectId, candidate: &IceCandidate) -> Result<()> {
        tokio::task::yield_now().await;
        self.log_call(Call::AddIceCandidate {
            endpoint: endpoint.to_string(),
            candidate: candidate.candidate.clone(),
        })
    }

    async fn record(&self, recorder: &ObjectId) -> Result<()> {
        self.log_call(Call::Record {
            recorder: recorder.to_string(),
        })
    }

    async fn play(&self, player: &ObjectId) -> Result<()> {
        self.log_call(Call::Play {
            player: player.to_string(),
        })
    }

    async fn stop(&self, endpoint: &ObjectId) -> Result<()> {
        self.log_call(Call::Stop {
            endpoint: endpoint.to_string(),
        })
    }

    async fn release(&self, object: &ObjectId) -> Result<()> {
        self.log_call(Call::Release {
            object: object.to_string(),
        })
    }

    async fn subscribe(&self, object: &ObjectId, kind: EventKind) -> Result<EventStream> {
        self.log_call(Call::Subscribe {
            object: object.to_string(),
            kind,
        })?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().insert((object.to_string(), kind), tx);
        Ok(rx)
    }
}

/// Connector handing out one shared [`FakeBackend`]
pub struct FakeConnector {
    backend: Arc<FakeBackend>,
    reachable: AtomicBool,
    attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            reachable: AtomicBool::new(true),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendConnector for FakeConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn MediaBackend>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed(format!("connection refused: {}", address)));
        }
        Ok(Arc::clone(&self.backend) as Arc<dyn MediaBackend>)
    }
}
