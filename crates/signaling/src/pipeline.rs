//! Pipeline manager
//!
//! Thin layer over [`MediaBackend`] that owns pipeline lifetimes. A
//! [`PipelineHandle`] releases its pipeline at most once no matter how many
//! paths (stop, failure cleanup, end of stream) race to tear it down.

use crate::backend::{EndpointKind, EndpointSpec, MediaBackend, ObjectId};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

struct PipelineInner {
    id: ObjectId,
    backend: Arc<dyn MediaBackend>,
    released: AtomicBool,
}

/// Shared reference to a backend pipeline
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<PipelineInner>,
}

impl PipelineHandle {
    fn new(id: ObjectId, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                id,
                backend,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.inner.id
    }

    /// Backend the pipeline lives in
    pub fn backend(&self) -> &Arc<dyn MediaBackend> {
        &self.inner.backend
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Release the pipeline and everything inside it
    ///
    /// Only the first call reaches the backend. Backend failures are logged,
    /// never returned: release runs on teardown paths that have nobody to
    /// report to.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            debug!(pipeline = %self.inner.id, "Pipeline already released");
            return;
        }

        match self.inner.backend.release(&self.inner.id).await {
            Ok(()) => debug!(pipeline = %self.inner.id, "Pipeline released"),
            Err(e) => warn!(pipeline = %self.inner.id, "Failed to release pipeline: {}", e),
        }
    }
}

impl std::fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Media element created inside a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: ObjectId,
    pub kind: EndpointKind,
}

/// Creates pipelines and endpoints on one backend connection
pub struct PipelineManager {
    backend: Arc<dyn MediaBackend>,
}

impl PipelineManager {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn MediaBackend> {
        &self.backend
    }

    /// Create a fresh pipeline
    pub async fn create_pipeline(&self) -> Result<PipelineHandle> {
        let id = self.backend.create_pipeline().await?;
        debug!(pipeline = %id, "Pipeline created");
        Ok(PipelineHandle::new(id, Arc::clone(&self.backend)))
    }

    /// Create endpoints inside `pipeline`
    ///
    /// The returned endpoints are in the same order as `specs`.
    pub async fn create_endpoints(
        &self,
        pipeline: &PipelineHandle,
        specs: &[EndpointSpec],
    ) -> Result<Vec<Endpoint>> {
        if specs.is_empty() {
            return Err(Error::InvalidArgument("no endpoints requested".to_string()));
        }

        let ids = self.backend.create_endpoints(pipeline.id(), specs).await?;
        if ids.len() != specs.len() {
            return Err(Error::UnexpectedResponse(format!(
                "backend created {} endpoints, {} requested",
                ids.len(),
                specs.len()
            )));
        }

        Ok(ids
            .into_iter()
            .zip(specs)
            .map(|(id, spec)| Endpoint {
                id,
                kind: spec.kind(),
            })
            .collect())
    }

    /// Wire each endpoint of `chain` into the next
    pub async fn connect(&self, chain: &[&Endpoint]) -> Result<()> {
        if chain.len() < 2 {
            return Err(Error::InvalidArgument(
                "connecting needs at least two endpoints".to_string(),
            ));
        }

        let ids: Vec<ObjectId> = chain.iter().map(|endpoint| endpoint.id.clone()).collect();
        self.backend.connect(&ids).await
    }

    /// Release `pipeline` if there is one
    pub async fn release_pipeline(&self, pipeline: Option<&PipelineHandle>) {
        if let Some(pipeline) = pipeline {
            pipeline.release().await;
        }
    }
}
