//! Shared backend connection

use super::{BackendConnector, MediaBackend};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lazily connected, shared handle to the media backend
///
/// The first [`acquire`](ClientHandle::acquire) connects; later calls reuse
/// the cached connection. Failed attempts are not cached. The cache lock is
/// held across the connection attempt so concurrent first callers share one
/// attempt.
pub struct ClientHandle {
    address: String,
    connector: Arc<dyn BackendConnector>,
    cached: Mutex<Option<Arc<dyn MediaBackend>>>,
}

impl ClientHandle {
    pub fn new(address: impl Into<String>, connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            address: address.into(),
            connector,
            cached: Mutex::new(None),
        }
    }

    /// Backend address this handle connects to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the shared backend connection, connecting if necessary
    pub async fn acquire(&self) -> Result<Arc<dyn MediaBackend>> {
        let mut cached = self.cached.lock().await;

        if let Some(backend) = cached.as_ref() {
            if backend.is_connected() {
                return Ok(Arc::clone(backend));
            }
            warn!(address = %self.address, "Cached backend connection lost, reconnecting");
            *cached = None;
        }

        match self.connector.connect(&self.address).await {
            Ok(backend) => {
                info!(address = %self.address, "Connected to media backend");
                *cached = Some(Arc::clone(&backend));
                Ok(backend)
            }
            Err(e) => {
                warn!("Could not find media server at address {}: {}", self.address, e);
                Err(Error::BackendUnavailable {
                    address: self.address.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether a live connection is currently cached
    pub async fn is_cached(&self) -> bool {
        self.cached
            .lock()
            .await
            .as_ref()
            .map(|backend| backend.is_connected())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EndpointSpec, EventKind, EventStream, ObjectId};
    use crate::protocol::IceCandidate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct IdleBackend {
        connected: AtomicBool,
    }

    #[async_trait]
    impl MediaBackend for IdleBackend {
        async fn create_pipeline(&self) -> Result<ObjectId> {
            Ok(ObjectId::new("pipeline"))
        }
        async fn create_endpoints(&self, _: &ObjectId, specs: &[EndpointSpec]) -> Result<Vec<ObjectId>> {
            Ok(specs.iter().map(|s| ObjectId::new(s.kind().type_name())).collect())
        }
        async fn connect(&self, _: &[ObjectId]) -> Result<()> {
            Ok(())
        }
        async fn process_offer(&self, _: &ObjectId, _: &str) -> Result<String> {
            Ok("v=0".to_string())
        }
        async fn gather_candidates(&self, _: &ObjectId) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, _: &ObjectId, _: &IceCandidate) -> Result<()> {
            Ok(())
        }
        async fn record(&self, _: &ObjectId) -> Result<()> {
            Ok(())
        }
        async fn play(&self, _: &ObjectId) -> Result<()> {
            Ok(())
        }
        async fn stop(&self, _: &ObjectId) -> Result<()> {
            Ok(())
        }
        async fn release(&self, _: &ObjectId) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _: &ObjectId, _: EventKind) -> Result<EventStream> {
            Err(Error::InvalidArgument("no events".to_string()))
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct CountingConnector {
        attempts: AtomicUsize,
        reachable: AtomicBool,
        last: parking_lot::Mutex<Option<Arc<IdleBackend>>>,
    }

    impl CountingConnector {
        fn new(reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                reachable: AtomicBool::new(reachable),
                last: parking_lot::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        async fn connect(&self, address: &str) -> Result<Arc<dyn MediaBackend>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(Error::ConnectionClosed(format!("{} refused", address)));
            }
            let backend = Arc::new(IdleBackend {
                connected: AtomicBool::new(true),
            });
            *self.last.lock() = Some(Arc::clone(&backend));
            Ok(backend)
        }
    }

    #[tokio::test]
    async fn test_acquire_caches_connection() {
        let connector = CountingConnector::new(true);
        let handle = ClientHandle::new("ws://kms:8888/kurento", connector.clone());

        let first = handle.acquire().await.unwrap();
        let second = handle.acquire().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(handle.is_cached().await);
    }

    #[tokio::test]
    async fn test_failed_acquire_is_not_cached() {
        let connector = CountingConnector::new(false);
        let handle = ClientHandle::new("ws://kms:8888/kurento", connector.clone());

        let err = handle.acquire().await.err().unwrap();
        assert!(matches!(err, Error::BackendUnavailable { ref address, .. } if address == "ws://kms:8888/kurento"));
        assert!(!handle.is_cached().await);

        connector.reachable.store(true, Ordering::SeqCst);
        assert!(handle.acquire().await.is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lost_connection_is_replaced() {
        let connector = CountingConnector::new(true);
        let handle = ClientHandle::new("ws://kms:8888/kurento", connector.clone());

        handle.acquire().await.unwrap();
        if let Some(backend) = connector.last.lock().as_ref() {
            backend.connected.store(false, Ordering::SeqCst);
        }

        handle.acquire().await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_acquire_connects_once() {
        let connector = CountingConnector::new(true);
        let handle = Arc::new(ClientHandle::new("ws://kms:8888/kurento", connector.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { handle.acquire().await.map(|_| ()) })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }
}
