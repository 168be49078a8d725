//! Process-wide backend registry: create/run/stop/delete plus task and
//! outlet routing, keyed by the config identity hash.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{Backend, BackendReport};
use crate::config::{BackendConfig, BackendDefaults, Limits, OutletBinding, PoolTiming};
use crate::engine::EngineFactory;
use crate::error::ServingError;
use crate::outlet::{OutletFactory, SyncEntry};
use crate::sandbox::SandboxDecoder;
use crate::task::Task;

/// Everything the registry needs beyond per-backend configs.
pub struct RegistrySettings {
    pub defaults: BackendDefaults,
    pub limits: Limits,
    pub timing: PoolTiming,
}

pub struct BackendRegistry {
    backends: DashMap<String, Arc<Backend>>,
    engines: EngineFactory,
    outlets: OutletFactory,
    sandbox: Option<Arc<dyn SandboxDecoder>>,
    settings: RegistrySettings,
    /// Cancelled on fatal device loss; the server observes it and exits.
    shutdown: CancellationToken,
}

impl BackendRegistry {
    pub fn new(
        engines: EngineFactory,
        outlets: OutletFactory,
        sandbox: Option<Arc<dyn SandboxDecoder>>,
        settings: RegistrySettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            backends: DashMap::new(),
            engines,
            outlets,
            sandbox,
            settings,
            shutdown,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn supported_engines(&self) -> Vec<String> {
        self.engines.supported()
    }

    /// Create a backend from `config` and return its identity hash.
    ///
    /// Defaults are filled before hashing, so two configs that differ only
    /// in omitted fields share an identity. The same config twice is a
    /// duplicate, not a reload.
    pub fn create(&self, mut config: BackendConfig) -> Result<String, ServingError> {
        config.fill_defaults(&self.settings.defaults);
        config.validate(&self.settings.limits)?;
        if self.backends.len() >= self.settings.limits.max_backend_count {
            return Err(ServingError::LimitExceeded(format!(
                "backend count at cap {}",
                self.settings.limits.max_backend_count
            )));
        }
        let id = config.identity();
        if self.backends.contains_key(&id) {
            return Err(ServingError::DuplicateBackend(id));
        }
        let backend = Backend::new(
            config,
            self.engines.clone(),
            self.outlets.clone(),
            self.sandbox.clone(),
            self.settings.timing.clone(),
            self.shutdown.clone(),
        )?;
        let id = backend.id().to_owned();
        // A concurrent create of the same config loses here.
        match self.backends.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ServingError::DuplicateBackend(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(backend));
                info!(backend = %id, "backend created");
                Ok(id)
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<Backend>, ServingError> {
        self.backends
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ServingError::NotFound(format!("backend {id}")))
    }

    /// Start the backend's worker pool, returning the identity as the
    /// run handle.
    pub async fn run(&self, id: &str) -> Result<String, ServingError> {
        self.get(id)?.run().await
    }

    /// Stop the backend's worker pool, returning the identity as the
    /// reply payload. Stopping an already stopped backend is a no-op
    /// with the same reply.
    pub async fn stop(&self, id: &str) -> Result<String, ServingError> {
        let backend = self.get(id)?;
        backend.stop().await;
        Ok(backend.id().to_owned())
    }

    /// Stop the backend and drop it from the registry. The identity
    /// becomes free for a fresh create.
    pub async fn delete(&self, id: &str) -> Result<(), ServingError> {
        let backend = self.get(id)?;
        backend.stop().await;
        self.backends.remove(id);
        info!(backend = %id, "backend deleted");
        Ok(())
    }

    pub fn enqueue_task(
        &self,
        id: &str,
        task: Task,
        payload: Bytes,
    ) -> Result<(), ServingError> {
        self.get(id)?.enqueue_task(task, payload)
    }

    pub async fn dequeue_result(
        &self,
        id: &str,
        deadline: Duration,
    ) -> Result<Option<SyncEntry>, ServingError> {
        Ok(self.get(id)?.dequeue_result(deadline).await)
    }

    pub fn append_outlet(
        &self,
        id: &str,
        binding: OutletBinding,
    ) -> Result<String, ServingError> {
        self.get(id)?.append_outlet(binding)
    }

    pub fn remove_outlet(&self, id: &str, key: &str) -> Result<(), ServingError> {
        self.get(id)?.remove_outlet(key)
    }

    pub fn report(&self, id: &str) -> Result<BackendReport, ServingError> {
        Ok(self.get(id)?.report())
    }

    /// Reports for every registered backend, sorted by identity.
    pub fn report_all(&self) -> Vec<BackendReport> {
        let mut reports: Vec<BackendReport> = self
            .backends
            .iter()
            .map(|entry| entry.value().report())
            .collect();
        reports.sort_by(|a, b| a.id.cmp(&b.id));
        reports
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Stop every backend; used on server shutdown. Backends are kept
    /// registered so reports still answer during teardown.
    pub async fn stop_all(&self) {
        let backends: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for backend in backends {
            if backend.status() == crate::status::WorkerStatus::Exited {
                continue;
            }
            warn!(backend = %backend.id(), "stopping backend on shutdown");
            backend.stop().await;
        }
    }
}
