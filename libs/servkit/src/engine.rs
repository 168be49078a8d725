//! Model compute capability and the engine factory.
//!
//! One `ModelEngine` variant exists per pluggable backend type, selected by
//! a string tag from an explicit registration table built at process start.
//! Unknown or unavailable tags fail closed.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BackendConfig;
use crate::error::ServingError;
use crate::task::{ImagePool, Task};

/// Descriptor re-read from the model directory on every `run()`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(flatten)]
    pub rest: BTreeMap<String, Value>,
}

/// A model artifact staged into a worker-private scratch directory.
///
/// The scratch directory is deleted right after `load_model` returns, so an
/// engine must fully consume the artifact during the call.
#[derive(Clone, Debug)]
pub struct StagedModel {
    pub scratch_dir: PathBuf,
    pub artifact: PathBuf,
    pub descriptor: ModelDescriptor,
}

/// The per-worker model compute capability.
///
/// Each worker owns its own engine instance; handles are never shared
/// across workers even for identical model configurations.
#[async_trait]
pub trait ModelEngine: Send {
    /// Bind the staged artifact. Returns `true` when parameters were
    /// already bound as part of the load, in which case
    /// [`load_parameters`](Self::load_parameters) is skipped.
    async fn load_model(&mut self, staged: &StagedModel) -> Result<bool, ServingError>;

    async fn load_parameters(&mut self) -> Result<(), ServingError>;

    /// Run one batch; the result sequence must match the batch length and
    /// order. Implementations take each task's payload out of the pool.
    async fn infer(
        &mut self,
        batch: &[Task],
        images: &ImagePool,
    ) -> Result<Vec<Value>, ServingError>;

    /// Whether a model handle is currently bound.
    fn model_bound(&self) -> bool;
}

impl std::fmt::Debug for dyn ModelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelEngine")
            .field("model_bound", &self.model_bound())
            .finish()
    }
}

type EngineCtor =
    Arc<dyn Fn(&BackendConfig) -> Result<Box<dyn ModelEngine>, ServingError> + Send + Sync>;

/// Explicit registration table of engine constructors, built once at
/// startup. Engines whose native dependency is absent are recorded as
/// unavailable so creation fails closed with `DependencyMissing`.
#[derive(Clone, Default)]
pub struct EngineFactory {
    ctors: HashMap<String, EngineCtor>,
    unavailable: HashMap<String, String>,
}

impl EngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, tag: impl Into<String>, ctor: F)
    where
        F: Fn(&BackendConfig) -> Result<Box<dyn ModelEngine>, ServingError>
            + Send
            + Sync
            + 'static,
    {
        let tag = tag.into();
        if self.ctors.insert(tag.clone(), Arc::new(ctor)).is_some() {
            tracing::warn!(engine = %tag, "engine constructor replaced");
        }
    }

    /// Record an engine type whose native dependency is missing on this
    /// host. The type stays listed as known but unavailable.
    pub fn register_unavailable(&mut self, tag: impl Into<String>, reason: impl Into<String>) {
        let tag = tag.into();
        let reason = reason.into();
        tracing::warn!(engine = %tag, %reason, "engine registered as unavailable");
        self.unavailable.insert(tag, reason);
    }

    pub fn supported(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.ctors.keys().cloned().collect();
        tags.sort();
        tags
    }

    pub fn build(&self, config: &BackendConfig) -> Result<Box<dyn ModelEngine>, ServingError> {
        if let Some(reason) = self.unavailable.get(&config.engine) {
            return Err(ServingError::DependencyMissing(format!(
                "{}: {}",
                config.engine, reason
            )));
        }
        let ctor = self
            .ctors
            .get(&config.engine)
            .ok_or_else(|| ServingError::DependencyMissing(config.engine.clone()))?;
        ctor(config)
    }
}

impl std::fmt::Debug for EngineFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineFactory")
            .field("supported", &self.supported())
            .field("unavailable", &self.unavailable)
            .finish()
    }
}

/// A dependency-free engine that echoes payload metadata back as results.
/// Stands in for concrete compute in demos and smoke tests.
#[derive(Debug, Default)]
pub struct EchoEngine {
    model: Option<Vec<u8>>,
}

#[async_trait]
impl ModelEngine for EchoEngine {
    async fn load_model(&mut self, staged: &StagedModel) -> Result<bool, ServingError> {
        let bytes = tokio::fs::read(&staged.artifact)
            .await
            .map_err(|e| ServingError::ReloadModel(format!(": read artifact: {e}")))?;
        self.model = Some(bytes);
        Ok(false)
    }

    async fn load_parameters(&mut self) -> Result<(), ServingError> {
        Ok(())
    }

    async fn infer(
        &mut self,
        batch: &[Task],
        images: &ImagePool,
    ) -> Result<Vec<Value>, ServingError> {
        if self.model.is_none() {
            return Err(ServingError::ReloadModel(": no model bound".into()));
        }
        let mut results = Vec::with_capacity(batch.len());
        for task in batch {
            let payload = images.take(&task.image_id).ok_or_else(|| {
                ServingError::InvalidLabels(format!(": missing image {}", task.image_id))
            })?;
            results.push(serde_json::json!({
                "task_id": task.task_id,
                "bytes": payload.len(),
            }));
        }
        Ok(results)
    }

    fn model_bound(&self) -> bool {
        self.model.is_some()
    }
}
