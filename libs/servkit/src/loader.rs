//! Stages a model for one worker and drives the engine load hooks.
//!
//! The staged plaintext lives in a worker-private scratch directory under
//! the model path and is removed unconditionally once the load hooks
//! return; decrypted bytes never persist past the load.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::engine::{ModelDescriptor, ModelEngine, StagedModel};
use crate::error::ServingError;
use crate::sandbox::SandboxDecoder;

const ARTIFACT_NAME: &str = "model_core";
const STAGED_NAME: &str = "model_plain";
const DESCRIPTOR_NAME: &str = "model.yaml";

pub struct ModelLoader {
    config: Arc<BackendConfig>,
    sandbox: Option<Arc<dyn SandboxDecoder>>,
}

impl ModelLoader {
    pub fn new(config: Arc<BackendConfig>, sandbox: Option<Arc<dyn SandboxDecoder>>) -> Self {
        Self { config, sandbox }
    }

    /// Re-read the model descriptor from storage. Reflects the latest
    /// on-disk configuration on every call; a missing descriptor yields
    /// the default.
    pub async fn read_descriptor(&self) -> Result<ModelDescriptor, ServingError> {
        let path = self.config.model_dir()?.join(DESCRIPTOR_NAME);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| ServingError::ReloadModel(format!(": model descriptor: {e}"))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no model descriptor, using defaults");
                Ok(ModelDescriptor::default())
            }
            Err(err) => Err(ServingError::ReloadModel(format!(
                ": read model descriptor: {err}"
            ))),
        }
    }

    /// Stage the artifact for `worker_index` and run the engine's
    /// `load_model`/`load_parameters` hooks.
    pub async fn stage_and_load(
        &self,
        worker_index: usize,
        engine: &mut dyn ModelEngine,
    ) -> Result<(), ServingError> {
        let model_dir = self.config.model_dir()?;
        let scratch = model_dir.join(format!("worker_{worker_index}"));
        let descriptor = self.read_descriptor().await?;

        // A leftover scratch dir from an aborted worker is stale.
        if tokio::fs::metadata(&scratch).await.is_ok() {
            tokio::fs::remove_dir_all(&scratch)
                .await
                .map_err(|e| ServingError::ReloadModel(format!(": clear scratch: {e}")))?;
        }
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| ServingError::ReloadModel(format!(": create scratch: {e}")))?;

        let load_result = self
            .stage_into(&model_dir, &scratch, descriptor, engine)
            .await;

        // The plaintext must never outlive the load, success or failure.
        if let Err(err) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(scratch = %scratch.display(), error = %err, "failed to remove scratch directory");
        }
        let params_preloaded = load_result?;

        if !engine.model_bound() {
            return Err(ServingError::ReloadModel(": no model handle bound".into()));
        }
        if !params_preloaded {
            engine.load_parameters().await?;
        }
        Ok(())
    }

    async fn stage_into(
        &self,
        model_dir: &std::path::Path,
        scratch: &std::path::Path,
        descriptor: ModelDescriptor,
        engine: &mut dyn ModelEngine,
    ) -> Result<bool, ServingError> {
        let source = model_dir.join(ARTIFACT_NAME);
        let artifact = scratch.join(STAGED_NAME);

        if self.config.encrypted() {
            let sandbox = self.sandbox.as_ref().ok_or_else(|| {
                ServingError::ReloadModel(": encrypted model but sandbox is disabled".into())
            })?;
            let plaintext = sandbox
                .decode(
                    &self.config.access_code,
                    PathBuf::from(&self.config.private_key_path).as_path(),
                    &source,
                )
                .await?;
            tokio::fs::write(&artifact, plaintext)
                .await
                .map_err(|e| ServingError::ReloadModel(format!(": write plaintext: {e}")))?;
        } else {
            tokio::fs::copy(&source, &artifact)
                .await
                .map_err(|e| ServingError::ReloadModel(format!(": copy artifact: {e}")))?;
            warn!("loaded a model WITHOUT encryption");
        }

        let staged = StagedModel {
            scratch_dir: scratch.to_path_buf(),
            artifact,
            descriptor,
        };
        engine.load_model(&staged).await
    }
}
