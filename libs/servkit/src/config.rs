//! Backend configuration, defaults, limits, and identity hashing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ServingError;

/// One configured result sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutletBinding {
    /// Unique within the backend; defaults to the ordinal position when
    /// appended without a key.
    #[serde(default)]
    pub key: Option<String>,
    /// Outlet type tag ("sync", "mosquitto", "redis", "syncexporter").
    pub kind: String,
    /// Type-specific configuration.
    #[serde(default)]
    pub configs: Value,
}

fn default_one() -> usize {
    1
}

/// Immutable configuration of one backend.
///
/// Field order matters: the identity hash covers the ten fields in the
/// order they are declared here, and changing it changes identities for
/// existing configurations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Engine type tag selecting the model-compute implementation.
    pub engine: String,
    /// Model identity, "<distro>-<version>".
    pub model_hash: String,
    /// Access code for an encrypted model; empty when unencrypted.
    #[serde(default)]
    pub access_code: String,
    /// Path to the decrypt private key; empty when unencrypted.
    #[serde(default)]
    pub private_key_path: String,
    /// Storage root; filled from process-wide defaults when unset.
    #[serde(default)]
    pub storage: Option<PathBuf>,
    /// Preheat image path; filled from process-wide defaults when unset.
    #[serde(default)]
    pub preheat: Option<PathBuf>,
    #[serde(default = "default_one")]
    pub batch_size: usize,
    #[serde(default = "default_one")]
    pub worker_count: usize,
    #[serde(default)]
    pub outlets: Vec<OutletBinding>,
    /// Free-form engine-specific configuration blob.
    #[serde(default)]
    pub extra: Value,
    /// Marks a backend declared in the persisted config, surfaced in
    /// reports. Not part of the identity hash.
    #[serde(default)]
    pub persist: bool,
}

impl BackendConfig {
    /// Fill unset optional fields from process-wide defaults.
    pub fn fill_defaults(&mut self, defaults: &BackendDefaults) {
        if self.storage.is_none() {
            self.storage = Some(defaults.storage.clone());
        }
        if self.preheat.is_none() {
            self.preheat = defaults.preheat.clone();
        }
    }

    /// Validate field constraints and configured caps.
    pub fn validate(&self, limits: &Limits) -> Result<(), ServingError> {
        if self.engine.is_empty() {
            return Err(ServingError::Validation(": engine".into()));
        }
        if self.batch_size < 1 {
            return Err(ServingError::Validation(": batch size".into()));
        }
        if self.worker_count < 1 {
            return Err(ServingError::Validation(": worker count".into()));
        }
        if self.batch_size > limits.max_batch_size {
            return Err(ServingError::LimitExceeded(format!(
                "batch size {} over cap {}",
                self.batch_size, limits.max_batch_size
            )));
        }
        if self.worker_count > limits.max_worker_count {
            return Err(ServingError::LimitExceeded(format!(
                "worker count {} over cap {}",
                self.worker_count, limits.max_worker_count
            )));
        }
        self.model_split()?;
        Ok(())
    }

    /// Deterministic identity over the ten ordered config fields.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        let mut feed = |field: &str| {
            hasher.update(field.as_bytes());
            hasher.update([0u8]);
        };
        feed(&self.engine);
        feed(&self.model_hash);
        feed(&self.access_code);
        feed(&self.private_key_path);
        feed(&path_field(&self.storage));
        feed(&path_field(&self.preheat));
        feed(&self.batch_size.to_string());
        feed(&self.worker_count.to_string());
        feed(&serde_json::to_string(&self.outlets).unwrap_or_default());
        feed(&self.extra.to_string());
        format!("B{}", hex::encode(hasher.finalize()))
    }

    /// Split the model hash into (distro, version).
    pub fn model_split(&self) -> Result<(&str, &str), ServingError> {
        let mut parts = self.model_hash.splitn(2, '-');
        match (parts.next(), parts.next()) {
            (Some(distro), Some(version)) if !distro.is_empty() && !version.is_empty() => {
                Ok((distro, version))
            }
            _ => Err(ServingError::Validation(": model hash".into())),
        }
    }

    /// Directory holding the model artifacts: `<storage>/models/<distro>/<version>`.
    pub fn model_dir(&self) -> Result<PathBuf, ServingError> {
        let storage = self
            .storage
            .as_deref()
            .ok_or_else(|| ServingError::Validation(": storage".into()))?;
        let (distro, version) = self.model_split()?;
        Ok(storage.join("models").join(distro).join(version))
    }

    pub fn encrypted(&self) -> bool {
        !self.access_code.is_empty()
    }
}

fn path_field(path: &Option<PathBuf>) -> String {
    path.as_deref()
        .map(Path::to_string_lossy)
        .map(|s| s.into_owned())
        .unwrap_or_default()
}

/// Process-wide defaults applied to configs at create time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendDefaults {
    pub storage: PathBuf,
    #[serde(default)]
    pub preheat: Option<PathBuf>,
}

impl Default for BackendDefaults {
    fn default() -> Self {
        Self {
            storage: PathBuf::from("storage"),
            preheat: None,
        }
    }
}

/// Caps enforced at create time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Limits {
    pub max_backend_count: usize,
    pub max_batch_size: usize,
    pub max_worker_count: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_backend_count: 8,
            max_batch_size: 32,
            max_worker_count: 4,
        }
    }
}

/// Scheduling deadlines and queue capacities of one worker pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolTiming {
    /// Per-slot fetch deadline during batch assembly; short enough to
    /// observe shutdown promptly.
    #[serde(with = "humantime_serde")]
    pub fetch_deadline: Duration,
    /// Wall-clock cap on one inference invocation.
    #[serde(with = "humantime_serde")]
    pub infer_deadline: Duration,
    /// Grace window between the shutdown broadcast and forced worker
    /// termination; must be >= `fetch_deadline`.
    #[serde(with = "humantime_serde")]
    pub stop_grace: Duration,
    pub task_capacity: usize,
    pub result_capacity: usize,
}

impl Default for PoolTiming {
    fn default() -> Self {
        Self {
            fetch_deadline: Duration::from_millis(500),
            infer_deadline: Duration::from_secs(60),
            stop_grace: Duration::from_secs(2),
            task_capacity: 256,
            result_capacity: 64,
        }
    }
}

impl PoolTiming {
    pub fn validate(&self) -> Result<(), ServingError> {
        if self.stop_grace < self.fetch_deadline {
            return Err(ServingError::Validation(
                ": stop grace below fetch deadline".into(),
            ));
        }
        Ok(())
    }
}
