//! Error taxonomy and the `{code, msg}` reply shape returned by every
//! mutating registry operation.

use serde::Serialize;
use thiserror::Error;

/// Domain errors of the serving engine.
///
/// Load and inference failures never cross the registry boundary as errors;
/// they are recorded in worker status cells and surfaced via `report()`.
/// Everything else maps to a stable numeric code in replies.
#[derive(Debug, Error)]
pub enum ServingError {
    #[error("given parameters are invalid{0}")]
    Validation(String),

    #[error("missing native dependency for '{0}'")]
    DependencyMissing(String),

    #[error("backend already exists: {0}")]
    DuplicateBackend(String),

    #[error("limitation exceeded: {0}")]
    LimitExceeded(String),

    #[error("load model error{0}")]
    ReloadModel(String),

    #[error("inference timeout")]
    InferTimeout,

    #[error("value error{0}")]
    InvalidLabels(String),

    #[error("device unavailable: {0}")]
    DeviceFatal(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task queue is full")]
    QueueFull,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ServingError {
    /// Stable wire code; 0 is reserved for success.
    pub fn code(&self) -> u32 {
        match self {
            Self::LimitExceeded(_) => 101,
            Self::DuplicateBackend(_) => 102,
            Self::ReloadModel(_) => 107,
            Self::QueueFull => 110,
            Self::NotFound(_) => 113,
            Self::InferTimeout => 114,
            Self::InvalidLabels(_) => 116,
            Self::DeviceFatal(_) => 120,
            Self::DependencyMissing(_) => 200,
            Self::Validation(_) => 201,
            Self::Other(_) => 1,
        }
    }

    /// True for value/parameter failures that classify a worker as
    /// `ErrorLabels` rather than plain `Error`.
    pub fn is_value_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::InvalidLabels(_))
    }
}

/// Result of a mutating operation: `code` 0 on success, an error code plus
/// message otherwise.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ResultReply {
    pub code: u32,
    pub msg: String,
}

impl ResultReply {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            code: 0,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl From<&ServingError> for ResultReply {
    fn from(err: &ServingError) -> Self {
        Self {
            code: err.code(),
            msg: err.to_string(),
        }
    }
}

impl From<Result<String, ServingError>> for ResultReply {
    fn from(res: Result<String, ServingError>) -> Self {
        match res {
            Ok(msg) => Self::ok(msg),
            Err(err) => Self::from(&err),
        }
    }
}
