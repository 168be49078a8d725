//! Inference tasks and the shared image pool they reference.

use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

use crate::error::ServingError;

/// One inference request.
///
/// The task id is caller-supplied and not required to be unique across
/// backends; `image_id` keys into the [`ImagePool`] and is consumed exactly
/// once by the worker that dequeues the task.
#[derive(Clone, Debug)]
pub struct Task {
    pub task_id: String,
    pub image_id: String,
    pub outlet_id: Option<String>,
    pub extra: Value,
}

impl Task {
    pub fn new(task_id: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            image_id: image_id.into(),
            outlet_id: None,
            extra: Value::Null,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    pub fn set_outlet(&mut self, outlet_id: impl Into<String>) {
        self.outlet_id = Some(outlet_id.into());
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<task: id: {}, img: {}, outlet: {}>",
            self.task_id,
            self.image_id,
            self.outlet_id.as_deref().unwrap_or("-")
        )
    }
}

/// Shared associative store mapping an opaque id to a raw decoded payload.
///
/// Single-writer/single-reader handoff: the producer writes once, exactly
/// one consumer takes the entry (remove-on-read) and it is never read twice.
#[derive(Clone, Debug, Default)]
pub struct ImagePool {
    inner: Arc<DashMap<String, Bytes>>,
}

impl ImagePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Insert a payload under `image_id`. Fails if the id is already
    /// present: entries are written once.
    pub fn put(&self, image_id: impl Into<String>, payload: Bytes) -> Result<(), ServingError> {
        let image_id = image_id.into();
        use dashmap::mapref::entry::Entry;
        match self.inner.entry(image_id) {
            Entry::Occupied(e) => Err(ServingError::Validation(format!(
                ": image id already present: {}",
                e.key()
            ))),
            Entry::Vacant(e) => {
                e.insert(payload);
                Ok(())
            }
        }
    }

    /// Remove and return the payload for `image_id`.
    pub fn take(&self, image_id: &str) -> Option<Bytes> {
        self.inner.remove(image_id).map(|(_, payload)| payload)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
