//! In-process result queue. Callers poll it through the backend's
//! `dequeue_result` operation; a full queue is the one outlet failure that
//! surfaces to the worker.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::Outlet;
use crate::error::ServingError;
use crate::task::Task;

/// One delivered result, keyed by the task that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEntry {
    pub task_id: String,
    pub data: String,
}

#[derive(Clone, Debug)]
pub struct SyncSender {
    tx: mpsc::Sender<SyncEntry>,
}

/// Consumer half of the result queue, shared by every caller polling the
/// backend for results.
#[derive(Clone)]
pub struct SyncReceiver {
    rx: Arc<Mutex<mpsc::Receiver<SyncEntry>>>,
}

impl SyncReceiver {
    /// Wait up to `deadline` for the next result.
    pub async fn dequeue(&self, deadline: Duration) -> Option<SyncEntry> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(deadline, rx.recv()).await.ok().flatten()
    }

    /// Take a result if one is already queued.
    pub fn try_dequeue(&self) -> Option<SyncEntry> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

pub fn sync_result_queue(capacity: usize) -> (SyncSender, SyncReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        SyncSender { tx },
        SyncReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncConfig {}

#[derive(Debug)]
pub struct SyncOutlet {
    queue: SyncSender,
}

impl SyncOutlet {
    pub fn new(configs: &Value, queue: SyncSender) -> Result<Self, ServingError> {
        let _: SyncConfig = super::parse_configs(configs, "sync")?;
        Ok(Self { queue })
    }
}

#[async_trait::async_trait]
impl Outlet for SyncOutlet {
    fn kind(&self) -> &'static str {
        "sync"
    }

    async fn post_result(&self, task: &Task, data: &str) -> Result<(), ServingError> {
        let entry = SyncEntry {
            task_id: task.task_id.clone(),
            data: data.to_owned(),
        };
        self.queue.tx.try_send(entry).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ServingError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                ServingError::NotFound("result queue closed".into())
            }
        })
    }
}
