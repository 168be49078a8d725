//! Batch assembly: fill a fixed number of task slots from the channel,
//! honoring a best-effort per-slot fetch deadline and the pool-wide
//! shutdown signal.

use tracing::debug;

use crate::channel::TaskReceiver;
use crate::config::PoolTiming;
use crate::status::{StatusCell, WorkerStatus};
use crate::task::Task;

/// Outcome of one assembly round.
#[derive(Debug)]
pub enum Assembly {
    /// A full batch of exactly `batch_size` tasks, in dequeue order.
    Full(Vec<Task>),
    /// The shutdown signal was observed at an assembly boundary. Any
    /// partially assembled batch has been discarded (documented data-loss
    /// point).
    Shutdown,
}

pub struct BatchAssembler {
    receiver: TaskReceiver,
    pool_status: StatusCell,
    batch_size: usize,
    timing: PoolTiming,
}

impl BatchAssembler {
    pub fn new(
        receiver: TaskReceiver,
        pool_status: StatusCell,
        batch_size: usize,
        timing: PoolTiming,
    ) -> Self {
        Self {
            receiver,
            pool_status,
            batch_size,
            timing,
        }
    }

    /// Assemble the next batch. Returns [`Assembly::Shutdown`] once the
    /// pool-wide status reads `Exited`, even when a batch had just been
    /// filled: shutdown is checked at the assembly boundary.
    pub async fn next_batch(&self) -> Assembly {
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            match self.receiver.recv_deadline(self.timing.fetch_deadline).await {
                Some(task) => batch.push(task),
                None => {
                    if self.pool_status.load() == WorkerStatus::Exited {
                        break;
                    }
                    debug!(
                        want = self.batch_size,
                        got = batch.len(),
                        "fetch timeout while assembling batch"
                    );
                }
            }
        }
        if self.pool_status.load() == WorkerStatus::Exited {
            if !batch.is_empty() {
                debug!(discarded = batch.len(), "discarding partial batch on shutdown");
            }
            return Assembly::Shutdown;
        }
        Assembly::Full(batch)
    }
}
