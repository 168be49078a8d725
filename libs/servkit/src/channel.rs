//! Bounded task channel between producers and the worker pool.
//!
//! Producers enqueue without blocking; workers receive with a short
//! per-attempt deadline so the pool shutdown signal is observed promptly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::ServingError;
use crate::task::Task;

/// Create a bounded task channel with the given capacity.
pub fn task_channel(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TaskSender { tx },
        TaskReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer half: non-blocking enqueue.
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::Sender<Task>,
}

impl TaskSender {
    pub fn try_send(&self, task: Task) -> Result<(), ServingError> {
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ServingError::QueueFull,
            mpsc::error::TrySendError::Closed(task) => {
                ServingError::Validation(format!(": task channel closed, dropped {}", task))
            }
        })
    }
}

/// Consumer half, shared by every worker of one backend. Whichever worker
/// wins the race to lock the receiver dequeues the next task.
#[derive(Clone)]
pub struct TaskReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
}

impl TaskReceiver {
    /// Wait up to `deadline` for one task. `None` means the attempt timed
    /// out (or the channel is closed); callers re-check the pool status.
    pub async fn recv_deadline(&self, deadline: Duration) -> Option<Task> {
        let fetch = async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        };
        match tokio::time::timeout(deadline, fetch).await {
            Ok(task) => task,
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_receive() {
        let (tx, rx) = task_channel(4);
        tx.try_send(Task::new("t-1", "img-1")).unwrap();

        let task = rx.recv_deadline(Duration::from_millis(50)).await.unwrap();
        assert_eq!(task.task_id, "t-1");
    }

    #[tokio::test]
    async fn receive_times_out_when_empty() {
        let (_tx, rx) = task_channel(4);
        let got = rx.recv_deadline(Duration::from_millis(10)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn full_channel_rejects_producer() {
        let (tx, _rx) = task_channel(1);
        tx.try_send(Task::new("t-1", "img-1")).unwrap();
        let err = tx.try_send(Task::new("t-2", "img-2")).unwrap_err();
        assert_eq!(err.code(), 110);
    }

    #[tokio::test]
    async fn receivers_compete_for_tasks() {
        let (tx, rx) = task_channel(8);
        let rx2 = rx.clone();
        for i in 0..4 {
            tx.try_send(Task::new(format!("t-{i}"), format!("img-{i}")))
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.recv_deadline(Duration::from_millis(50)).await.unwrap());
            seen.push(rx2.recv_deadline(Duration::from_millis(50)).await.unwrap());
        }
        assert_eq!(seen.len(), 4);
        // Each task is consumed exactly once.
        let mut ids: Vec<_> = seen.iter().map(|t| t.task_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }
}
