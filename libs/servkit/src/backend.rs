//! One serving backend: an immutable config, its outlets, and the worker
//! pool spawned from it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::{task_channel, TaskReceiver, TaskSender};
use crate::config::{BackendConfig, OutletBinding, PoolTiming};
use crate::engine::EngineFactory;
use crate::error::ServingError;
use crate::loader::ModelLoader;
use crate::outlet::{
    sync_result_queue, OutletFactory, OutletInfo, OutletSet, OutletWiring, SyncEntry, SyncReceiver,
};
use crate::sandbox::SandboxDecoder;
use crate::status::{StatusCell, WorkerStatus};
use crate::task::{ImagePool, Task};
use crate::worker::{run_worker, WorkerContext};

/// Point-in-time view of one backend, serialized into reports.
#[derive(Clone, Debug, Serialize)]
pub struct BackendReport {
    pub id: String,
    pub engine: String,
    pub model_hash: String,
    pub access_code: String,
    pub private_key_path: String,
    pub storage: Option<std::path::PathBuf>,
    pub preheat: Option<std::path::PathBuf>,
    pub batch_size: usize,
    pub worker_count: usize,
    pub extra: serde_json::Value,
    pub persist: bool,
    pub status: String,
    pub status_code: u8,
    /// Per-worker status codes, empty before the first `run()`.
    pub workers: Vec<u8>,
    pub pending_images: usize,
    pub outlets: Vec<OutletInfo>,
}

pub struct Backend {
    id: String,
    config: Arc<BackendConfig>,
    timing: PoolTiming,
    engines: EngineFactory,
    loader: Arc<ModelLoader>,
    outlets: Arc<OutletSet>,
    outlet_factory: OutletFactory,
    wiring: OutletWiring,
    /// Shutdown broadcast for the current worker generation.
    pool_status: StatusCell,
    worker_cells: RwLock<Vec<StatusCell>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    tasks: TaskSender,
    receiver: TaskReceiver,
    images: ImagePool,
    results: SyncReceiver,
    shutdown: CancellationToken,
}

impl Backend {
    /// Build a backend from a validated config. Probes the engine
    /// constructor so a missing native dependency fails at create time,
    /// not at first `run()`.
    pub fn new(
        config: BackendConfig,
        engines: EngineFactory,
        outlet_factory: OutletFactory,
        sandbox: Option<Arc<dyn SandboxDecoder>>,
        timing: PoolTiming,
        shutdown: CancellationToken,
    ) -> Result<Self, ServingError> {
        let config = Arc::new(config);
        let id = config.identity();
        drop(engines.build(&config)?);

        let (tasks, receiver) = task_channel(timing.task_capacity);
        let (sync_queue, results) = sync_result_queue(timing.result_capacity);
        let wiring = OutletWiring { sync_queue };
        let outlets = Arc::new(OutletSet::from_bindings(
            &config.outlets,
            &outlet_factory,
            &wiring,
        )?);
        let loader = Arc::new(ModelLoader::new(config.clone(), sandbox));
        let images = ImagePool::new();

        Ok(Self {
            id,
            config,
            timing,
            engines,
            loader,
            outlets,
            outlet_factory,
            wiring,
            pool_status: StatusCell::new(),
            worker_cells: RwLock::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            tasks,
            receiver,
            images,
            results,
            shutdown,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Aggregate status over the last spawned worker generation, whose
    /// cells stay readable after `stop()`. Before the first `run()` the
    /// pool-level cell answers.
    pub fn status(&self) -> WorkerStatus {
        let cells = self.worker_cells.read();
        if cells.is_empty() {
            return self.pool_status.load();
        }
        aggregate(cells.iter().map(StatusCell::load))
    }

    /// Whether the pool accepts task dispatch. True from `run()` until
    /// `stop()`, independent of individual worker readiness.
    pub fn is_running(&self) -> bool {
        self.pool_status.load() == WorkerStatus::Running
    }

    /// Start (or restart) the worker pool and return the backend id as
    /// the run handle. A running pool is stopped first; outlets appended
    /// since the last `run()` become active and the model descriptor is
    /// re-read during each worker's load.
    pub async fn run(&self) -> Result<String, ServingError> {
        self.stop().await;
        self.outlets.activate_pending();
        self.pool_status.store(WorkerStatus::Unloaded);

        // Build every engine up front so a constructor failure spawns
        // nothing.
        let mut engines = Vec::with_capacity(self.config.worker_count);
        for _ in 0..self.config.worker_count {
            engines.push(self.engines.build(&self.config)?);
        }

        let mut cells = Vec::with_capacity(engines.len());
        let mut handles = self.handles.lock().await;
        for (index, engine) in engines.into_iter().enumerate() {
            let cell = StatusCell::new();
            let ctx = WorkerContext {
                backend_id: self.id.clone(),
                index,
                pool_status: self.pool_status.clone(),
                self_status: cell.clone(),
                receiver: self.receiver.clone(),
                images: self.images.clone(),
                outlets: self.outlets.clone(),
                loader: self.loader.clone(),
                timing: self.timing.clone(),
                shutdown: self.shutdown.clone(),
                preheat: self.config.preheat.clone(),
                batch_size: self.config.batch_size,
            };
            cells.push(cell);
            handles.push(tokio::spawn(run_worker(ctx, engine)));
        }
        *self.worker_cells.write() = cells;
        // Dispatch is accepted from here on; workers may still be loading.
        self.pool_status.store(WorkerStatus::Running);
        info!(backend = %self.id, workers = handles.len(), "worker pool started");
        Ok(self.id.clone())
    }

    /// Broadcast shutdown, grant the grace window, then force-terminate
    /// stragglers. Idempotent; a pool that never ran returns immediately.
    pub async fn stop(&self) {
        self.pool_status.store(WorkerStatus::Exited);
        let mut handles = self.handles.lock().await;
        if handles.is_empty() {
            return;
        }
        if !handles.iter().all(JoinHandle::is_finished) {
            tokio::time::sleep(self.timing.stop_grace).await;
        }
        // Cells are kept until the next run() so reports still show the
        // last generation's terminal codes.
        let cells = self.worker_cells.read().clone();
        for (index, handle) in handles.drain(..).enumerate() {
            if !handle.is_finished() {
                warn!(backend = %self.id, worker = index, "worker ignored shutdown, aborting");
                handle.abort();
                if let Some(cell) = cells.get(index) {
                    if !cell.load().is_terminal() {
                        cell.store(WorkerStatus::Exited);
                    }
                }
            }
            // JoinError from an abort is expected here.
            let _ = handle.await;
        }
        info!(backend = %self.id, "worker pool stopped");
    }

    /// Enqueue one task with its payload. The payload is withdrawn again
    /// when the queue rejects the task, so nothing leaks on backpressure.
    pub fn enqueue_task(&self, task: Task, payload: Bytes) -> Result<(), ServingError> {
        if !self.is_running() {
            return Err(ServingError::Validation(format!(
                ": backend is {} and cannot accept tasks",
                self.pool_status.load()
            )));
        }
        self.images.put(&task.image_id, payload)?;
        let image_id = task.image_id.clone();
        if let Err(err) = self.tasks.try_send(task) {
            self.images.take(&image_id);
            return Err(err);
        }
        Ok(())
    }

    /// Wait up to `deadline` for the next result on the sync outlet queue.
    pub async fn dequeue_result(&self, deadline: Duration) -> Option<SyncEntry> {
        self.results.dequeue(deadline).await
    }

    /// Append an outlet. While the pool runs, the outlet stays inert until
    /// the next `run()`.
    pub fn append_outlet(&self, binding: OutletBinding) -> Result<String, ServingError> {
        self.outlets
            .append(binding, &self.outlet_factory, &self.wiring, self.is_running())
    }

    pub fn remove_outlet(&self, key: &str) -> Result<(), ServingError> {
        self.outlets.remove(key)
    }

    pub fn report(&self) -> BackendReport {
        let status = self.status();
        BackendReport {
            id: self.id.clone(),
            engine: self.config.engine.clone(),
            model_hash: self.config.model_hash.clone(),
            access_code: self.config.access_code.clone(),
            private_key_path: self.config.private_key_path.clone(),
            storage: self.config.storage.clone(),
            preheat: self.config.preheat.clone(),
            batch_size: self.config.batch_size,
            worker_count: self.config.worker_count,
            extra: self.config.extra.clone(),
            persist: self.config.persist,
            status: status.to_string(),
            status_code: status.code(),
            workers: self
                .worker_cells
                .read()
                .iter()
                .map(|c| c.load().code())
                .collect(),
            pending_images: self.images.len(),
            outlets: self.outlets.list(),
        }
    }
}

fn aggregate(statuses: impl Iterator<Item = WorkerStatus>) -> WorkerStatus {
    use WorkerStatus::*;
    let mut seen = Vec::new();
    for status in statuses {
        seen.push(status);
    }
    for candidate in [Error, ErrorLabels, Cleaning, Loading, Preheating, Unloaded] {
        if seen.iter().any(|s| *s == candidate) {
            return candidate;
        }
    }
    if seen.iter().any(|s| *s == Running) {
        Running
    } else {
        Exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::time::Duration;

    async fn seeded_storage() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("models").join("aa").join("1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("model_core"), b"weights")
            .await
            .unwrap();
        tmp
    }

    fn echo_factory() -> EngineFactory {
        let mut engines = EngineFactory::new();
        engines.register("echo", |_| {
            Ok(Box::new(crate::engine::EchoEngine::default()) as _)
        });
        engines
    }

    fn config(storage: PathBuf, workers: usize) -> BackendConfig {
        BackendConfig {
            engine: "echo".into(),
            model_hash: "aa-1".into(),
            access_code: String::new(),
            private_key_path: String::new(),
            storage: Some(storage),
            preheat: None,
            batch_size: 1,
            worker_count: workers,
            outlets: vec![OutletBinding {
                key: None,
                kind: "sync".into(),
                configs: Value::Null,
            }],
            extra: Value::Null,
            persist: false,
        }
    }

    fn timing() -> PoolTiming {
        PoolTiming {
            fetch_deadline: Duration::from_millis(20),
            stop_grace: Duration::from_millis(50),
            ..PoolTiming::default()
        }
    }

    fn backend(cfg: BackendConfig) -> Backend {
        Backend::new(
            cfg,
            echo_factory(),
            OutletFactory::with_defaults(),
            None,
            timing(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    async fn wait_running(backend: &Backend) {
        for _ in 0..200 {
            if backend.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("backend never reached Running, status {}", backend.status());
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let tmp = seeded_storage().await;
        let backend = backend(config(tmp.path().to_path_buf(), 2));
        assert_eq!(backend.status(), WorkerStatus::Unloaded);

        backend.run().await.unwrap();
        wait_running(&backend).await;
        assert_eq!(backend.report().workers.len(), 2);

        backend
            .enqueue_task(Task::new("t-0", "img-0"), Bytes::from_static(b"px"))
            .unwrap();
        let result = backend
            .dequeue_result(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result.task_id, "t-0");

        backend.stop().await;
        assert_eq!(backend.status(), WorkerStatus::Exited);
        // Idempotent.
        backend.stop().await;
        assert_eq!(backend.status(), WorkerStatus::Exited);
    }

    #[tokio::test]
    async fn rejects_tasks_unless_running() {
        let tmp = seeded_storage().await;
        let backend = backend(config(tmp.path().to_path_buf(), 1));
        let err = backend
            .enqueue_task(Task::new("t-0", "img-0"), Bytes::from_static(b"px"))
            .unwrap_err();
        assert_eq!(err.code(), 201);
        assert_eq!(backend.images.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_image_ids_are_rejected() {
        let tmp = seeded_storage().await;
        let backend = backend(config(tmp.path().to_path_buf(), 1));
        backend.run().await.unwrap();
        wait_running(&backend).await;

        // Never consumed: the id stays occupied while queued.
        backend.images.put("img-0", Bytes::from_static(b"a")).unwrap();
        let err = backend
            .enqueue_task(Task::new("t-0", "img-0"), Bytes::from_static(b"b"))
            .unwrap_err();
        assert_eq!(err.code(), 201);
        backend.stop().await;
    }

    #[tokio::test]
    async fn run_twice_restarts_the_pool() {
        let tmp = seeded_storage().await;
        let backend = backend(config(tmp.path().to_path_buf(), 1));
        backend.run().await.unwrap();
        wait_running(&backend).await;
        backend.run().await.unwrap();
        wait_running(&backend).await;
        assert_eq!(backend.report().workers.len(), 1);
        backend.stop().await;
    }

    #[tokio::test]
    async fn terminal_worker_codes_survive_stop() {
        let tmp = seeded_storage().await;
        let mut cfg = config(tmp.path().to_path_buf(), 1);
        cfg.preheat = Some(tmp.path().join("missing.jpg"));
        let backend = backend(cfg);
        backend.run().await.unwrap();

        for _ in 0..200 {
            if backend.report().workers == vec![WorkerStatus::Error.code()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.report().workers, vec![WorkerStatus::Error.code()]);

        backend.stop().await;
        // The last generation's codes stay readable until the next run().
        assert_eq!(backend.report().workers, vec![WorkerStatus::Error.code()]);
        assert_eq!(backend.status(), WorkerStatus::Error);
    }

    #[tokio::test]
    async fn outlet_appended_while_running_waits_for_reload() {
        let tmp = seeded_storage().await;
        let backend = backend(config(tmp.path().to_path_buf(), 1));
        backend.run().await.unwrap();
        wait_running(&backend).await;

        let key = backend
            .append_outlet(OutletBinding {
                key: Some("late".into()),
                kind: "sync".into(),
                configs: Value::Null,
            })
            .unwrap();
        assert_eq!(key, "late");
        assert_eq!(backend.report().outlets.len(), 2);

        backend
            .enqueue_task(Task::new("t-0", "img-0"), Bytes::from_static(b"px"))
            .unwrap();
        let first = backend
            .dequeue_result(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(first.task_id, "t-0");
        // Only the original sync outlet delivered.
        assert!(backend
            .dequeue_result(Duration::from_millis(100))
            .await
            .is_none());

        backend.run().await.unwrap();
        wait_running(&backend).await;
        backend
            .enqueue_task(Task::new("t-1", "img-1"), Bytes::from_static(b"px"))
            .unwrap();
        // Both sync outlets feed the same queue now.
        assert!(backend.dequeue_result(Duration::from_secs(2)).await.is_some());
        assert!(backend.dequeue_result(Duration::from_secs(2)).await.is_some());
        backend.stop().await;
    }
}
