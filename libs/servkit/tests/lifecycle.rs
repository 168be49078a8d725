//! End-to-end lifecycle tests driven through the registry API.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use servkit::config::{BackendConfig, BackendDefaults, Limits, OutletBinding, PoolTiming};
use servkit::engine::{EchoEngine, EngineFactory, ModelEngine, StagedModel};
use servkit::error::ServingError;
use servkit::registry::{BackendRegistry, RegistrySettings};
use servkit::status::WorkerStatus;
use servkit::task::{ImagePool, Task};

struct SlowEngine;

#[async_trait]
impl ModelEngine for SlowEngine {
    async fn load_model(&mut self, _staged: &StagedModel) -> Result<bool, ServingError> {
        Ok(true)
    }
    async fn load_parameters(&mut self) -> Result<(), ServingError> {
        Ok(())
    }
    async fn infer(
        &mut self,
        _batch: &[Task],
        _images: &ImagePool,
    ) -> Result<Vec<Value>, ServingError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(vec![])
    }
    fn model_bound(&self) -> bool {
        true
    }
}

async fn seed_model(storage: &Path) {
    let dir = storage.join("models").join("det").join("3");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join("model_core"), b"weights")
        .await
        .unwrap();
}

fn registry(storage: &Path, infer_deadline: Duration) -> Arc<BackendRegistry> {
    let mut engines = EngineFactory::new();
    engines.register("echo", |_| Ok(Box::new(EchoEngine::default()) as _));
    engines.register("slow", |_| Ok(Box::new(SlowEngine) as _));
    Arc::new(BackendRegistry::new(
        engines,
        servkit::outlet::OutletFactory::with_defaults(),
        None,
        RegistrySettings {
            defaults: BackendDefaults {
                storage: storage.to_path_buf(),
                preheat: None,
            },
            limits: Limits::default(),
            timing: PoolTiming {
                fetch_deadline: Duration::from_millis(20),
                infer_deadline,
                stop_grace: Duration::from_millis(60),
                ..PoolTiming::default()
            },
        },
        CancellationToken::new(),
    ))
}

fn config(engine: &str, batch_size: usize, sync_outlets: usize) -> BackendConfig {
    BackendConfig {
        engine: engine.into(),
        model_hash: "det-3".into(),
        access_code: String::new(),
        private_key_path: String::new(),
        storage: None,
        preheat: None,
        batch_size,
        worker_count: 1,
        outlets: (0..sync_outlets)
            .map(|i| OutletBinding {
                key: Some(format!("sync-{i}")),
                kind: "sync".into(),
                configs: Value::Null,
            })
            .collect(),
        extra: Value::Null,
        persist: false,
    }
}

async fn wait_status(registry: &BackendRegistry, id: &str, want: WorkerStatus) {
    for _ in 0..300 {
        if registry.get(id).unwrap().status() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "backend never reached {want}, stuck at {}",
        registry.get(id).unwrap().status()
    );
}

#[tokio::test]
async fn full_lifecycle_serves_every_task() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let registry = registry(tmp.path(), Duration::from_secs(60));

    let id = registry.create(config("echo", 2, 1)).unwrap();
    registry.run(&id).await.unwrap();
    wait_status(&registry, &id, WorkerStatus::Running).await;

    for i in 0..4 {
        registry
            .enqueue_task(
                &id,
                Task::new(format!("t-{i}"), format!("img-{i}")),
                Bytes::from_static(b"frame"),
            )
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let entry = registry
            .dequeue_result(&id, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("missing result");
        seen.push(entry.task_id);
    }
    seen.sort();
    assert_eq!(seen, vec!["t-0", "t-1", "t-2", "t-3"]);
    // Every payload was consumed.
    assert_eq!(registry.report(&id).unwrap().pending_images, 0);

    registry.stop(&id).await.unwrap();
    assert_eq!(registry.get(&id).unwrap().status(), WorkerStatus::Exited);
}

#[tokio::test]
async fn run_then_immediate_stop_terminates_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let registry = registry(tmp.path(), Duration::from_secs(60));

    let id = registry.create(config("echo", 1, 1)).unwrap();
    registry.run(&id).await.unwrap();
    registry.stop(&id).await.unwrap();
    assert_eq!(registry.get(&id).unwrap().status(), WorkerStatus::Exited);

    // Stop is idempotent and the pool restarts afterwards.
    registry.stop(&id).await.unwrap();
    registry.run(&id).await.unwrap();
    wait_status(&registry, &id, WorkerStatus::Running).await;
    registry.stop(&id).await.unwrap();
}

#[tokio::test]
async fn fan_out_delivers_to_every_bound_outlet() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let registry = registry(tmp.path(), Duration::from_secs(60));

    // Two sync outlets share the backend result queue, so each task shows
    // up exactly twice.
    let id = registry.create(config("echo", 1, 2)).unwrap();
    registry.run(&id).await.unwrap();
    wait_status(&registry, &id, WorkerStatus::Running).await;

    for i in 0..3 {
        registry
            .enqueue_task(
                &id,
                Task::new(format!("t-{i}"), format!("img-{i}")),
                Bytes::from_static(b"frame"),
            )
            .unwrap();
    }

    let mut counts = std::collections::HashMap::new();
    for _ in 0..6 {
        let entry = registry
            .dequeue_result(&id, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("missing fan-out delivery");
        *counts.entry(entry.task_id).or_insert(0) += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 2));

    registry.stop(&id).await.unwrap();
}

#[tokio::test]
async fn unreadable_preheat_ends_in_error_before_running() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let registry = registry(tmp.path(), Duration::from_secs(60));

    let mut cfg = config("echo", 1, 1);
    cfg.preheat = Some(tmp.path().join("no-such-sample.jpg"));
    let id = registry.create(cfg).unwrap();
    registry.run(&id).await.unwrap();

    wait_status(&registry, &id, WorkerStatus::Error).await;
    let report = registry.report(&id).unwrap();
    assert_eq!(report.workers, vec![WorkerStatus::Error.code()]);

    registry.stop(&id).await.unwrap();
}

#[tokio::test]
async fn inference_timeout_fails_the_worker_without_delivery() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let registry = registry(tmp.path(), Duration::from_millis(80));

    let id = registry.create(config("slow", 1, 1)).unwrap();
    registry.run(&id).await.unwrap();
    registry
        .enqueue_task(&id, Task::new("t-0", "img-0"), Bytes::from_static(b"frame"))
        .unwrap();

    wait_status(&registry, &id, WorkerStatus::Error).await;
    assert!(registry
        .dequeue_result(&id, Duration::from_millis(100))
        .await
        .unwrap()
        .is_none());

    registry.stop(&id).await.unwrap();
}

#[tokio::test]
async fn status_progresses_monotonically_to_running() {
    let tmp = tempfile::tempdir().unwrap();
    seed_model(tmp.path()).await;
    let sample = tmp.path().join("sample.jpg");
    tokio::fs::write(&sample, b"pixels").await.unwrap();
    let registry = registry(tmp.path(), Duration::from_secs(60));

    let mut cfg = config("echo", 1, 1);
    cfg.preheat = Some(sample);
    let id = registry.create(cfg).unwrap();

    assert_eq!(registry.get(&id).unwrap().status(), WorkerStatus::Unloaded);
    registry.run(&id).await.unwrap();

    let rank = |s: WorkerStatus| match s {
        WorkerStatus::Unloaded => 0,
        WorkerStatus::Loading => 1,
        WorkerStatus::Preheating => 2,
        WorkerStatus::Running => 3,
        other => panic!("unexpected status {other}"),
    };
    let backend = registry.get(&id).unwrap();
    let mut last = 0;
    for _ in 0..300 {
        let now = rank(backend.status());
        assert!(now >= last, "status went backwards");
        last = now;
        if last == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(last, 3, "backend never reached Running");

    registry.delete(&id).await.unwrap();
    assert!(registry.list().is_empty());
}
