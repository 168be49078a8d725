//! Result sinks ("outlets") and the per-backend fan-out dispatcher.

mod exporter;
mod mqtt;
mod redis_kv;
mod sync;

pub use exporter::SyncExporterOutlet;
pub use mqtt::MqttOutlet;
pub use redis_kv::RedisOutlet;
pub use sync::{sync_result_queue, SyncEntry, SyncOutlet, SyncReceiver, SyncSender};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::OutletBinding;
use crate::error::ServingError;
use crate::task::Task;

/// Parse an outlet's `configs` map, treating an absent map as empty so
/// serde defaults apply.
pub(crate) fn parse_configs<T: serde::de::DeserializeOwned>(
    value: &Value,
    what: &str,
) -> Result<T, ServingError> {
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| ServingError::Validation(format!(": {what} outlet configs: {e}")))
}

/// Delivery capability of one configured result sink.
#[async_trait]
pub trait Outlet: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Deliver the serialized result of one finished task.
    async fn post_result(&self, task: &Task, data: &str) -> Result<(), ServingError>;
}

impl std::fmt::Debug for dyn Outlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outlet").field("kind", &self.kind()).finish()
    }
}

/// Wiring handed to outlet constructors. The sync outlet attaches to the
/// backend's in-process result queue.
#[derive(Clone)]
pub struct OutletWiring {
    pub sync_queue: SyncSender,
}

type OutletCtor =
    Arc<dyn Fn(&Value, &OutletWiring) -> Result<Arc<dyn Outlet>, ServingError> + Send + Sync>;

/// Explicit registration table of outlet constructors, built once at
/// startup. Unknown type tags fail closed.
#[derive(Clone, Default)]
pub struct OutletFactory {
    ctors: HashMap<String, OutletCtor>,
}

impl OutletFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with all built-in outlet kinds registered.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("sync", |configs, wiring| {
            Ok(Arc::new(SyncOutlet::new(configs, wiring.sync_queue.clone())?) as _)
        });
        factory.register("mosquitto", |configs, _| {
            Ok(Arc::new(MqttOutlet::connect(configs)?) as _)
        });
        factory.register("redis", |configs, _| {
            Ok(Arc::new(RedisOutlet::connect(configs)?) as _)
        });
        factory.register("syncexporter", |configs, _| {
            Ok(Arc::new(SyncExporterOutlet::new(configs)?) as _)
        });
        factory
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, ctor: F)
    where
        F: Fn(&Value, &OutletWiring) -> Result<Arc<dyn Outlet>, ServingError>
            + Send
            + Sync
            + 'static,
    {
        self.ctors.insert(kind.into(), Arc::new(ctor));
    }

    pub fn build(
        &self,
        binding: &OutletBinding,
        wiring: &OutletWiring,
    ) -> Result<Arc<dyn Outlet>, ServingError> {
        let ctor = self
            .ctors
            .get(&binding.kind)
            .ok_or_else(|| ServingError::DependencyMissing(format!("outlet '{}'", binding.kind)))?;
        ctor(&binding.configs, wiring)
    }
}

/// One outlet bound into a backend under a unique key.
#[derive(Clone)]
pub struct BoundOutlet {
    pub key: String,
    pub kind: String,
    pub configs: Value,
    outlet: Arc<dyn Outlet>,
}

/// Listing entry for reports.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct OutletInfo {
    pub key: String,
    pub kind: String,
    pub configs: Value,
}

/// The outlets of one backend, in binding order.
///
/// Outlets appended while the pool is running land in the pending list and
/// only become active on the next `run()`; the dispatcher never sees them
/// before that.
#[derive(Default)]
pub struct OutletSet {
    active: RwLock<Vec<BoundOutlet>>,
    pending: RwLock<Vec<BoundOutlet>>,
}

impl OutletSet {
    /// Build the initial set from config bindings. Keys default to the
    /// ordinal position and must be unique within the backend.
    pub fn from_bindings(
        bindings: &[OutletBinding],
        factory: &OutletFactory,
        wiring: &OutletWiring,
    ) -> Result<Self, ServingError> {
        let set = Self::default();
        for binding in bindings {
            set.insert(binding.clone(), factory, wiring, false)?;
        }
        Ok(set)
    }

    fn insert(
        &self,
        binding: OutletBinding,
        factory: &OutletFactory,
        wiring: &OutletWiring,
        pending: bool,
    ) -> Result<String, ServingError> {
        let outlet = factory.build(&binding, wiring)?;
        let mut active = self.active.write();
        let mut pending_list = self.pending.write();
        let key = match binding.key.clone() {
            Some(key) => key,
            None => (active.len() + pending_list.len()).to_string(),
        };
        if active.iter().chain(pending_list.iter()).any(|o| o.key == key) {
            return Err(ServingError::Validation(format!(
                ": duplicate outlet key: {key}"
            )));
        }
        let bound = BoundOutlet {
            key: key.clone(),
            kind: binding.kind,
            configs: binding.configs,
            outlet,
        };
        if pending {
            pending_list.push(bound);
        } else {
            active.push(bound);
        }
        Ok(key)
    }

    /// Append an outlet. When `pool_running`, the outlet stays inert until
    /// the next `run()`.
    pub fn append(
        &self,
        binding: OutletBinding,
        factory: &OutletFactory,
        wiring: &OutletWiring,
        pool_running: bool,
    ) -> Result<String, ServingError> {
        if pool_running {
            warn!("appended outlet will not be available until reload");
        }
        self.insert(binding, factory, wiring, pool_running)
    }

    /// Promote pending outlets into the active list (called by `run()`).
    pub fn activate_pending(&self) {
        let mut pending = self.pending.write();
        if pending.is_empty() {
            return;
        }
        self.active.write().append(&mut pending);
    }

    pub fn remove(&self, key: &str) -> Result<(), ServingError> {
        let mut active = self.active.write();
        if let Some(pos) = active.iter().position(|o| o.key == key) {
            active.remove(pos);
            return Ok(());
        }
        let mut pending = self.pending.write();
        if let Some(pos) = pending.iter().position(|o| o.key == key) {
            pending.remove(pos);
            return Ok(());
        }
        Err(ServingError::NotFound(format!("outlet key '{key}'")))
    }

    pub fn list(&self) -> Vec<OutletInfo> {
        self.active
            .read()
            .iter()
            .chain(self.pending.read().iter())
            .map(|o| OutletInfo {
                key: o.key.clone(),
                kind: o.kind.clone(),
                configs: o.configs.clone(),
            })
            .collect()
    }

    /// Fan the finished task's result out to every active outlet in
    /// binding order. A failing outlet does not block the others, except
    /// the sync outlet whose queue-full condition propagates to the
    /// caller.
    pub async fn post(&self, task: &Task, result: &Value) -> Result<(), ServingError> {
        let data = serde_json::to_string(result)
            .map_err(|e| ServingError::InvalidLabels(format!(": serialize result: {e}")))?;
        let snapshot: Vec<BoundOutlet> = self.active.read().clone();
        for bound in &snapshot {
            match bound.outlet.post_result(task, &data).await {
                Ok(()) => {}
                Err(err) if bound.kind == "sync" => return Err(err),
                Err(err) => {
                    warn!(
                        outlet = %bound.key,
                        kind = %bound.kind,
                        task = %task.task_id,
                        error = %err,
                        "outlet delivery failed"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOutlet {
        kind: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Outlet for CountingOutlet {
        fn kind(&self) -> &'static str {
            self.kind
        }
        async fn post_result(&self, _task: &Task, _data: &str) -> Result<(), ServingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ServingError::QueueFull)
            } else {
                Ok(())
            }
        }
    }

    fn counting_factory(calls: Arc<AtomicUsize>, fail_kind: Option<&'static str>) -> OutletFactory {
        let mut factory = OutletFactory::new();
        for kind in ["a", "b", "c"] {
            let calls = calls.clone();
            let fail = fail_kind == Some(kind);
            factory.register(kind, move |_, _| {
                Ok(Arc::new(CountingOutlet {
                    kind: "test",
                    calls: calls.clone(),
                    fail,
                }) as _)
            });
        }
        factory
    }

    fn wiring() -> OutletWiring {
        let (tx, _rx) = sync_result_queue(4);
        OutletWiring { sync_queue: tx }
    }

    fn binding(kind: &str) -> OutletBinding {
        OutletBinding {
            key: None,
            kind: kind.into(),
            configs: Value::Null,
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_every_outlet_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls.clone(), None);
        let set = OutletSet::from_bindings(
            &[binding("a"), binding("b"), binding("c")],
            &factory,
            &wiring(),
        )
        .unwrap();

        set.post(&Task::new("t-1", "img-1"), &json!([])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn one_failure_does_not_block_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls.clone(), Some("b"));
        let set = OutletSet::from_bindings(
            &[binding("a"), binding("b"), binding("c")],
            &factory,
            &wiring(),
        )
        .unwrap();

        set.post(&Task::new("t-1", "img-1"), &json!([])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ordinal_keys_and_duplicates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls, None);
        let set = OutletSet::from_bindings(&[binding("a")], &factory, &wiring()).unwrap();

        let key = set
            .append(binding("b"), &factory, &wiring(), false)
            .unwrap();
        assert_eq!(key, "1");

        let mut dup = binding("c");
        dup.key = Some("1".into());
        let err = set.append(dup, &factory, &wiring(), false).unwrap_err();
        assert_eq!(err.code(), 201);
    }

    #[tokio::test]
    async fn appended_while_running_stays_inert_until_activation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls.clone(), None);
        let set = OutletSet::from_bindings(&[binding("a")], &factory, &wiring()).unwrap();

        set.append(binding("b"), &factory, &wiring(), true).unwrap();
        set.post(&Task::new("t", "i"), &json!([])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        set.activate_pending();
        set.post(&Task::new("t", "i"), &json!([])).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn remove_missing_key_is_not_found() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(calls, None);
        let set = OutletSet::from_bindings(&[binding("a")], &factory, &wiring()).unwrap();

        set.remove("0").unwrap();
        let err = set.remove("0").unwrap_err();
        assert_eq!(err.code(), 113);
        assert!(set.list().is_empty());
    }

    #[test]
    fn unknown_kind_fails_closed() {
        let factory = OutletFactory::new();
        let err = factory.build(&binding("nats"), &wiring()).unwrap_err();
        assert_eq!(err.code(), 200);
    }
}
