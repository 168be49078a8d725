//! Redis key/value outlet. Writes each result under its task id, with
//! optional not-exists and expiry semantics.

use redis::aio::MultiplexedConnection;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::Outlet;
use crate::error::ServingError;
use crate::task::Task;

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    6379
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RedisConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    db: u8,
    #[serde(default)]
    password: Option<String>,
    /// SET NX: keep the first result written for a task id.
    #[serde(default = "default_true")]
    nx: bool,
    /// Expiry in milliseconds, unset keys live forever.
    #[serde(default)]
    px: Option<u64>,
}

#[derive(Debug)]
pub struct RedisOutlet {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    nx: bool,
    px: Option<u64>,
}

impl RedisOutlet {
    /// Parse the target and build the client. The connection itself is
    /// established lazily on first delivery.
    pub fn connect(configs: &Value) -> Result<Self, ServingError> {
        let config: RedisConfig = super::parse_configs(configs, "redis")?;
        let auth = config
            .password
            .map(|p| format!(":{p}@"))
            .unwrap_or_default();
        let url = format!("redis://{}{}:{}/{}", auth, config.host, config.port, config.db);
        let client = redis::Client::open(url)
            .map_err(|e| ServingError::Validation(format!(": redis outlet target: {e}")))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            nx: config.nx,
            px: config.px,
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, ServingError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| ServingError::Other(anyhow::anyhow!("redis connect: {e}")))?;
        debug!("redis outlet connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait::async_trait]
impl Outlet for RedisOutlet {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn post_result(&self, task: &Task, data: &str) -> Result<(), ServingError> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&task.task_id).arg(data);
        if self.nx {
            cmd.arg("NX");
        }
        if let Some(px) = self.px {
            cmd.arg("PX").arg(px);
        }
        let outcome: redis::RedisResult<()> = cmd.query_async(&mut conn).await;
        match outcome {
            Ok(()) => Ok(()),
            Err(err) => {
                // Stale connections redial on the next delivery.
                *self.connection.lock().await = None;
                Err(ServingError::Other(anyhow::anyhow!(
                    "redis set {}: {err}",
                    task.task_id
                )))
            }
        }
    }
}
