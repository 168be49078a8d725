//! MQTT publisher outlet. Keeps one client per backend; the event loop
//! runs on a background task and reconnects on its own.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, EventLoop, MqttOptions, QoS};
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::Outlet;
use crate::error::ServingError;
use crate::task::Task;

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MqttConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_keepalive")]
    keepalive_secs: u64,
    #[serde(default)]
    qos: u8,
    /// Publish each result under its task id; otherwise a fixed topic is
    /// required and the payload carries the task id.
    #[serde(default = "default_true")]
    key_as_topic: bool,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug)]
pub struct MqttOutlet {
    client: AsyncClient,
    qos: QoS,
    key_as_topic: bool,
    topic: String,
    /// Stops the event-loop task when the outlet is dropped.
    stop: CancellationToken,
}

impl Drop for MqttOutlet {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn spawn_event_loop(mut event_loop: EventLoop, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                polled = event_loop.poll() => {
                    match polled {
                        Ok(_) => {}
                        // Every client handle is gone, nothing left to send.
                        Err(ConnectionError::RequestsDone) => break,
                        Err(err) => {
                            warn!(error = %err, "mqtt event loop error, retrying");
                            tokio::select! {
                                _ = stop.cancelled() => break,
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
        }
    })
}

impl MqttOutlet {
    /// Build the client and start its event loop. Must be called from
    /// within a tokio runtime.
    pub fn connect(configs: &Value) -> Result<Self, ServingError> {
        let config: MqttConfig = super::parse_configs(configs, "mosquitto")?;
        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                return Err(ServingError::Validation(format!(
                    ": mqtt qos must be 0, 1 or 2, got {other}"
                )))
            }
        };
        if !config.key_as_topic && config.topic.is_empty() {
            return Err(ServingError::Validation(
                ": mqtt topic is required when key_as_topic is off".into(),
            ));
        }

        let client_id = format!("inferd-{}", uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        if let (Some(user), Some(pass)) = (config.username, config.password) {
            options.set_credentials(user, pass);
        }

        let (client, event_loop) = AsyncClient::new(options, 16);
        let stop = CancellationToken::new();
        spawn_event_loop(event_loop, stop.clone());

        Ok(Self {
            client,
            qos,
            key_as_topic: config.key_as_topic,
            topic: config.topic,
            stop,
        })
    }
}

#[async_trait::async_trait]
impl Outlet for MqttOutlet {
    fn kind(&self) -> &'static str {
        "mosquitto"
    }

    async fn post_result(&self, task: &Task, data: &str) -> Result<(), ServingError> {
        let (topic, payload) = if self.key_as_topic {
            (task.task_id.as_str(), data.to_owned())
        } else {
            (self.topic.as_str(), format!("{}:{}", task.task_id, data))
        };
        self.client
            .publish(topic, self.qos, false, payload.into_bytes())
            .await
            .map_err(|e| ServingError::Other(anyhow::anyhow!("mqtt publish: {e}")))
    }
}
