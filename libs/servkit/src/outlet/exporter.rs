//! HTTP exporter outlet. Summarizes a detection-style result into the
//! upstream collector schema and posts it as JSON.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::Outlet;
use crate::error::ServingError;
use crate::task::Task;

const MSG_TYPE: u32 = 3001;

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExporterConfig {
    /// Collector endpoint, overridable per task via `extra.url`.
    #[serde(default)]
    url: Option<String>,
    /// Class names the counters report on.
    #[serde(default)]
    classes: Vec<String>,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

pub struct SyncExporterOutlet {
    client: reqwest::Client,
    url: Option<String>,
    classes: Vec<String>,
}

impl SyncExporterOutlet {
    pub fn new(configs: &Value) -> Result<Self, ServingError> {
        let config: ExporterConfig = super::parse_configs(configs, "syncexporter")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServingError::Other(anyhow::anyhow!("exporter client: {e}")))?;
        Ok(Self {
            client,
            url: config.url,
            classes: config.classes,
        })
    }

    /// Fold detection rows `[name, similarity, x0, y0, x1, y1]` into the
    /// collector payload.
    fn payload(&self, task: &Task, detections: &[Value]) -> Result<Value, ServingError> {
        let mut counts = Map::new();
        for class in &self.classes {
            counts.insert(class.clone(), json!(0));
        }
        for row in detections {
            let name = row
                .get(0)
                .and_then(Value::as_str)
                .ok_or_else(|| ServingError::InvalidLabels(": detection without a label".into()))?;
            let slot = counts.get_mut(name).ok_or_else(|| {
                ServingError::InvalidLabels(format!(": unknown class '{name}'"))
            })?;
            let n = slot.as_i64().unwrap_or(0);
            *slot = json!(n + 1);
        }
        let img_id = task
            .extra
            .get("ImgID")
            .cloned()
            .unwrap_or_else(|| json!(task.image_id));
        Ok(json!({
            "MsgType": MSG_TYPE,
            "ImgID": img_id,
            "DetectAction": if detections.is_empty() { 0 } else { 1 },
            "Result": Value::Object(counts),
            "Pos": detections,
        }))
    }
}

#[async_trait::async_trait]
impl Outlet for SyncExporterOutlet {
    fn kind(&self) -> &'static str {
        "syncexporter"
    }

    async fn post_result(&self, task: &Task, data: &str) -> Result<(), ServingError> {
        let parsed: Value = serde_json::from_str(data)
            .map_err(|e| ServingError::InvalidLabels(format!(": exporter result: {e}")))?;
        let detections = parsed
            .as_array()
            .ok_or_else(|| ServingError::InvalidLabels(": exporter expects a detection list".into()))?;
        let payload = self.payload(task, detections)?;

        let url = task
            .extra
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.url.clone())
            .ok_or_else(|| {
                ServingError::Validation(": no exporter url for task and none configured".into())
            })?;

        self.client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ServingError::Other(anyhow::anyhow!("exporter post {url}: {e}")))?;
        Ok(())
    }
}
