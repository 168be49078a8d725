//! Layered server configuration: built-in defaults, then a YAML file,
//! then `INFERD__`-prefixed environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use servkit::config::{BackendConfig, BackendDefaults, Limits, PoolTiming};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: BackendDefaults,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub timing: PoolTiming,
    /// Logging configuration; env-filter directives win over `level`.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Backends created (and started) at boot.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: BackendDefaults::default(),
            limits: Limits::default(),
            timing: PoolTiming::default(),
            logging: LoggingConfig::default(),
            backends: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Base level when `RUST_LOG` is unset: "trace" .. "error" or "off".
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load with layering: defaults, then the YAML file, then environment.
    ///
    /// Example: `INFERD__LIMITS__MAX_BACKEND_COUNT=4` maps to
    /// `limits.max_backend_count`.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let config: AppConfig = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(config_path.as_ref()))
            .merge(Env::prefixed("INFERD__").split("__"))
            .extract()
            .with_context(|| {
                format!(
                    "failed to load config from {}",
                    config_path.as_ref().display()
                )
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file or fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        self.timing
            .validate()
            .map_err(|e| anyhow::anyhow!("timing: {e}"))?;
        Ok(())
    }

    /// Serialize configuration to YAML for `--print-config`.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize config to YAML")
    }
}
