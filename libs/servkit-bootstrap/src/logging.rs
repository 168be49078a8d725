//! Tracing subscriber setup for the server binary.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, then `-v`/`-vv` verbosity, then the
/// configured base level.
fn build_filter(config: &LoggingConfig, verbosity: u8) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = match verbosity {
        0 => config.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    EnvFilter::new(level)
}

/// Install the global subscriber. Errors if one is already set.
pub fn init_logging(config: &LoggingConfig, verbosity: u8) -> Result<()> {
    let filter = build_filter(config, verbosity);
    if config.json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to install tracing subscriber")?;
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to install tracing subscriber")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_escalates_the_level() {
        let config = LoggingConfig {
            level: "warn".into(),
            json: false,
        };
        assert_eq!(build_filter(&config, 0).to_string(), "warn");
        assert_eq!(build_filter(&config, 1).to_string(), "debug");
        assert_eq!(build_filter(&config, 2).to_string(), "trace");
    }
}
