use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use servkit::engine::{EchoEngine, EngineFactory};
use servkit::outlet::OutletFactory;
use servkit::registry::{BackendRegistry, RegistrySettings};
use servkit_bootstrap::AppConfig;
use tokio_util::sync::CancellationToken;

/// Inferd - pluggable model-inference serving runtime
#[derive(Parser)]
#[command(name = "inferd-server")]
#[command(about = "Inferd - pluggable model-inference serving runtime")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

fn engine_factory() -> EngineFactory {
    let mut engines = EngineFactory::new();
    engines.register("echo", |_| Ok(Box::new(EchoEngine::default()) as _));
    // Accelerator engines are known type tags but need a native runtime
    // this build does not carry; creating them fails with a clear reason.
    engines.register_unavailable("rknn", "native runtime not built in");
    engines
}

fn build_registry(config: &AppConfig) -> Arc<BackendRegistry> {
    Arc::new(BackendRegistry::new(
        engine_factory(),
        OutletFactory::with_defaults(),
        None,
        RegistrySettings {
            defaults: config.defaults.clone(),
            limits: config.limits.clone(),
            timing: config.timing.clone(),
        },
        CancellationToken::new(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Layered config: defaults -> YAML (if provided) -> env (INFERD__*).
    let config = AppConfig::load_or_default(cli.config.as_deref())?;
    servkit_bootstrap::init_logging(&config.logging, cli.verbose)?;

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(config),
    }
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!("inferd server starting");
    let registry = build_registry(&config);
    tracing::info!(engines = ?registry.supported_engines(), "engines registered");

    // Backends listed in the config are created and started at boot. A
    // failing backend does not take the server down.
    for backend in &config.backends {
        let mut persisted = backend.clone();
        persisted.persist = true;
        let id = match registry.create(persisted) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(model = %backend.model_hash, code = err.code(), error = %err, "backend create failed");
                continue;
            }
        };
        match registry.run(&id).await {
            Ok(_) => tracing::info!(backend = %id, model = %backend.model_hash, "backend started"),
            Err(err) => {
                tracing::error!(backend = %id, code = err.code(), error = %err, "backend start failed");
            }
        }
    }

    let device_lost = registry.shutdown_token();
    tokio::select! {
        result = servkit_bootstrap::wait_for_shutdown() => {
            result?;
        }
        _ = device_lost.cancelled() => {
            tracing::error!("compute device lost, shutting down");
        }
    }

    registry.stop_all().await;
    tracing::info!("inferd server stopped");
    Ok(())
}

fn check_config(config: AppConfig) -> Result<()> {
    let registry = build_registry(&config);
    for backend in &config.backends {
        let mut candidate = backend.clone();
        candidate.fill_defaults(&config.defaults);
        candidate
            .validate(&config.limits)
            .map_err(|e| anyhow::anyhow!("backend {}: {e}", backend.model_hash))?;
        println!("{}  {}", candidate.identity(), backend.model_hash);
    }
    println!(
        "configuration OK ({} backends, engines: {})",
        config.backends.len(),
        registry.supported_engines().join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_factory_serves_echo() {
        let engines = engine_factory();
        assert_eq!(engines.supported(), vec!["echo"]);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["inferd-server", "-vv", "check"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Check)));

        let cli = Cli::parse_from(["inferd-server", "--print-config"]);
        assert!(cli.print_config);
        assert!(cli.command.is_none());
    }
}
