use anyhow::{Context, Result};
use tracing::info;

use crate::config::{MappingConfig, ProxySettings};
use crate::server::ProxyServer;

use super::args::RunArgs;
use super::config::{check_config, expand_path};

/// Execute CLI commands
pub fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Run(args) => {
            run_proxy(args)?;
        }
    }

    Ok(())
}

/// Run the proxy until Ctrl+C
fn run_proxy(args: &RunArgs) -> Result<()> {
    let config_path = expand_path(&args.config)?;

    info!("Loading port mappings from: {}", config_path);
    let mappings = MappingConfig::load(&config_path)
        .and_then(MappingConfig::require_non_empty)
        .with_context(|| format!("Failed to load port mappings from {}", config_path))?;

    let base = match &args.settings {
        Some(path) => {
            let settings_path = expand_path(path)?;
            info!("Loading settings from: {}", settings_path);
            ProxySettings::load(&settings_path)
                .with_context(|| format!("Failed to load settings from {}", settings_path))?
        }
        None => ProxySettings::default(),
    };
    let settings = args.apply(base)?;

    info!(
        "Starting tcproxy v{} with {} mappings",
        env!("CARGO_PKG_VERSION"),
        mappings.len()
    );

    let server = ProxyServer::new(settings);
    server
        .start(mappings.mappings())
        .context("Failed to start proxy")?;

    wait_for_shutdown_signal()?;

    info!("Received shutdown signal");
    server.shutdown()?;

    let stats = server.stats();
    info!(
        "Relay statistics: {}",
        serde_json::to_string(&stats).unwrap_or_default()
    );

    Ok(())
}

/// 阻塞等待 Ctrl+C
fn wait_for_shutdown_signal() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create signal runtime")?;

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to listen for shutdown signal")?;

    Ok(())
}
