//! `master` binary entry point.
//!
//! Loads the TOML configuration, applies CLI overrides, installs logging
//! and runs either the master server or a spawner until a shutdown signal.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::anyhow;
use cli::{CliArgs, RunMode};
use config::AppConfig;
use master_server::{ClientSession, CommandLauncher, MasterServer, SpawnerController};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = AppConfig::load_from_file(&args.config_path).await?;
    apply_overrides(&mut config, &args);
    config
        .validate()
        .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

    logging::setup_logging(&config.logging)?;
    info!("📂 Config: {}", args.config_path.display());

    match args.mode {
        RunMode::Master => run_master(&config).await,
        RunMode::Spawner => run_spawner(&config).await,
    }
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(bind_address) = &args.bind_address {
        config.master.bind_address = bind_address.clone();
    }
    if let Some(master_address) = &args.master_address {
        config.spawner.master_address = master_address.clone();
    }
    if let Some(region) = &args.region {
        config.spawner.region = region.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

async fn run_master(config: &AppConfig) -> anyhow::Result<()> {
    let master_config = config.to_master_config()?;
    info!("🌟 Starting master server");
    info!("  🌐 Bind address: {}", master_config.bind_address);
    info!(
        "  🎮 Client spawn requests: {}",
        if master_config.enable_client_spawn_requests { "enabled" } else { "disabled" }
    );

    let server = MasterServer::with_default_plugins(master_config).await?;
    info!("🔌 Plugins: {}", server.plugin_names().join(", "));

    let mut serving = tokio::spawn(server.clone().run());
    tokio::select! {
        result = &mut serving => {
            // The accept loop only returns on its own when binding failed.
            result??;
            return Ok(());
        }
        signal = signals::shutdown_signal() => match signal {
            Ok(signal) => info!("📡 Received {}", signal),
            Err(e) => error!("❌ Signal handler failed: {}", e),
        }
    }

    info!("🛑 Shutting down master server");
    server.shutdown();
    serving.await??;
    info!("✅ Master server stopped");
    Ok(())
}

async fn run_spawner(config: &AppConfig) -> anyhow::Result<()> {
    let spawner_config = config.to_spawner_config();
    info!("🌟 Starting spawner");
    info!("  🌐 Master: {}", spawner_config.master_address);
    info!(
        "  🗺️ Region: {}",
        if spawner_config.region.is_empty() { "<none>" } else { &spawner_config.region }
    );
    info!("  🚀 Executable: {}", spawner_config.executable.display());

    let session = ClientSession::tcp(
        spawner_config.master_address.clone(),
        spawner_config.session.clone(),
    );
    let launcher = Arc::new(CommandLauncher::new(
        spawner_config.executable.clone(),
        spawner_config.args.clone(),
    ));
    let controller = SpawnerController::new(session, spawner_config, launcher);
    controller.start().await;

    let signal = signals::shutdown_signal().await?;
    info!("📡 Received {}", signal);

    info!("🛑 Stopping spawner, killing {} processes", controller.running_processes());
    controller.stop().await;
    info!("✅ Spawner stopped");
    Ok(())
}
