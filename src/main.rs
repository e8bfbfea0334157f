use anyhow::{Context, Result};
use log::{error, info, warn};
use std::env;
use std::sync::Arc;

use chatwarden::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    info!("Starting chatwarden v{}", chatwarden::VERSION);

    let config_dir = env::var("CHATWARDEN_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
    let config_manager = Arc::new(ConfigurationManager::new(&config_dir));
    if let Err(e) = config_manager.initialize().await {
        error!(
            "Failed to initialize configuration from {}: {}",
            config_manager.config_dir().display(),
            e
        );
        return Err(e);
    }

    let mut config = config_manager.get_bot_config().await;
    config.apply_env_overrides()?;
    if config.bot_user_id == 0 {
        warn!("bot_user_id is not configured; the bot account is not protected from warns");
    }

    let backend = Arc::new(
        FileDocumentStore::open(&config.data_dir)
            .await
            .with_context(|| format!("Failed to open data directory {}", config.data_dir.display()))?,
    );
    let store = Arc::new(ModerationStore::open(backend).await?);

    let platform = Arc::new(ConsolePlatform::new());
    platform.connect().await?;
    let events = platform
        .get_event_receiver()
        .context("Platform did not provide an event receiver")?;

    let gate = Arc::new(ModerationGate::new(&config, Arc::clone(&store), platform.clone())?);

    // Apply configuration changes as they are hot-reloaded
    {
        let gate = Arc::clone(&gate);
        let config_manager = Arc::clone(&config_manager);
        let mut changes = config_manager.subscribe_to_changes();
        tokio::spawn(async move {
            while let Ok(event) = changes.recv().await {
                match event {
                    ConfigChangeEvent::BotConfigUpdated { file } => {
                        let mut config = config_manager.get_bot_config().await;
                        if let Err(e) = config.apply_env_overrides() {
                            error!("Ignoring reloaded {}: {}", file, e);
                            continue;
                        }
                        if let Err(e) = gate.reload(&config).await {
                            error!("Failed to apply reloaded {}: {}", file, e);
                        }
                    }
                    ConfigChangeEvent::ValidationError { file, error } => {
                        warn!("Configuration {} rejected: {}", file, error);
                    }
                    ConfigChangeEvent::ReloadComplete { .. } => {}
                }
            }
        });
    }

    info!("chatwarden is running on the {} platform. Press Ctrl+C to stop.", platform.platform_name());

    tokio::select! {
        _ = gate.run(events) => {
            info!("Event stream ended");
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    if let Err(e) = platform.disconnect().await {
        error!("Error disconnecting platform: {}", e);
    }
    store.shutdown().await;

    info!("chatwarden stopped");
    Ok(())
}
