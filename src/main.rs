use std::path::PathBuf;
use std::sync::Arc;

use beacon_bridge::{logging, Bridge, BridgeConfig, DirectoryBundle, EmbeddedBundle, ResourceBundle};

const CONFIG_ENV: &str = "BEACON_BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/bridge.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    tracing::info!("Beacon bridge runner starting");

    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = BridgeConfig::load(&config_path)?;

    let bundle: Arc<dyn ResourceBundle> = match &config.backend.bundle_dir {
        Some(dir) => Arc::new(DirectoryBundle::new(dir)),
        None => {
            let builtin = EmbeddedBundle::builtin();
            if builtin.is_empty() {
                tracing::warn!("No backend binaries were embedded at build time; set backend.bundle_dir");
            }
            Arc::new(builtin)
        }
    };

    let bridge = Bridge::new(config, bundle)?;
    let port = match bridge.start().await {
        Ok(port) => port,
        Err(e) => {
            tracing::error!("[{}] {}", e.error_code(), e);
            return Err(e.into());
        }
    };
    tracing::info!("Backend ready on port {}", port);

    // 연결 상태 변화 로깅
    let mut states = bridge.subscribe_connection();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!("Connection state: {:?}", state);
        }
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, cleaning up...");
    bridge.shutdown().await?;
    tracing::info!("Beacon bridge runner exiting");
    Ok(())
}
