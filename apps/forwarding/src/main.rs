//! SSH local port forwarder.
//!
//! Reads the forwarding configuration, connects to each SSH server and
//! forwards every configured local port through it until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};

use ssh_forwarding::{
    run_management_api, search_config_file, shutdown_channel, Config, RusshConnector,
    SshConnector, Supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    let path = search_config_file(std::env::args_os().nth(1).map(PathBuf::from))?;
    let config = Config::from_file(&path)?;

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    info!("Load config file [{}] success", path.display());

    let connector: Arc<dyn SshConnector> = Arc::new(RusshConnector::new());
    let supervisor = Supervisor::prepare(&config, connector, true).await;
    if supervisor.is_empty() {
        warn!("No effective forwarding config found");
        return Ok(());
    }
    info!("Starting {} forwardings", supervisor.len());

    if let Some(management) = &config.management {
        let registry = supervisor.registry();
        let addr = management.listen.clone();
        tokio::spawn(async move {
            if let Err(e) = run_management_api(registry, &addr).await {
                error!("Management API error: {}", e);
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("Listen for Ctrl-C failed: {}", e),
        }
    });

    let outcomes = supervisor.run(shutdown_rx).await;
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    info!(
        "All forwardings ended: {} stopped, {} failed",
        outcomes.len() - failed,
        failed
    );

    Ok(())
}
