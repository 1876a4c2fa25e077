use anyhow::{Context, Result};
use cryptosync_engine::config::ConfigManager;
use cryptosync_engine::credentials::CredentialStore;
use cryptosync_engine::logging::{self, LogConfig};
use cryptosync_engine::{api_client::ApiClient, state::StateDb, Coordinator};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init_logging(LogConfig::default()).context("failed to initialize logging")?;

    tracing::info!(target: "main", "starting cryptosync sync engine");

    let config_manager = ConfigManager::init().context("failed to load configuration")?;
    let config = config_manager.get_config();

    if !config.is_registered() {
        anyhow::bail!("this machine is not registered; run the setup wizard before starting the engine");
    }

    let config_dir = config
        .sync_folder
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".cryptosync"));

    let password = read_password_from_env().context("no unlock password available")?;
    let credentials = CredentialStore::load(&config_dir, password.as_bytes())
        .context("failed to unlock credential store")?;

    let api = Arc::new(ApiClient::new(&config).context("failed to build API client")?);
    let state_db = Arc::new(StateDb::new(&config_dir).context("failed to open local state database")?);

    let (coordinator, handle) = Coordinator::new(api, state_db, *credentials.data_key(), config.clone(), config.machine_name.clone());

    let run_handle = tokio::spawn(coordinator.run());

    wait_for_shutdown_signal().await;
    tracing::info!(target: "main", "shutdown signal received, stopping coordinator");
    handle.request_shutdown();

    if let Err(err) = run_handle.await {
        tracing::error!(target: "main", %err, "coordinator task panicked");
    }

    tracing::info!(target: "main", "cryptosync sync engine stopped");
    Ok(())
}

fn read_password_from_env() -> Result<String> {
    std::env::var("CRYPTOSYNC_PASSWORD").context("CRYPTOSYNC_PASSWORD environment variable not set")
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(target: "main", "received Ctrl+C"),
        _ = terminate => tracing::info!(target: "main", "received SIGTERM"),
    }
}
