//! mercury: keeps a supervised event connection alive
//!
//! Connects to the configured endpoint, acknowledges every frame and prints
//! call events as JSON lines until interrupted. Logs go to stderr, or to the
//! file named in `[logging] file`.
//!
//! Usage: `mercury [CONFIG_PATH]`

mod handlers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mercury_core::config::{ConfigError, ACCESS_TOKEN_ENV};
use mercury_core::{
    Config, ConnectionSupervisor, DeviceReregistrationStrategy, StaticTokenProvider,
    SupervisorConfig, WsConnector,
};

use crate::handlers::{PrintingDispatcher, Reconnector};

const DEFAULT_FILTER: &str = "mercury=debug,mercury_core=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config first: it decides where logs go
    let (config, config_error) = match load_config(std::env::args().nth(1)) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    init_tracing(config.logging.file.as_deref())?;

    if let Some(e) = config_error {
        tracing::warn!("Failed to load config: {}, using defaults", e);
    }

    let token = config.access_token().ok_or_else(|| {
        anyhow::anyhow!(
            "no access token: set {} or connection.access_token",
            ACCESS_TOKEN_ENV
        )
    })?;

    let dispatcher = Arc::new(PrintingDispatcher::default());
    let supervisor = ConnectionSupervisor::new(
        Arc::new(WsConnector),
        Arc::new(StaticTokenProvider::new(token)),
        dispatcher.clone(),
    )
    .with_config(SupervisorConfig::from(&config))
    .spawn();

    // Held here for the whole run; the supervisor only keeps a weak reference
    let reconnector: Arc<dyn DeviceReregistrationStrategy> = Arc::new(Reconnector::new(
        supervisor.clone(),
        config.connection.url.clone(),
    ));
    supervisor.set_reregistration_strategy(Arc::downgrade(&reconnector));

    tracing::info!("connecting to {}", config.connection.url);
    supervisor.connect(config.connection.url.clone());

    let mut states = supervisor.subscribe();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!(%state, "connection state");
            }
        }
    }

    tracing::info!(delivered = dispatcher.delivered(), "shutting down");
    supervisor.disconnect();
    supervisor.shutdown();

    // Give the close frame a moment to leave
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}

fn load_config(path: Option<String>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => Config::load_from(Path::new(&path)),
        None => Config::load(),
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&dir)?;

            let file_name = path
                .file_name()
                .ok_or_else(|| {
                    anyhow::anyhow!("log file path has no file name: {}", path.display())
                })?;
            let file_appender = tracing_appender::rolling::never(&dir, file_name);

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(file_appender))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    Ok(())
}
