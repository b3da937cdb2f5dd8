use std::process::ExitCode;
use std::sync::Arc;

use adhikari_backend::{LocalSessionProvider, SqliteStorage};
use adhikari_chat::{ConversationSyncController, SyncConfig};
use snafu::ResultExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod planner;
mod shell;

use config::AppConfig;
use error::{AppResult, ConfigSnafu, OpenStoreSnafu, PlannerSnafu};
use planner::HttpPlanner;

const COMMAND_BUFFER: usize = 32;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = AppConfig::default_config_path();
    let config = match AppConfig::load(&config_path).context(ConfigSnafu) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("adhikari: {error}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.log_filter);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "adhikari stopped");
            eprintln!("adhikari: {error}");
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so the chat on stdout stays readable. `RUST_LOG` wins over the config.
fn init_tracing(log_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(config: AppConfig) -> AppResult<()> {
    let store = SqliteStorage::open(&config.database_location)
        .await
        .context(OpenStoreSnafu {
            stage: "open-chat-store",
        })?;
    let endpoint = config.planner_endpoint().context(ConfigSnafu)?;
    let planner = HttpPlanner::new(endpoint, config.planner_timeout()).context(PlannerSnafu)?;
    let sessions = Arc::new(LocalSessionProvider::with_session_file(config.session_path()));

    tracing::info!(
        database = store.database_url(),
        planner = planner.endpoint(),
        "starting adhikari"
    );

    let (controller, events) = ConversationSyncController::new(
        Arc::new(store),
        sessions.clone(),
        Arc::new(planner),
        SyncConfig {
            store_timeout: config.store_timeout(),
            ..SyncConfig::default()
        },
    );
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    let sync = tokio::spawn(controller.run(commands_rx));

    let outcome = shell::run_shell(sessions, commands_tx, events).await;

    if let Err(error) = sync.await {
        tracing::error!(%error, "chat sync task failed");
    }

    outcome
}
