use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, Level};

use mendbot_server::config::Config;
use mendbot_server::llm::HttpSolutionModel;
use mendbot_server::store::SqliteStore;
use mendbot_server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting mendbot remediation service");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let db_path = config.state_dir.join("mendbot-state.db");
    info!("Using state database: {}", db_path.display());
    let store = SqliteStore::new(&db_path).expect("Failed to initialize SQLite database");

    let model = HttpSolutionModel::new(
        config.llm_endpoint.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        config.llm_timeout,
        config.llm_max_tokens,
    );

    let port = config.port;
    let state = Arc::new(AppState::new(config, Arc::new(store), Arc::new(model)));
    let app = app_router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server listening on port {}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
