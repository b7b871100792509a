use std::sync::Arc;

use onboard_flow::config::ServiceConfig;
use onboard_flow::error::Result;
use onboard_flow::integration::{JiraClient, TicketingClient};
use onboard_flow::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServiceConfig::from_env()?;

    eprintln!("onboard-flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}:{}", config.bind_addr, config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(db_path).await.inspect_err(
        |e| eprintln!("Error: Failed to open database at {}: {}", config.db_path, e),
    )?);
    eprintln!("   Database: {}", config.db_path);

    // ── Ticketing ────────────────────────────────────────────────────────
    let ticketing: Arc<dyn TicketingClient> = Arc::new(JiraClient::new(&config.jira)?);
    match &config.jira.base_url {
        Some(url) => eprintln!("   Jira: {}", url),
        None => eprintln!("   Jira: not configured (automated tasks will fail)"),
    }

    let app = onboard_flow::api::router(db, ticketing);
    let listener = tokio::net::TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    tracing::info!(port = config.port, "HTTP server started");
    axum::serve(listener, app).await?;

    Ok(())
}
