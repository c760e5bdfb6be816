use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod db;
mod error;
mod exec;
mod llm;
mod narrate;
mod session;
mod translate;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::session::Session;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!(
        "Upstream database service: {}",
        config.upstream.base_url
    );

    // Build the session; missing model credentials degrade rather than fail.
    let session = Arc::new(Session::new(config.clone())?);
    let credentials = session.credentials_status();
    info!(
        "Model credentials configured: {} (region: {})",
        credentials.configured,
        credentials.region.as_deref().unwrap_or("-")
    );

    // Warm the snapshot cache; startup races are absorbed by the
    // introspector's retries and any stragglers refresh on first use.
    info!("Warming schema snapshots");
    let outcome = session.refresh_schemas().await;
    if !outcome.failed.is_empty() {
        error!(
            "Schema warm-up incomplete, will retry on demand: {:?}",
            outcome.failed
        );
    }

    let app_state = Arc::new(AppState::new(Arc::clone(&session)));

    // Start the web server
    info!(
        "Starting patent-nlq server on {}:{}",
        config.web.host, config.web.port
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(std::io::Error::other(e.to_string()).into());
        }
    }

    Ok(())
}
