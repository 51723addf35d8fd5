//! Fedigroup server entry point

use fedigroup::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired remote profiles are dropped from the cache
const CACHE_PRUNE_INTERVAL_SECS: u64 = 300;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background tasks (profile cache pruning)
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDIGROUP__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedigroup=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "fedigroup=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Fedigroup...");

    // 2. Initialize metrics
    fedigroup::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = fedigroup::build_router(state.clone());

    // 6. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    // 7. Start background tasks
    spawn_cache_prune_task(state.clone());

    // Start server
    axum::serve(listener, app).await?;

    Ok(())
}

/// Spawn background task dropping expired remote profiles
fn spawn_cache_prune_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(CACHE_PRUNE_INTERVAL_SECS));

        // Consume the immediate first tick.
        interval.tick().await;

        loop {
            interval.tick().await;
            state.directory.cache().prune_expired().await;
            let cached = state.directory.cache().len().await;
            tracing::debug!(
                cached = cached,
                "Pruned remote profile cache"
            );
        }
    });

    tracing::info!("Profile cache prune task spawned");
}
