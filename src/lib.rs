//! Fedigroup - ActivityPub groups for the fediverse
//!
//! Members follow a group actor; the group boosts what its members post
//! to it, so every member sees the conversation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inboxes, collections)     │
//! │  - WebFinger                                                │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Federation / Service Layer                    │
//! │  - Inbox state machine, signatures                          │
//! │  - Thread resolution, delivery fan-out                      │
//! │  - Group administration                                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Group administration used by the CLI
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use federation::{ActivityRouter, DeliveryFanout, FederationClient, RemoteDirectory};

/// Largest accepted request body (1 MiB)
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// This struct is cloned for each request and contains
/// shared resources like the database pool and federation services.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub client: Arc<dyn FederationClient>,

    /// Remote actor lookups (with profile cache)
    pub directory: Arc<RemoteDirectory>,

    /// Outbound delivery
    pub delivery: DeliveryFanout,

    /// Inbox state machine
    pub inbox: Arc<ActivityRouter>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the outbound HTTP client
    /// 3. Wire the federation services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let db = data::Database::connect(&config.database.path).await?;
        tracing::info!("Database connected");

        let client = federation::ReqwestFederationClient::new(&config.federation)?;

        let state = Self::with_client(Arc::new(config), Arc::new(db), Arc::new(client));
        tracing::info!("Application state initialized successfully");
        Ok(state)
    }

    /// Wire the federation services around an existing database and client
    pub fn with_client(
        config: Arc<config::AppConfig>,
        db: Arc<data::Database>,
        client: Arc<dyn FederationClient>,
    ) -> Self {
        let directory = Arc::new(RemoteDirectory::new(config.clone(), client.clone()));
        let delivery = DeliveryFanout::new(
            config.clone(),
            db.clone(),
            directory.clone(),
            client.clone(),
        );
        let inbox = Arc::new(ActivityRouter::new(
            config.clone(),
            db.clone(),
            directory.clone(),
            delivery.clone(),
        ));

        Self {
            config,
            db,
            client,
            directory,
            delivery,
            inbox,
        }
    }

    /// Group administration service over the same resources
    pub fn group_service(&self) -> service::GroupService {
        service::GroupService::new(
            self.config.clone(),
            self.db.clone(),
            self.directory.clone(),
            self.delivery.clone(),
        )
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
