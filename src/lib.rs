//! RustRead - a small ActivityPub federation node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inboxes, collections)      │
//! │  - WebFinger, health, metrics                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Signature verification and signing                       │
//! │  - Inbox dispatch and detached tasks                        │
//! │  - Actor directory, WebFinger, outbox import                │
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
//! - `federation`: ActivityPub federation handling
//! - `data`: Database layer
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

/// Maximum accepted inbound request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; every field is a shared handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    pub directory: Arc<federation::ActorDirectory>,
    pub webfinger: Arc<federation::WebFingerResolver>,
    pub verifier: Arc<federation::SignatureVerifier>,

    /// Detached task queue
    pub tasks: federation::TaskQueue,

    pub dispatcher: Arc<federation::InboxDispatcher>,
    pub follower: Arc<federation::FollowInitiator>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database (runs migrations)
    /// 2. Build the outbound HTTP client
    /// 3. Wire federation services
    /// 4. Start the detached task queue
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Initialize HTTP client
        let client = Arc::new(federation::FederationClient::new(
            &config.user_agent(),
            config.federation.request_timeout(),
        )?);

        // 3. Federation services
        let directory = Arc::new(federation::ActorDirectory::new(
            db.clone(),
            client.clone(),
            config.server.clone(),
            config.federation.key_bits,
        ));
        let webfinger = Arc::new(federation::WebFingerResolver::new(
            db.clone(),
            client.clone(),
            config.server.clone(),
            config.federation.remote_scheme.clone(),
        ));
        let verifier = Arc::new(federation::SignatureVerifier::new(
            db.clone(),
            config.federation.signature_max_age_secs,
        ));
        let delivery = federation::ActivityDelivery::new(client.clone());
        let importer = Arc::new(federation::PostImporter::new(db.clone(), client.clone()));

        // 4. Task queue
        let executor = federation::TaskExecutor::new(
            db.clone(),
            directory.clone(),
            delivery.clone(),
            importer,
        );
        let tasks = federation::TaskQueue::start(
            executor,
            config.federation.queue_capacity,
            config.federation.max_concurrent_tasks,
            config.federation.settle_delay(),
        );

        let dispatcher = Arc::new(federation::InboxDispatcher::new(
            db.clone(),
            directory.clone(),
            tasks.clone(),
        ));
        let follower = Arc::new(federation::FollowInitiator::new(
            db.clone(),
            webfinger.clone(),
            directory.clone(),
            delivery,
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            directory,
            webfinger,
            verifier,
            tasks,
            dispatcher,
            follower,
        })
    }
}

/// Build the Axum router with all routes.
///
/// Shared by the binary and integration tests.
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
