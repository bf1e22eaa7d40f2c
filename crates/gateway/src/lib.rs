//! HTTP API gateway for fastrag.
//!
//! Exposes the health check and the v1 API (turns, streamed turns,
//! conversation history and note CRUD). Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use fastrag_config::{AppConfig, GatewayConfig};
use fastrag_core::error::StoreError;
use fastrag_core::provider::Provider;
use fastrag_core::store::{HistoryStore, NoteStore};
use fastrag_memory::{
    EmbeddingIndex, InMemoryHistoryStore, InMemoryNoteStore, NoteIndexer, SqliteStore,
};
use fastrag_rag::ConversationOrchestrator;

/// Request bodies above this size are rejected with 413.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The pipeline wired from configuration: stores, index and orchestrator.
///
/// Building it resyncs the index with every stored note and spawns the
/// indexer that follows note changes from then on.
pub struct Services {
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub history: Arc<dyn HistoryStore>,
    pub notes: Arc<dyn NoteStore>,
    pub index: Arc<EmbeddingIndex>,
}

impl Services {
    /// Wire everything, building the provider (with retries) from `config`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let provider = fastrag_providers::build_with_retry(&config.provider, &config.retry)?;
        Self::with_provider(config, provider).await
    }

    /// Wire everything around an already constructed provider.
    pub async fn with_provider(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let (history, notes) = open_stores(config).await?;
        let embedder = fastrag_providers::build_embedder(&config.embedding)?;
        let index = Arc::new(EmbeddingIndex::new(embedder));

        // Subscribe before the resync so no change slips between the two.
        let indexer = NoteIndexer::new(index.clone(), notes.clone());
        let events = notes.subscribe();
        let report = indexer.resync_all().await?;
        info!(
            indexed = report.indexed,
            reused = report.reused,
            "Note index ready"
        );
        tokio::spawn(async move { indexer.run(events).await });

        let factory = Arc::new(fastrag_providers::RouterFactory::new(config.retry.clone()));
        let orchestrator = Arc::new(
            ConversationOrchestrator::from_config(config, provider, index.clone(), history.clone())
                .with_provider_factory(factory),
        );

        Ok(Self {
            orchestrator,
            history,
            notes,
            index,
        })
    }

    /// State for the v1 API.
    pub fn api_state(&self, gateway: &GatewayConfig) -> api_v1::SharedApiState {
        Arc::new(api_v1::ApiV1State {
            orchestrator: self.orchestrator.clone(),
            history: self.history.clone(),
            notes: self.notes.clone(),
            turn_timeout: gateway.turn_timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Open the history and note stores named by `config.storage`.
pub async fn open_stores(
    config: &AppConfig,
) -> Result<(Arc<dyn HistoryStore>, Arc<dyn NoteStore>), StoreError> {
    match config.storage.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage");
            Ok((
                Arc::new(InMemoryHistoryStore::new()),
                Arc::new(InMemoryNoteStore::new()),
            ))
        }
        _ => {
            let store = Arc::new(SqliteStore::new(&config.storage.database_url).await?);
            info!(url = %config.storage.database_url, "Using SQLite storage");
            Ok((
                store.clone() as Arc<dyn HistoryStore>,
                store as Arc<dyn NoteStore>,
            ))
        }
    }
}

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS restricted to the configured origins
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(state: api_v1::SharedApiState, gateway: &GatewayConfig) -> Router {
    let origins: Vec<HeaderValue> = gateway
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let services = Services::from_config(&config).await?;
    let app = build_router(services.api_state(&config.gateway), &config.gateway);

    info!(
        addr = %addr,
        provider = %services.orchestrator.provider_name(),
        model = %config.provider.model_name,
        "Gateway starting"
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
