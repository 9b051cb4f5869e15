use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use rag_engine::config::Settings;
use rag_engine::handlers;
use rag_engine::services::{EmbeddingService, LlmService, RagService, SessionMemory};
use rag_engine::state::AppState;
use rag_engine::store::VectorStore;
use rag_engine::utils::tokenizer::TokenCounter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,rag_engine=debug".to_string()),
        )
        .with_target(true)
        .init();

    info!("Starting RAG engine...");

    let settings = Settings::load()?;
    info!("Configuration loaded");

    // Components are built once here and handed to the orchestrator; nothing
    // engine-level lives in a global.
    let tokenizer = Arc::new(TokenCounter::new());
    let embedding = Arc::new(EmbeddingService::new(&settings.embeddings));
    let store = Arc::new(VectorStore::open(&settings.vector_db.persist_directory));
    info!("Vector store holds {} vectors", store.count());

    let llm = Arc::new(LlmService::new(settings.llm.clone()));
    if !llm.is_available().await {
        info!("LLM backend not reachable yet at {}", settings.llm.base_url);
    }

    let session_memory = Arc::new(SessionMemory::new());
    let rag = Arc::new(RagService::new(
        &settings,
        tokenizer,
        embedding,
        store,
        llm.clone(),
        session_memory,
    ));

    let state = Arc::new(AppState {
        settings: settings.clone(),
        rag,
        llm,
    });

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/health/ready", get(handlers::health::readiness_check))
        .route("/api/documents", post(handlers::documents::ingest_handler))
        .route(
            "/api/documents/{doc_id}",
            delete(handlers::documents::delete_handler),
        )
        .route("/api/stats", get(handlers::documents::stats_handler))
        .route("/api/query", post(handlers::query::query_handler))
        .route(
            "/api/query/stream",
            post(handlers::query::query_stream_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
