use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::models::chat::{IngestRequest, IngestResponse, StatsResponse};
use crate::state::AppState;
use crate::utils::error::EngineError;

/// POST /api/documents — index a document's extracted text.
pub async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, EngineError> {
    info!("Ingest request for doc {} ({})", req.doc_id, req.title);

    let report = state
        .rag
        .ingest_document(req.doc_id, &req.title, &req.text)
        .await?;

    Ok(Json(IngestResponse {
        doc_id: report.doc_id,
        chunks: report.chunks,
        dimension: report.dimension,
    }))
}

/// DELETE /api/documents/{doc_id}
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<i64>,
) -> Result<Json<Value>, EngineError> {
    let removed = state.rag.remove_document(doc_id)?;
    info!("Removed doc {} ({} chunks)", doc_id, removed);

    Ok(Json(json!({
        "doc_id": doc_id,
        "chunks_removed": removed,
    })))
}

/// GET /api/stats
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.rag.stats();
    Json(StatsResponse {
        total_vectors: stats.total_vectors,
        embedding_dimension: stats.embedding_dimension,
        embedding_model: stats.embedding_model,
    })
}
