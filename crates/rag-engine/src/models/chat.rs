use serde::{Deserialize, Serialize};

use crate::models::chunk::Citation;

/// POST /api/query
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub document_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub source_documents: Vec<i64>,
    pub context_tokens: usize,
    pub model: String,
    pub is_follow_up: bool,
}

/// POST /api/documents — ingest a document's already-extracted text.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub doc_id: i64,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub doc_id: i64,
    pub chunks: usize,
    pub dimension: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_vectors: usize,
    pub embedding_dimension: Option<usize>,
    pub embedding_model: String,
}
