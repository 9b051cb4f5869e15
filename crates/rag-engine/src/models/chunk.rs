use serde::{Deserialize, Serialize};

/// Kind of content a chunk carries. Table chunks hold exactly one complete
/// markdown table and are never split or merged with prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    #[default]
    Text,
    Table,
}

/// Metadata stored alongside each vector in the store.
///
/// `chunk_id` is optional on the way in: when the caller leaves it unset the
/// store assigns the next monotonically increasing id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub doc_id: i64,
    #[serde(default)]
    pub chunk_id: Option<i64>,
    pub chunk_index: usize,
    #[serde(default)]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub chunk_type: ChunkType,
    #[serde(default)]
    pub section_title: Option<String>,
    #[serde(default)]
    pub token_count: usize,
}

/// A chunk as it travels between retrieval, session memory, and assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: i64,
    pub doc_id: i64,
    pub doc_title: Option<String>,
    pub text: String,
    pub score: f32,
    pub page_number: Option<u32>,
    pub chunk_index: usize,
    pub chunk_type: ChunkType,
    pub section_title: Option<String>,
}

/// Ties an answer span back to the retrieved chunk that supports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub index: usize,
    pub doc_id: i64,
    pub doc_title: Option<String>,
    pub chunk_id: i64,
    pub page_number: Option<u32>,
    pub section_title: Option<String>,
    pub preview: String,
}
