pub mod chat;
pub mod chunk;

pub use chat::{IngestRequest, IngestResponse, QueryRequest, QueryResponse, StatsResponse};
pub use chunk::{ChunkMetadata, ChunkType, Citation, RetrievedChunk};
