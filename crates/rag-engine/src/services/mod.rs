pub mod context_assembler;
pub mod embedding_service;
pub mod llm_service;
pub mod query_processor;
pub mod rag_service;
pub mod session_memory;

pub use context_assembler::{AssembledContext, ContextAssembler};
pub use embedding_service::EmbeddingService;
pub use llm_service::{ChatMessage, DeltaStream, LlmService};
pub use query_processor::{ProcessedQuery, QueryIntent, QueryProcessor};
pub use rag_service::{IngestReport, RagAnswer, RagService};
pub use session_memory::{SessionContext, SessionMemory};
