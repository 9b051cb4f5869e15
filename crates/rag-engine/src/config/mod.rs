mod settings;

pub use settings::{
    ChunkingConfig, EmbeddingsConfig, LlmConfig, RetrievalConfig, ServerConfig, Settings,
    VectorDbConfig,
};
