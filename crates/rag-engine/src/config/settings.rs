use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub vector_db: VectorDbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingsConfig {
    /// Embedding model identifier; determines the vector dimension.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Passages per encode window.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_tokens")]
    pub min_tokens: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Suffix overlap as a fraction of the flushed chunk's tokens.
    #[serde(default = "default_overlap_percent")]
    pub overlap_percent: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorDbConfig {
    #[serde(default = "default_persist_directory")]
    pub persist_directory: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_min_tokens() -> usize {
    500
}

fn default_max_tokens() -> usize {
    800
}

fn default_overlap_percent() -> f32 {
    0.15
}

fn default_max_context_tokens() -> usize {
    4000
}

fn default_persist_directory() -> String {
    "data/vector_store".to_string()
}

fn default_llm_model() -> String {
    "phi3:mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_llm_max_tokens() -> u32 {
    2048
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            base_url: default_base_url(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_tokens: default_min_tokens(),
            max_tokens: default_max_tokens(),
            overlap_percent: default_overlap_percent(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            persist_directory: default_persist_directory(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_llm_model(),
            temperature: default_temperature(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.chunking.min_tokens, 500);
        assert_eq!(settings.chunking.max_tokens, 800);
        assert!((settings.chunking.overlap_percent - 0.15).abs() < f32::EPSILON);
        assert_eq!(settings.retrieval.max_context_tokens, 4000);
        assert_eq!(settings.embeddings.batch_size, 32);
        assert_eq!(settings.llm.base_url, "http://localhost:11434");
    }
}
