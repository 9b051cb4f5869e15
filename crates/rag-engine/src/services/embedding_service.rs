use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::EmbeddingsConfig;
use crate::utils::error::{EngineError, Result};

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Maps text to unit vectors via the embedding backend.
///
/// The vector dimension is detected from the first successful response and
/// fixed for the process lifetime. Query and passage embeddings get
/// model-specific prefixes where the model family expects them.
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    model: String,
    batch_size: usize,
    dimension: OnceCell<usize>,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingsConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            dimension: OnceCell::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Embedding dimension, probing the backend on first use.
    pub async fn dimension(&self) -> Result<usize> {
        if let Some(&dim) = self.dimension.get() {
            return Ok(dim);
        }
        let probe = self.embed_raw("dimension probe").await?;
        Ok(probe.len())
    }

    /// Dimension if already established, without touching the backend.
    pub fn dimension_if_known(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub async fn embed_passage(&self, text: &str) -> Result<Vec<f32>> {
        let input = self.passage_prefixed(text);
        self.embed_raw(&input).await
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = self.query_prefixed(text);
        self.embed_raw(&input).await
    }

    /// Batch-embed passages in windows of `batch_size`, requests inside a
    /// window running concurrently. Fails whole on the first error so no
    /// partial batch is committed downstream.
    pub async fn embed_passages(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        debug!(
            "Embedding {} passages (batch_size={})",
            texts.len(),
            self.batch_size
        );

        let mut all = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.batch_size) {
            let futures: Vec<_> = window.iter().map(|t| self.embed_passage(t)).collect();
            for result in join_all(futures).await {
                all.push(result?);
            }
        }
        Ok(all)
    }

    async fn embed_raw(&self, input: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = EmbedRequest {
            model: &self.model,
            prompt: input,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::EmbeddingUnavailable(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::EmbeddingUnavailable(format!(
                "embedding API error ({}): {}",
                status, body
            )));
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EngineError::EmbeddingUnavailable(format!("invalid response: {}", e)))?;

        if body.embedding.is_empty() {
            return Err(EngineError::EmbeddingUnavailable(
                "backend returned an empty embedding".to_string(),
            ));
        }

        let mut vector = body.embedding;
        normalize(&mut vector);

        let dim = *self.dimension.get_or_init(|| async { vector.len() }).await;
        if vector.len() != dim {
            return Err(EngineError::EmbeddingUnavailable(format!(
                "embedding dimension changed: expected {}, got {}",
                dim,
                vector.len()
            )));
        }

        Ok(vector)
    }

    fn passage_prefixed(&self, text: &str) -> String {
        if self.model.to_lowercase().contains("e5") {
            format!("passage: {}", text)
        } else {
            text.to_string()
        }
    }

    fn query_prefixed(&self, text: &str) -> String {
        let model = self.model.to_lowercase();
        if model.contains("e5") {
            format!("query: {}", text)
        } else if model.contains("bge") {
            format!(
                "Represent this sentence for searching relevant passages: {}",
                text
            )
        } else {
            text.to_string()
        }
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn service(base_url: &str, model: &str) -> EmbeddingService {
        EmbeddingService::new(&EmbeddingsConfig {
            model: model.to_string(),
            base_url: base_url.to_string(),
            batch_size: 2,
        })
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_embed_returns_unit_vector() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [3.0, 4.0]})),
            )
            .mount(&server)
            .await;

        let service = service(&server.uri(), "nomic-embed-text");
        let vector = service.embed_passage("hello world").await.unwrap();

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(service.dimension().await.unwrap(), 2);
        assert_eq!(service.dimension_if_known(), Some(2));
    }

    #[tokio::test]
    async fn test_batch_matches_single_encoding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 2.0, 2.0]})),
            )
            .mount(&server)
            .await;

        let service = service(&server.uri(), "nomic-embed-text");
        let single = service.embed_passage("same text").await.unwrap();
        let batch = service
            .embed_passages(&["same text".to_string(), "same text".to_string(), "same text".to_string()])
            .await
            .unwrap();

        assert_eq!(batch.len(), 3);
        for vector in &batch {
            for (a, b) in vector.iter().zip(single.iter()) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[tokio::test]
    async fn test_query_prefix_for_e5_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_string_contains("query: what is this"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = service(&server.uri(), "e5-small-v2");
        service.embed_query("what is this").await.unwrap();
    }

    #[tokio::test]
    async fn test_passage_prefix_for_e5_models() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_string_contains("passage: some passage"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let service = service(&server.uri(), "e5-small-v2");
        service.embed_passage("some passage").await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let service = service(&server.uri(), "nomic-embed-text");
        let err = service.embed_passage("text").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dimension_change_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_string_contains("first"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_string_contains("second"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [1.0, 0.0, 0.0]})),
            )
            .mount(&server)
            .await;

        let service = service(&server.uri(), "nomic-embed-text");
        service.embed_passage("first").await.unwrap();
        let err = service.embed_passage("second").await.unwrap_err();
        assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    }
}
