use std::pin::Pin;
use std::time::Duration;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::utils::error::{EngineError, Result};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const GENERATE_TIMEOUT: Duration = Duration::from_secs(60);
const CHAT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: RequestOptions,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: RequestOptions,
}

#[derive(Debug, Serialize)]
struct RequestOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateFrame {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatFrame {
    #[serde(default)]
    message: Option<ChatFrameMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatFrameMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// Lazy sequence of answer deltas, closed by the producer on `done` or error.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Client for the LLM backend (Ollama wire format): `/api/tags` for
/// liveness, `/api/generate` and `/api/chat` for completion, both blocking
/// and as newline-delimited JSON streams.
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            // No client-wide timeout: streamed bodies outlive any fixed
            // deadline. Per-request timeouts are set on the blocking calls.
            client: Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            endpoint
        )
    }

    /// Liveness probe against `/api/tags`.
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(self.api_url("tags"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("LLM liveness check failed: {}", e);
                false
            }
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.api_url("tags"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response).await?;

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("invalid response: {}", e)))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Blocking completion against `/api/generate`.
    pub async fn generate(&self, prompt: &str, system: Option<&str>) -> Result<String> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            system,
            stream: false,
            options: self.options(),
        };

        let response = self
            .client
            .post(self.api_url("generate"))
            .timeout(GENERATE_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response).await?;

        let frame: GenerateFrame = response
            .json()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("invalid response: {}", e)))?;
        Ok(frame.response.unwrap_or_default())
    }

    /// Streaming completion against `/api/generate`; yields deltas until the
    /// backend sends `done=true`.
    pub async fn generate_stream(&self, prompt: &str, system: Option<&str>) -> Result<DeltaStream> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            system,
            stream: true,
            options: self.options(),
        };

        debug!("Starting generate stream ({} chars prompt)", prompt.len());

        let response = self
            .client
            .post(self.api_url("generate"))
            .json(&request)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response).await?;

        Ok(frame_stream(response, parse_generate_frame))
    }

    /// Blocking chat completion against `/api/chat`.
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: false,
            options: self.options(),
        };

        let response = self
            .client
            .post(self.api_url("chat"))
            .timeout(CHAT_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response).await?;

        let frame: ChatFrame = response
            .json()
            .await
            .map_err(|e| EngineError::UpstreamUnavailable(format!("invalid response: {}", e)))?;
        Ok(frame.message.map(|m| m.content).unwrap_or_default())
    }

    /// Streaming chat completion against `/api/chat`.
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<DeltaStream> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            options: self.options(),
        };

        let response = self
            .client
            .post(self.api_url("chat"))
            .json(&request)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_status(response).await?;

        Ok(frame_stream(response, parse_chat_frame))
    }

    fn options(&self) -> RequestOptions {
        RequestOptions {
            temperature: self.config.temperature,
            num_predict: self.config.max_tokens,
        }
    }
}

fn upstream_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::UpstreamUnavailable("request timed out".to_string())
    } else {
        EngineError::UpstreamUnavailable(format!("request failed: {}", e))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    warn!("LLM API error ({}): {}", status, body);
    Err(EngineError::UpstreamUnavailable(format!(
        "LLM API error ({}): {}",
        status, body
    )))
}

/// Parse an NDJSON body into deltas. Malformed lines are skipped; the stream
/// ends at the `done=true` frame or when the body closes.
fn frame_stream(
    response: reqwest::Response,
    parse: fn(&str) -> Option<(Option<String>, bool)>,
) -> DeltaStream {
    Box::pin(try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer = String::new();

        'read: while let Some(chunk) = body.next().await {
            let chunk = chunk
                .map_err(|e| EngineError::UpstreamUnavailable(format!("stream error: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some((delta, done)) = parse(line) {
                    if let Some(delta) = delta {
                        if !delta.is_empty() {
                            yield delta;
                        }
                    }
                    if done {
                        break 'read;
                    }
                }
            }
        }
    })
}

fn parse_generate_frame(line: &str) -> Option<(Option<String>, bool)> {
    let frame: GenerateFrame = serde_json::from_str(line).ok()?;
    Some((frame.response, frame.done))
}

fn parse_chat_frame(line: &str) -> Option<(Option<String>, bool)> {
    let frame: ChatFrame = serde_json::from_str(line).ok()?;
    Some((frame.message.map(|m| m.content), frame.done))
}
