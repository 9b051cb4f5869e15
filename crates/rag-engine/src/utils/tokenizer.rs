use anyhow::Result;
use tiktoken_rs::{cl100k_base, CoreBPE};
use tracing::{info, warn};

/// Token counter with two backends: an exact BPE tokenizer and a cheap
/// character-based estimate. The backend is picked once at startup so counts
/// stay deterministic for the process lifetime.
pub enum TokenCounter {
    Exact(CoreBPE),
    Estimate,
}

impl TokenCounter {
    /// Prefer the exact tokenizer, fall back to estimation if the BPE data
    /// cannot be initialized.
    pub fn new() -> Self {
        match cl100k_base() {
            Ok(bpe) => {
                info!("Token counter: cl100k_base");
                TokenCounter::Exact(bpe)
            }
            Err(e) => {
                warn!("Failed to load cl100k_base, using char estimate: {}", e);
                TokenCounter::Estimate
            }
        }
    }

    pub fn exact() -> Result<Self> {
        Ok(TokenCounter::Exact(cl100k_base()?))
    }

    pub fn estimate() -> Self {
        TokenCounter::Estimate
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Exact(bpe) => bpe.encode_ordinary(text).len(),
            TokenCounter::Estimate => text.len().div_ceil(4),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TokenCounter::Exact(_) => "cl100k_base",
            TokenCounter::Estimate => "char_estimate",
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}
