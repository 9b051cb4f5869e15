use std::sync::Arc;

use crate::config::Settings;
use crate::services::{LlmService, RagService};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub rag: Arc<RagService>,
    pub llm: Arc<LlmService>,
}
