use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::models::chunk::RetrievedChunk;
use crate::services::query_processor::QueryProcessor;

/// Sessions untouched for this long are swept.
const SESSION_TIMEOUT: Duration = Duration::from_secs(1800);
const MAX_CHUNKS: usize = 10;
const MAX_KEYWORDS: usize = 30;
const MAX_HISTORY: usize = 10;

const FOLLOW_UP_PHRASES: &[&str] = &[
    "explain more",
    "tell me more",
    "elaborate",
    "what about",
    "how about",
    "and what",
    "can you clarify",
    "what do you mean",
    "in other words",
    "simpler",
    "more detail",
    "why is that",
    "how does that",
    "what else",
    "related to that",
    "regarding that",
    "on that note",
    "also",
    "additionally",
    "what's that",
];

static PRONOUN_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"^(it|this|that|these|those|they)\s").unwrap(),
        Regex::new(r"^what (is|are) (it|they|these|those)\b").unwrap(),
        Regex::new(r"^(explain|describe|summarize) (it|this|that)\b").unwrap(),
    ]
});

/// Per-conversation context carried between turns.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub conversation_id: i64,
    pub last_query: String,
    pub last_chunks: Vec<RetrievedChunk>,
    pub query_history: Vec<String>,
    pub topic_keywords: Vec<String>,
    pub last_updated: Instant,
}

impl SessionContext {
    pub fn new(conversation_id: i64) -> Self {
        Self {
            conversation_id,
            last_query: String::new(),
            last_chunks: Vec::new(),
            query_history: Vec::new(),
            topic_keywords: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.last_updated.elapsed() >= SESSION_TIMEOUT
    }

    pub fn update(&mut self, query: &str, chunks: &[RetrievedChunk], keywords: &[String]) {
        self.last_query = query.to_string();
        self.last_chunks = chunks.iter().take(MAX_CHUNKS).cloned().collect();

        self.query_history.push(query.to_string());
        if self.query_history.len() > MAX_HISTORY {
            let excess = self.query_history.len() - MAX_HISTORY;
            self.query_history.drain(..excess);
        }

        merge_keywords(&mut self.topic_keywords, keywords);
        self.last_updated = Instant::now();
    }

    /// Whether a query depends on this session's prior turn: it names a
    /// follow-up phrase, leans on an unresolved pronoun, or shares at least
    /// two keywords with the session topic. Conversational filler is
    /// stripped first so "can you explain it more?" still anchors.
    pub fn is_follow_up(&self, query: &str) -> bool {
        let query_lower = QueryProcessor::clean_query(query).to_lowercase();

        if FOLLOW_UP_PHRASES.iter().any(|p| query_lower.contains(p)) {
            return true;
        }

        if PRONOUN_RES.iter().any(|re| re.is_match(&query_lower)) {
            return true;
        }

        if !self.topic_keywords.is_empty() {
            let query_words: HashSet<&str> = query_lower.split_whitespace().collect();
            let overlap = self
                .topic_keywords
                .iter()
                .filter(|kw| query_words.contains(kw.to_lowercase().as_str()))
                .count();
            if overlap >= 2 {
                return true;
            }
        }

        false
    }
}

/// Most recent `MAX_KEYWORDS` unique keywords survive; a re-seen keyword
/// moves to the back, older ones bump out first.
fn merge_keywords(existing: &mut Vec<String>, incoming: &[String]) {
    for keyword in incoming {
        if let Some(pos) = existing.iter().position(|k| k == keyword) {
            existing.remove(pos);
        }
        existing.push(keyword.clone());
    }
    if existing.len() > MAX_KEYWORDS {
        let excess = existing.len() - MAX_KEYWORDS;
        existing.drain(..excess);
    }
}

/// Conversation-keyed session store enabling follow-up handling. Also owns
/// the per-conversation turn locks the orchestrator uses so turns within one
/// conversation never overlap.
pub struct SessionMemory {
    sessions: DashMap<i64, SessionContext>,
    turn_locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl SessionMemory {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            turn_locks: DashMap::new(),
        }
    }

    /// Get or lazily create the session, sweeping expired ones first.
    pub fn get_session(&self, conversation_id: i64) -> SessionContext {
        self.cleanup_expired();
        self.sessions
            .entry(conversation_id)
            .or_insert_with(|| SessionContext::new(conversation_id))
            .clone()
    }

    /// Insert or replace a session wholesale.
    pub fn set(&self, context: SessionContext) {
        self.sessions.insert(context.conversation_id, context);
    }

    pub fn update(
        &self,
        conversation_id: i64,
        query: &str,
        chunks: &[RetrievedChunk],
        keywords: &[String],
    ) {
        self.cleanup_expired();
        self.sessions
            .entry(conversation_id)
            .or_insert_with(|| SessionContext::new(conversation_id))
            .update(query, chunks, keywords);
        debug!("Updated session {}", conversation_id);
    }

    /// Chunks retrieved for the previous turn, newest first in store order.
    pub fn previous_chunks(&self, conversation_id: i64) -> Vec<RetrievedChunk> {
        self.sessions
            .get(&conversation_id)
            .map(|s| s.last_chunks.clone())
            .unwrap_or_default()
    }

    /// Stable between updates: no session state is touched here.
    pub fn is_follow_up(&self, conversation_id: i64, query: &str) -> bool {
        match self.sessions.get(&conversation_id) {
            Some(session) if !session.last_query.is_empty() => session.is_follow_up(query),
            _ => false,
        }
    }

    pub fn clear_session(&self, conversation_id: i64) {
        self.sessions.remove(&conversation_id);
        self.turn_locks.remove(&conversation_id);
    }

    pub fn cleanup_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired());
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Swept {} expired sessions", removed);
        }
        removed
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Lock serializing turns for one conversation.
    pub fn turn_lock(&self, conversation_id: i64) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for SessionMemory {
    fn default() -> Self {
        Self::new()
    }
}
