use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::services::embedding_service::EmbeddingService;
use crate::utils::error::Result;

/// Coarse query intent steering retrieval depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Summary,
    Explain,
    Compare,
    Find,
    List,
    Question,
}

#[derive(Debug, Clone)]
pub struct ProcessedQuery {
    pub original_query: String,
    pub cleaned_query: String,
    pub intent: QueryIntent,
    pub suggested_k: usize,
    pub keywords: Vec<String>,
    pub query_embedding: Option<Vec<f32>>,
}

static FILLER_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)^(hey|hi|hello|please|can you|could you|would you|i want you to)\s*,?\s*")
            .unwrap(),
        Regex::new(r"(?i)^(tell me|help me|i need to|i want to)\s*").unwrap(),
    ]
});

/// Intent patterns, scanned in priority order against the lowercased query.
static INTENT_PATTERNS: Lazy<Vec<(QueryIntent, Vec<Regex>)>> = Lazy::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect::<Vec<_>>()
    };
    vec![
        (
            QueryIntent::Summary,
            compile(&[
                r"^summar",
                r"give me a summary",
                r"brief overview",
                r"main points",
                r"key points",
                r"tldr",
                r"in short",
            ]),
        ),
        (
            QueryIntent::Explain,
            compile(&[
                r"^explain",
                r"^what is",
                r"^what are",
                r"how does",
                r"how do",
                r"clarify",
                r"describe",
                r"meaning of",
            ]),
        ),
        (
            QueryIntent::Compare,
            compile(&[
                r"compare",
                r"difference between",
                r"differences between",
                r"how are .+ different",
                r"versus",
                r" vs ",
                r"contrast",
                r"similarities",
            ]),
        ),
        (
            QueryIntent::Find,
            compile(&[
                r"^find",
                r"^locate",
                r"^where is",
                r"^where are",
                r"show me",
                r"look for",
                r"search for",
            ]),
        ),
        (
            QueryIntent::List,
            compile(&[
                r"^list",
                r"what are all",
                r"enumerate",
                r"give me all",
                r"all the .+ in",
            ]),
        ),
    ]
});

static KEYWORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-zA-Z]{2,}\b").unwrap());

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has",
        "had", "do", "does", "did", "will", "would", "could", "should", "may", "might", "can",
        "this", "that", "these", "those", "i", "you", "he", "she", "it", "we", "they", "what",
        "which", "who", "whom", "where", "when", "why", "how", "all", "each", "every", "both",
        "few", "more", "most", "other", "some", "such", "no", "not", "only", "same", "so",
        "than", "too", "very", "just", "about", "into", "from", "with", "for", "on", "at",
        "by", "to", "of", "in", "and", "or", "but", "me", "my", "myself", "our", "ours",
        "your", "yours",
    ]
    .into_iter()
    .collect()
});

/// Base K by intent, before word-count adjustment.
fn base_k(intent: QueryIntent) -> usize {
    match intent {
        QueryIntent::Summary => 10,
        QueryIntent::Explain => 5,
        QueryIntent::Compare => 8,
        QueryIntent::Find => 3,
        QueryIntent::List => 10,
        QueryIntent::Question => 5,
    }
}

/// Prepares queries for retrieval: cleaning, intent detection, retrieval
/// depth selection, keyword extraction, and (optionally) query embedding.
pub struct QueryProcessor {
    embedding: Arc<EmbeddingService>,
}

impl QueryProcessor {
    pub fn new(embedding: Arc<EmbeddingService>) -> Self {
        Self { embedding }
    }

    /// Collapse whitespace and strip leading conversational filler.
    pub fn clean_query(query: &str) -> String {
        let mut cleaned = query.split_whitespace().collect::<Vec<_>>().join(" ");
        for filler in FILLER_RES.iter() {
            cleaned = filler.replace(&cleaned, "").into_owned();
        }
        cleaned.trim().to_string()
    }

    /// First matching pattern class wins; anything else is a plain question.
    pub fn detect_intent(query: &str) -> QueryIntent {
        let query_lower = query.to_lowercase();
        for (intent, patterns) in INTENT_PATTERNS.iter() {
            if patterns.iter().any(|p| p.is_match(&query_lower)) {
                debug!("Detected intent {:?}", intent);
                return *intent;
            }
        }
        QueryIntent::Question
    }

    /// Alphabetic tokens of length >= 2, lowercased, stopwords dropped,
    /// first-occurrence order, deduplicated.
    pub fn extract_keywords(query: &str) -> Vec<String> {
        let query_lower = query.to_lowercase();
        let mut seen = HashSet::new();
        let mut keywords = Vec::new();
        for m in KEYWORD_RE.find_iter(&query_lower) {
            let word = m.as_str();
            if STOPWORDS.contains(word) {
                continue;
            }
            if seen.insert(word.to_string()) {
                keywords.push(word.to_string());
            }
        }
        keywords
    }

    /// Retrieval depth: base K per intent, nudged by query complexity.
    pub fn determine_k(intent: QueryIntent, query: &str) -> usize {
        let k = base_k(intent);
        let word_count = query.split_whitespace().count();
        if word_count > 20 {
            (k + 3).min(15)
        } else if word_count < 5 {
            k.saturating_sub(2).max(3)
        } else {
            k
        }
    }

    pub async fn process(&self, query: &str, embed: bool) -> Result<ProcessedQuery> {
        let cleaned = Self::clean_query(query);
        let intent = Self::detect_intent(&cleaned);
        let keywords = Self::extract_keywords(&cleaned);
        let suggested_k = Self::determine_k(intent, &cleaned);

        let query_embedding = if embed {
            Some(self.embedding.embed_query(&cleaned).await?)
        } else {
            None
        };

        Ok(ProcessedQuery {
            original_query: query.to_string(),
            cleaned_query: cleaned,
            intent,
            suggested_k,
            keywords,
            query_embedding,
        })
    }
}
