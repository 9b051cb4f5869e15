use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::models::chunk::{ChunkType, Citation, RetrievedChunk};
use crate::utils::tokenizer::TokenCounter;

/// Jaccard word-overlap ratio above which an incoming chunk is dropped.
const OVERLAP_THRESHOLD: f32 = 0.7;
/// Normalized prefix length used as the exact-duplicate fingerprint.
const FINGERPRINT_LEN: usize = 100;
/// Table chunks may exceed the budget by this factor.
const TABLE_SLACK: f32 = 1.1;
/// Budget share given to newly retrieved chunks on follow-up turns.
const NEW_SHARE: f32 = 0.7;
/// Minimum leftover budget worth spending on previous-turn chunks.
const PREV_MIN_TOKENS: usize = 100;
/// At most this many previous-turn chunks are appended.
const PREV_CHUNK_LIMIT: usize = 3;

const PREVIEW_LEN: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub context_text: String,
    pub chunks_used: usize,
    pub total_tokens: usize,
    pub source_documents: Vec<i64>,
    pub citations: Vec<Citation>,
}

/// Assembles retrieved chunks into a bounded prompt body: deduplicates,
/// orders chunks in document reading order, budgets tokens, and produces
/// numbered citations.
pub struct ContextAssembler {
    pub max_tokens: usize,
    tokenizer: Arc<TokenCounter>,
}

impl ContextAssembler {
    pub fn new(max_tokens: usize, tokenizer: Arc<TokenCounter>) -> Self {
        Self {
            max_tokens,
            tokenizer,
        }
    }

    pub fn assemble(
        &self,
        chunks: &[RetrievedChunk],
        max_tokens: Option<usize>,
    ) -> AssembledContext {
        if chunks.is_empty() {
            return AssembledContext::default();
        }

        let max_tokens = max_tokens.unwrap_or(self.max_tokens);

        let unique = deduplicate(chunks);
        let sorted = sort_logical(unique);

        let mut context_parts = Vec::new();
        let mut used: Vec<RetrievedChunk> = Vec::new();
        let mut current_tokens = 0usize;

        for chunk in sorted {
            let citation_index = used.len() + 1;
            let formatted = format_chunk(&chunk, citation_index);
            let chunk_tokens = self.tokenizer.count(&formatted);

            if current_tokens + chunk_tokens > max_tokens {
                // First rejection halts assembly; an over-budget table still
                // squeezes in within the slack so it is never fragmented.
                if chunk.chunk_type == ChunkType::Table
                    && ((current_tokens + chunk_tokens) as f32)
                        < max_tokens as f32 * TABLE_SLACK
                {
                    context_parts.push(formatted);
                    current_tokens += chunk_tokens;
                    used.push(chunk);
                }
                break;
            }

            context_parts.push(formatted);
            current_tokens += chunk_tokens;
            used.push(chunk);
        }

        debug!(
            "Assembled {} of {} chunks into {} tokens",
            used.len(),
            chunks.len(),
            current_tokens
        );

        AssembledContext {
            context_text: context_parts.join("\n\n---\n\n"),
            chunks_used: used.len(),
            total_tokens: current_tokens,
            source_documents: unique_doc_ids(&used),
            citations: build_citations(&used),
        }
    }

    /// Follow-up assembly: 70% of the budget goes to newly retrieved chunks,
    /// the remainder to up to three previous-turn chunks not already present,
    /// appended under a `[Previous Context]` delimiter.
    pub fn assemble_for_follow_up(
        &self,
        previous_chunks: &[RetrievedChunk],
        new_chunks: &[RetrievedChunk],
        max_tokens: Option<usize>,
    ) -> AssembledContext {
        let max_tokens = max_tokens.unwrap_or(self.max_tokens);
        let new_max = (max_tokens as f32 * NEW_SHARE) as usize;

        let new_context = self.assemble(new_chunks, Some(new_max));

        let remaining = max_tokens.saturating_sub(new_context.total_tokens);
        if remaining > PREV_MIN_TOKENS && !previous_chunks.is_empty() {
            let new_ids: HashSet<i64> = new_chunks.iter().map(|c| c.chunk_id).collect();
            let prev_only: Vec<RetrievedChunk> = previous_chunks
                .iter()
                .filter(|c| !new_ids.contains(&c.chunk_id))
                .take(PREV_CHUNK_LIMIT)
                .cloned()
                .collect();

            let prev_context = self.assemble(&prev_only, Some(remaining));

            if !prev_context.context_text.is_empty() {
                let context_text = format!(
                    "{}\n\n---\n[Previous Context]\n---\n\n{}",
                    new_context.context_text, prev_context.context_text
                );

                let mut source_documents = new_context.source_documents.clone();
                for doc_id in prev_context.source_documents {
                    if !source_documents.contains(&doc_id) {
                        source_documents.push(doc_id);
                    }
                }

                let mut citations = new_context.citations;
                citations.extend(prev_context.citations);

                return AssembledContext {
                    context_text,
                    chunks_used: new_context.chunks_used + prev_context.chunks_used,
                    total_tokens: new_context.total_tokens + prev_context.total_tokens,
                    source_documents,
                    citations,
                };
            }
        }

        new_context
    }
}

/// Normalized fingerprint for exact-duplicate detection: lowercased,
/// whitespace-collapsed, first 100 characters.
fn fingerprint(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(FINGERPRINT_LEN)
        .collect()
}

fn word_overlap(a: &str, b: &str) -> f32 {
    let words_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let words_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();

    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }

    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

fn deduplicate(chunks: &[RetrievedChunk]) -> Vec<RetrievedChunk> {
    let mut seen_fingerprints: HashSet<String> = HashSet::new();
    let mut unique: Vec<RetrievedChunk> = Vec::new();

    for chunk in chunks {
        let fp = fingerprint(&chunk.text);
        if seen_fingerprints.contains(&fp) {
            continue;
        }

        let is_duplicate = unique
            .iter()
            .any(|kept| word_overlap(&chunk.text, &kept.text) >= OVERLAP_THRESHOLD);
        if is_duplicate {
            continue;
        }

        seen_fingerprints.insert(fp);
        unique.push(chunk.clone());
    }

    unique
}

/// Reading order, not score order: the model does better when each document
/// arrives in its natural sequence.
fn sort_logical(mut chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    chunks.sort_by_key(|c| (c.doc_id, c.page_number.unwrap_or(0), c.chunk_index));
    chunks
}

fn format_chunk(chunk: &RetrievedChunk, index: usize) -> String {
    let doc_title = chunk
        .doc_title
        .clone()
        .unwrap_or_else(|| format!("Document {}", chunk.doc_id));

    let mut header_parts = vec![format!("[Source {}]", index)];
    header_parts.push(format!("From: {}", doc_title));
    if let Some(page) = chunk.page_number {
        header_parts.push(format!("Page {}", page));
    }
    if let Some(section) = chunk.section_title.as_deref().filter(|s| !s.is_empty()) {
        header_parts.push(format!("Section: {}", section));
    }

    format!("{}\n{}", header_parts.join(" | "), chunk.text)
}

fn unique_doc_ids(chunks: &[RetrievedChunk]) -> Vec<i64> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .map(|c| c.doc_id)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn build_citations(chunks: &[RetrievedChunk]) -> Vec<Citation> {
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let preview = if chunk.text.chars().count() > PREVIEW_LEN {
                let truncated: String = chunk.text.chars().take(PREVIEW_LEN).collect();
                format!("{}...", truncated)
            } else {
                chunk.text.clone()
            };

            Citation {
                index: i + 1,
                doc_id: chunk.doc_id,
                doc_title: chunk.doc_title.clone(),
                chunk_id: chunk.chunk_id,
                page_number: chunk.page_number,
                section_title: chunk.section_title.clone(),
                preview,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembler(max_tokens: usize) -> ContextAssembler {
        ContextAssembler::new(max_tokens, Arc::new(TokenCounter::estimate()))
    }

    fn chunk(chunk_id: i64, doc_id: i64, text: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id,
            doc_id,
            doc_title: Some(format!("Doc {}", doc_id)),
            text: text.to_string(),
            score: 0.9,
            page_number: None,
            chunk_index: chunk_id as usize,
            chunk_type: ChunkType::Text,
            section_title: None,
        }
    }

    #[test]
    fn test_empty_input() {
        let result = assembler(4000).assemble(&[], None);
        assert_eq!(result.chunks_used, 0);
        assert!(result.context_text.is_empty());
        assert!(result.citations.is_empty());
    }

    #[test]
    fn test_deduplication_collapses_identical_text() {
        let chunks = vec![
            chunk(1, 1, "Same content here"),
            chunk(2, 1, "same   CONTENT here"),
            chunk(3, 1, "Same content here"),
        ];
        let result = assembler(4000).assemble(&chunks, None);
        assert_eq!(result.chunks_used, 1);
    }

    #[test]
    fn test_deduplication_drops_high_overlap() {
        let base = "the model improves retrieval quality across every benchmark we ran";
        let near = "the model improves retrieval quality across every benchmark we measured";
        let other = "completely unrelated passage about chunking strategies and budgets";

        let chunks = vec![chunk(1, 1, base), chunk(2, 1, near), chunk(3, 1, other)];
        let result = assembler(4000).assemble(&chunks, None);
        assert_eq!(result.chunks_used, 2);
    }

    #[test]
    fn test_logical_ordering() {
        let mut c1 = chunk(10, 2, "doc two, page one");
        c1.page_number = Some(1);
        c1.chunk_index = 0;
        let mut c2 = chunk(11, 1, "doc one, page two");
        c2.page_number = Some(2);
        c2.chunk_index = 5;
        let mut c3 = chunk(12, 1, "doc one, page one");
        c3.page_number = Some(1);
        c3.chunk_index = 2;

        let result = assembler(4000).assemble(&[c1, c2, c3], None);
        let text = result.context_text;
        let pos1 = text.find("doc one, page one").unwrap();
        let pos2 = text.find("doc one, page two").unwrap();
        let pos3 = text.find("doc two, page one").unwrap();
        assert!(pos1 < pos2 && pos2 < pos3);
        assert_eq!(result.source_documents, vec![1, 2]);
    }

    #[test]
    fn test_token_budget_halts_assembly() {
        // Each formatted chunk is ~45 estimate tokens; budget fits two.
        let body = "x".repeat(120);
        let chunks: Vec<_> = (0..5).map(|i| chunk(i, 1, &body)).collect();

        let result = assembler(100).assemble(&chunks, None);
        assert!(result.chunks_used < 5);
        assert!(result.chunks_used >= 1);
        assert!(result.total_tokens <= 100);
    }

    #[test]
    fn test_table_chunk_may_exceed_budget_within_slack() {
        let text_body = "y".repeat(280);
        let first = chunk(1, 1, &text_body);

        let table_body = "| a | b |\n".repeat(4);
        let mut table = chunk(2, 1, table_body.trim_end());
        table.chunk_type = ChunkType::Table;

        // First chunk ~80 tokens, table ~15: 80 + 15 > 90 but < 99.
        let result = assembler(90).assemble(&[first, table], None);
        assert_eq!(result.chunks_used, 2);
        assert!(result.total_tokens as f32 <= 90.0 * 1.1);
    }

    #[test]
    fn test_citations_numbered_with_previews() {
        let long_text = "z".repeat(250);
        let chunks = vec![chunk(7, 3, "short passage"), chunk(8, 3, &long_text)];

        let result = assembler(4000).assemble(&chunks, None);
        assert_eq!(result.citations.len(), 2);
        assert_eq!(result.citations[0].index, 1);
        assert_eq!(result.citations[1].index, 2);
        assert_eq!(result.citations[0].preview, "short passage");
        assert!(result.citations[1].preview.ends_with("..."));
        assert_eq!(result.citations[1].preview.chars().count(), 203);

        assert!(result.context_text.contains("[Source 1] | From: Doc 3"));
        assert!(result.context_text.contains("[Source 2]"));
    }

    #[test]
    fn test_header_includes_page_and_section() {
        let mut c = chunk(1, 1, "body text");
        c.page_number = Some(4);
        c.section_title = Some("Methods".to_string());

        let result = assembler(4000).assemble(&[c], None);
        assert!(result
            .context_text
            .contains("[Source 1] | From: Doc 1 | Page 4 | Section: Methods"));
    }

    #[test]
    fn test_follow_up_appends_previous_context() {
        let new_chunks = vec![chunk(1, 1, "fresh retrieval result")];
        let previous = vec![
            chunk(1, 1, "fresh retrieval result"),
            chunk(2, 2, "carried over from the last turn"),
        ];

        let result = assembler(4000).assemble_for_follow_up(&previous, &new_chunks, None);
        assert!(result.context_text.contains("[Previous Context]"));
        assert!(result.context_text.contains("carried over from the last turn"));
        // chunk 1 appears once: already present in the new set.
        assert_eq!(result.chunks_used, 2);
        assert_eq!(result.source_documents, vec![1, 2]);
    }

    #[test]
    fn test_follow_up_skips_previous_when_budget_spent() {
        let body = "w".repeat(790);
        let new_chunks = vec![chunk(1, 1, &body)];
        let previous = vec![chunk(2, 2, "older context")];

        // New chunk consumes ~204 of the 300-token budget; the ~96 left is
        // below the threshold for carrying previous context.
        let result = assembler(300).assemble_for_follow_up(&previous, &new_chunks, None);
        assert!(!result.context_text.contains("[Previous Context]"));
        assert_eq!(result.chunks_used, 1);
    }

    #[test]
    fn test_total_tokens_bounded() {
        let chunks: Vec<_> = (0..20)
            .map(|i| chunk(i, 1, &format!("{} {}", "filler".repeat(30), i)))
            .collect();
        let result = assembler(200).assemble(&chunks, None);
        assert!(result.total_tokens <= 200);
    }
}
