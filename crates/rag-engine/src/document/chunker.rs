use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::config::ChunkingConfig;
use crate::models::chunk::ChunkType;
use crate::utils::tokenizer::TokenCounter;

/// GitHub-flavored pipe table: header row, optional separator, one or more
/// body rows.
static TABLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\|[^\n]+\|\n(?:\|[-:| ]+\|\n)?(?:\|[^\n]+\|\n?)+").unwrap()
});

static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap());

static PAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^---\s*Page\s*(\d+)\s*---\s*$").unwrap());

/// Matches a single heading line (anchored, so indented hashes don't count).
static HEADING_LINE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}[ \t]+\S").unwrap());

/// A contiguous passage of a document's text, the atomic unit of retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub page_number: Option<u32>,
    pub chunk_type: ChunkType,
    pub section_title: Option<String>,
    pub token_count: usize,
}

/// A segment between natural boundaries, carrying its byte offset in the
/// original text. Offsets are recorded during the split itself so a repeated
/// segment text can never bind to the wrong position.
struct Segment {
    start: usize,
    text: String,
    is_table: bool,
    tokens: usize,
}

/// Splits document text into token-bounded chunks along natural boundaries
/// (blank-line runs, headings), keeping markdown tables intact as standalone
/// chunks and seeding each new chunk with a suffix overlap of the previous.
pub struct SemanticChunker {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_percent: f32,
    tokenizer: Arc<TokenCounter>,
}

impl SemanticChunker {
    pub fn new(config: &ChunkingConfig, tokenizer: Arc<TokenCounter>) -> Self {
        Self {
            min_tokens: config.min_tokens,
            max_tokens: config.max_tokens,
            overlap_percent: config.overlap_percent,
            tokenizer,
        }
    }

    pub fn with_limits(
        min_tokens: usize,
        max_tokens: usize,
        overlap_percent: f32,
        tokenizer: Arc<TokenCounter>,
    ) -> Self {
        Self {
            min_tokens,
            max_tokens,
            overlap_percent,
            tokenizer,
        }
    }

    /// Split text into semantic chunks. Empty or whitespace-only input yields
    /// an empty list.
    pub fn chunk_text(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let pages = extract_pages(text);
        let headings = extract_headings(text);
        let segments = self.split_segments(text);

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<&Segment> = Vec::new();
        let mut current_tokens = 0usize;

        for segment in &segments {
            // Tables are never split and never share a chunk with prose.
            if segment.is_table {
                if !current.is_empty() {
                    let index = chunks.len();
                    chunks.push(self.build_chunk(
                        &current,
                        current_tokens,
                        ChunkType::Text,
                        index,
                        &pages,
                        &headings,
                    ));
                    current.clear();
                    current_tokens = 0;
                }
                let index = chunks.len();
                chunks.push(self.build_chunk(
                    &[segment],
                    segment.tokens,
                    ChunkType::Table,
                    index,
                    &pages,
                    &headings,
                ));
                continue;
            }

            if current_tokens + segment.tokens > self.max_tokens && !current.is_empty() {
                let index = chunks.len();
                chunks.push(self.build_chunk(
                    &current,
                    current_tokens,
                    ChunkType::Text,
                    index,
                    &pages,
                    &headings,
                ));

                // Seed the next chunk with trailing segments of the flushed
                // one, bounded by overlap_percent of the flushed token count.
                let overlap_budget =
                    (current_tokens as f32 * self.overlap_percent) as usize;
                let mut overlap: Vec<&Segment> = Vec::new();
                let mut overlap_tokens = 0usize;
                for seg in current.iter().rev() {
                    if overlap_tokens + seg.tokens <= overlap_budget {
                        overlap.insert(0, seg);
                        overlap_tokens += seg.tokens;
                    } else {
                        break;
                    }
                }
                current = overlap;
                current_tokens = overlap_tokens;
            }

            current.push(segment);
            current_tokens += segment.tokens;
        }

        if !current.is_empty() {
            let index = chunks.len();
            chunks.push(self.build_chunk(
                &current,
                current_tokens,
                ChunkType::Text,
                index,
                &pages,
                &headings,
            ));
        }

        debug!(
            "Chunked {} chars into {} chunks ({} segments)",
            text.len(),
            chunks.len(),
            segments.len()
        );

        chunks
    }

    fn build_chunk(
        &self,
        segments: &[&Segment],
        token_count: usize,
        chunk_type: ChunkType,
        chunk_index: usize,
        pages: &[(usize, u32)],
        headings: &[(usize, String)],
    ) -> Chunk {
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let start_char = segments[0].start;
        let end_char = start_char + text.len();

        Chunk {
            text,
            chunk_index,
            start_char,
            end_char,
            page_number: page_at(start_char, pages),
            chunk_type,
            section_title: section_at(start_char, headings),
            token_count,
        }
    }

    /// One forward scan over the text: table regions become atomic segments,
    /// the prose between them is split at blank lines and heading lines.
    fn split_segments(&self, text: &str) -> Vec<Segment> {
        let tables: Vec<(usize, usize)> = TABLE_RE
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut segments = Vec::new();
        let mut cursor = 0usize;

        for &(tstart, tend) in &tables {
            if tstart > cursor {
                split_prose(text, cursor, tstart, &mut segments);
            }
            let table_text = text[tstart..tend].trim_end();
            if !table_text.is_empty() {
                segments.push(Segment {
                    start: tstart,
                    text: table_text.to_string(),
                    is_table: true,
                    tokens: 0,
                });
            }
            cursor = tend;
        }
        if cursor < text.len() {
            split_prose(text, cursor, text.len(), &mut segments);
        }

        for segment in &mut segments {
            segment.tokens = self.tokenizer.count(&segment.text);
        }
        segments
    }
}

fn split_prose(text: &str, from: usize, to: usize, out: &mut Vec<Segment>) {
    let span = &text[from..to];
    let mut seg_start: Option<usize> = None;
    let mut seg_end = from;
    let mut line_start = from;

    for line in span.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(start) = seg_start.take() {
                push_prose(text, start, seg_end, out);
            }
        } else if HEADING_LINE_RE.is_match(line) {
            if let Some(start) = seg_start.take() {
                push_prose(text, start, seg_end, out);
            }
            push_prose(text, line_start, line_start + line.len(), out);
        } else {
            if seg_start.is_none() {
                seg_start = Some(line_start);
            }
            seg_end = line_start + line.len();
        }
        line_start += line.len();
    }

    if let Some(start) = seg_start {
        push_prose(text, start, seg_end, out);
    }
}

fn push_prose(text: &str, start: usize, end: usize, out: &mut Vec<Segment>) {
    let slice = &text[start..end];
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return;
    }
    let leading = slice.len() - slice.trim_start().len();
    out.push(Segment {
        start: start + leading,
        text: trimmed.to_string(),
        is_table: false,
        tokens: 0,
    });
}

fn extract_pages(text: &str) -> Vec<(usize, u32)> {
    PAGE_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let m = cap.get(0)?;
            let page: u32 = cap.get(1)?.as_str().parse().ok()?;
            Some((m.start(), page))
        })
        .collect()
}

fn extract_headings(text: &str) -> Vec<(usize, String)> {
    HEADING_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let m = cap.get(0)?;
            let title = cap.get(2)?.as_str().trim().to_string();
            Some((m.start(), title))
        })
        .collect()
}

/// Page in effect at a byte position: the most recent marker at or before it.
fn page_at(position: usize, pages: &[(usize, u32)]) -> Option<u32> {
    pages
        .iter()
        .take_while(|(pos, _)| *pos <= position)
        .last()
        .map(|(_, page)| *page)
}

/// Most recent heading at or before a byte position.
fn section_at(position: usize, headings: &[(usize, String)]) -> Option<String> {
    headings
        .iter()
        .take_while(|(pos, _)| *pos <= position)
        .last()
        .map(|(_, title)| title.clone())
}
