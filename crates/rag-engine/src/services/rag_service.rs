use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::document::SemanticChunker;
use crate::models::chunk::{ChunkMetadata, Citation, RetrievedChunk};
use crate::services::context_assembler::{AssembledContext, ContextAssembler};
use crate::services::embedding_service::EmbeddingService;
use crate::services::llm_service::{DeltaStream, LlmService};
use crate::services::query_processor::{ProcessedQuery, QueryProcessor};
use crate::services::session_memory::SessionMemory;
use crate::store::VectorStore;
use crate::utils::error::{EngineError, Result};
use crate::utils::tokenizer::TokenCounter;

/// System prompt enforcing source-grounded answers.
pub const GROUNDED_SYSTEM_PROMPT: &str = "\
You are a helpful AI assistant that answers questions based ONLY on the provided source documents.

CRITICAL RULES:
1. Answer based ONLY on the context provided below. NEVER use external knowledge or assumptions.
2. If the information is not explicitly stated in the sources, say \"I cannot find this information in the provided documents.\"
3. NEVER mention document types (like PowerPoint, PPT, slides) unless explicitly shown in the source text.
4. When citing information, use the exact source reference format [Source X].
5. Keep answers factual, accurate, and based strictly on what the sources say.
6. If you're uncertain about something, acknowledge the uncertainty rather than guessing.
7. Do not embellish, paraphrase excessively, or add information not found in the sources.";

const NO_CONTEXT_ANSWER: &str =
    "I couldn't find relevant information in the provided documents to answer your question.";

/// Retrieval depth used when a turn is judged a follow-up.
const FOLLOW_UP_K: usize = 10;

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub doc_id: i64,
    pub chunks: usize,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct RagAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub source_documents: Vec<i64>,
    pub context_tokens: usize,
    pub model: String,
    pub is_follow_up: bool,
}

#[derive(Debug, Clone)]
pub struct RagStats {
    pub total_vectors: usize,
    pub embedding_dimension: Option<usize>,
    pub embedding_model: String,
}

struct PreparedTurn {
    processed: ProcessedQuery,
    chunks: Vec<RetrievedChunk>,
    assembled: AssembledContext,
    is_follow_up: bool,
    user_prompt: String,
}

/// Orchestrates the two engine workflows: ingestion (chunk, embed, index,
/// persist) and querying (process, retrieve, assemble, dispatch, remember).
/// The single long-lived value instantiated at startup; every component is an
/// explicit field, no process-global state.
pub struct RagService {
    chunker: SemanticChunker,
    embedding: Arc<EmbeddingService>,
    store: Arc<VectorStore>,
    query_processor: QueryProcessor,
    assembler: ContextAssembler,
    session_memory: Arc<SessionMemory>,
    llm: Arc<LlmService>,
    doc_titles: RwLock<HashMap<i64, String>>,
}

impl RagService {
    pub fn new(
        settings: &Settings,
        tokenizer: Arc<TokenCounter>,
        embedding: Arc<EmbeddingService>,
        store: Arc<VectorStore>,
        llm: Arc<LlmService>,
        session_memory: Arc<SessionMemory>,
    ) -> Self {
        Self {
            chunker: SemanticChunker::new(&settings.chunking, tokenizer.clone()),
            query_processor: QueryProcessor::new(embedding.clone()),
            assembler: ContextAssembler::new(settings.retrieval.max_context_tokens, tokenizer),
            embedding,
            store,
            session_memory,
            llm,
            doc_titles: RwLock::new(HashMap::new()),
        }
    }

    // ============== Ingestion ==============

    /// Ingest a document's extracted text: chunk, embed, index, persist.
    /// Re-ingesting a doc_id replaces its previous chunks. Transactional at
    /// the document level: any failure after chunking rolls the store back.
    pub async fn ingest_document(
        &self,
        doc_id: i64,
        title: &str,
        text: &str,
    ) -> Result<IngestReport> {
        if text.trim().is_empty() {
            return Err(EngineError::InvalidInput(
                "document has no extracted text".to_string(),
            ));
        }

        self.store.delete_by_doc(doc_id);

        let chunks = self.chunker.chunk_text(text);
        if chunks.is_empty() {
            return Err(EngineError::InvalidInput("no chunks produced".to_string()));
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        // Embedding fails whole, so nothing has been committed yet.
        let embeddings = self.embedding.embed_passages(&texts).await?;

        let metadatas: Vec<ChunkMetadata> = chunks
            .iter()
            .map(|c| ChunkMetadata {
                doc_id,
                chunk_id: None,
                chunk_index: c.chunk_index,
                page_number: c.page_number,
                chunk_type: c.chunk_type,
                section_title: c.section_title.clone(),
                token_count: c.token_count,
            })
            .collect();

        let ids = match self.store.add(&embeddings, &texts, &metadatas) {
            Ok(ids) => ids,
            Err(e) => {
                self.store.delete_by_doc(doc_id);
                return Err(e);
            }
        };

        self.doc_titles.write().insert(doc_id, title.to_string());

        let dimension = self.store.dimension().unwrap_or(0);
        if let Err(e) = self.store.persist() {
            warn!("Failed to persist vector store after ingest: {}", e);
        }

        info!("Ingested doc {} ({} chunks, dim {})", doc_id, ids.len(), dimension);
        Ok(IngestReport {
            doc_id,
            chunks: ids.len(),
            dimension,
        })
    }

    /// Reindex a document: remove its vectors, then ingest the text afresh.
    pub async fn reindex_document(
        &self,
        doc_id: i64,
        title: &str,
        text: &str,
    ) -> Result<IngestReport> {
        if let Err(e) = self.remove_document(doc_id) {
            debug!("Reindexing doc {} with nothing to remove: {}", doc_id, e);
        }
        self.ingest_document(doc_id, title, text).await
    }

    /// Remove a document's vectors; returns how many chunks were dropped.
    pub fn remove_document(&self, doc_id: i64) -> Result<usize> {
        let removed = self.store.delete_by_doc(doc_id);
        let known = self.doc_titles.write().remove(&doc_id).is_some();
        if removed == 0 && !known {
            return Err(EngineError::NotFound(format!("document {}", doc_id)));
        }

        if let Err(e) = self.store.persist() {
            warn!("Failed to persist vector store after delete: {}", e);
        }
        Ok(removed)
    }

    // ============== Retrieval ==============

    /// Retrieve relevant chunks for a query. K defaults to the processor's
    /// intent-derived suggestion.
    pub async fn retrieve(
        &self,
        query: &str,
        doc_filter: Option<&[i64]>,
        k: Option<usize>,
    ) -> Result<(ProcessedQuery, Vec<RetrievedChunk>)> {
        let processed = self.query_processor.process(query, true).await?;
        let embedding = processed.query_embedding.clone().ok_or_else(|| {
            EngineError::EmbeddingUnavailable("query embedding missing".to_string())
        })?;

        let k = k.unwrap_or(processed.suggested_k);
        let results = self.store.search(&embedding, k, doc_filter, 0.0)?;
        debug!("Retrieved {} chunks for query", results.len());

        let titles = self.doc_titles.read();
        let chunks = results
            .into_iter()
            .map(|r| RetrievedChunk {
                chunk_id: r.chunk_id,
                doc_id: r.doc_id,
                doc_title: titles.get(&r.doc_id).cloned(),
                text: r.text,
                score: r.score,
                page_number: r.metadata.page_number,
                chunk_index: r.metadata.chunk_index,
                chunk_type: r.metadata.chunk_type,
                section_title: r.metadata.section_title,
            })
            .collect();

        Ok((processed, chunks))
    }

    async fn prepare_turn(
        &self,
        question: &str,
        doc_filter: Option<&[i64]>,
        k: Option<usize>,
        conversation_id: Option<i64>,
    ) -> Result<PreparedTurn> {
        let is_follow_up = conversation_id
            .map(|cid| self.session_memory.is_follow_up(cid, question))
            .unwrap_or(false);

        // Follow-ups lean on prior context, so bias retrieval deeper unless
        // the caller pinned K.
        let k = k.or(if is_follow_up { Some(FOLLOW_UP_K) } else { None });

        let (processed, chunks) = self.retrieve(question, doc_filter, k).await?;

        let assembled = if is_follow_up {
            let previous = self
                .session_memory
                .previous_chunks(conversation_id.unwrap_or_default());
            self.assembler.assemble_for_follow_up(&previous, &chunks, None)
        } else {
            self.assembler.assemble(&chunks, None)
        };

        let user_prompt = format!(
            "Context from documents:\n\n{}\n\n---\n\nQuestion: {}\n\nPlease provide a comprehensive answer based on the sources above.",
            assembled.context_text, question
        );

        Ok(PreparedTurn {
            processed,
            chunks,
            assembled,
            is_follow_up,
            user_prompt,
        })
    }

    fn update_session(&self, conversation_id: Option<i64>, question: &str, turn: &PreparedTurn) {
        if let Some(cid) = conversation_id {
            self.session_memory
                .update(cid, question, &turn.chunks, &turn.processed.keywords);
        }
    }

    fn answer_meta(&self, turn: &PreparedTurn, answer: String) -> RagAnswer {
        RagAnswer {
            answer,
            citations: turn.assembled.citations.clone(),
            source_documents: turn.assembled.source_documents.clone(),
            context_tokens: turn.assembled.total_tokens,
            model: self.llm.model().to_string(),
            is_follow_up: turn.is_follow_up,
        }
    }

    /// Full RAG query with a blocking answer.
    pub async fn query(
        &self,
        question: &str,
        doc_filter: Option<&[i64]>,
        k: Option<usize>,
        conversation_id: Option<i64>,
    ) -> Result<RagAnswer> {
        // Turns within one conversation never overlap.
        let _turn_guard = match conversation_id {
            Some(cid) => Some(self.session_memory.turn_lock(cid).lock_owned().await),
            None => None,
        };

        let turn = self
            .prepare_turn(question, doc_filter, k, conversation_id)
            .await?;

        if turn.chunks.is_empty() {
            return Ok(self.answer_meta(&turn, NO_CONTEXT_ANSWER.to_string()));
        }

        // A failed dispatch leaves the session untouched for this turn.
        let answer = self
            .llm
            .generate(&turn.user_prompt, Some(GROUNDED_SYSTEM_PROMPT))
            .await?;

        self.update_session(conversation_id, question, &turn);
        Ok(self.answer_meta(&turn, answer))
    }

    /// Full RAG query with a streamed answer: returns the citation metadata
    /// up front and a stream of answer deltas. The per-conversation turn
    /// lock is held until the stream is drained or dropped.
    pub async fn query_stream(
        &self,
        question: &str,
        doc_filter: Option<&[i64]>,
        k: Option<usize>,
        conversation_id: Option<i64>,
    ) -> Result<(RagAnswer, DeltaStream)> {
        let turn_guard = match conversation_id {
            Some(cid) => Some(self.session_memory.turn_lock(cid).lock_owned().await),
            None => None,
        };

        let turn = self
            .prepare_turn(question, doc_filter, k, conversation_id)
            .await?;
        let meta = self.answer_meta(&turn, String::new());

        if turn.chunks.is_empty() {
            let stream: DeltaStream = Box::pin(futures::stream::once(async move {
                let _guard = turn_guard;
                Ok::<String, EngineError>(NO_CONTEXT_ANSWER.to_string())
            }));
            return Ok((meta, stream));
        }

        // Connection failures surface here, before the session is updated.
        let mut deltas = self
            .llm
            .generate_stream(&turn.user_prompt, Some(GROUNDED_SYSTEM_PROMPT))
            .await?;

        self.update_session(conversation_id, question, &turn);

        let stream: DeltaStream = Box::pin(async_stream::try_stream! {
            let _guard = turn_guard;
            while let Some(delta) = deltas.next().await {
                let delta = delta?;
                yield delta;
            }
        });

        Ok((meta, stream))
    }

    // ============== Introspection ==============

    pub fn stats(&self) -> RagStats {
        RagStats {
            total_vectors: self.store.count(),
            embedding_dimension: self
                .store
                .dimension()
                .or_else(|| self.embedding.dimension_if_known()),
            embedding_model: self.embedding.model().to_string(),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn session_memory(&self) -> &Arc<SessionMemory> {
        &self.session_memory
    }
}
