use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::{error, info};

use crate::models::chat::{QueryRequest, QueryResponse};
use crate::state::AppState;
use crate::utils::error::EngineError;

/// POST /api/query — blocking RAG answer.
pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, EngineError> {
    if req.question.trim().is_empty() {
        return Err(EngineError::InvalidInput("question cannot be empty".to_string()));
    }

    info!(
        "Query request: conversation_id={:?}, docs={:?}",
        req.conversation_id, req.document_ids
    );

    let answer = state
        .rag
        .query(
            &req.question,
            req.document_ids.as_deref(),
            req.k,
            req.conversation_id,
        )
        .await?;

    Ok(Json(QueryResponse {
        answer: answer.answer,
        citations: answer.citations,
        source_documents: answer.source_documents,
        context_tokens: answer.context_tokens,
        model: answer.model,
        is_follow_up: answer.is_follow_up,
    }))
}

/// POST /api/query/stream — Server-Sent Events: a `{citations}` frame, then
/// `{content}` deltas, closed by `{done: true}`. Errors are emitted as an
/// `{error}` frame and end the stream.
pub async fn query_stream_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream! {
        if req.question.trim().is_empty() {
            yield Ok(data_event(json!({ "error": "question cannot be empty" })));
        } else {
            let result = state
                .rag
                .query_stream(
                    &req.question,
                    req.document_ids.as_deref(),
                    req.k,
                    req.conversation_id,
                )
                .await;

            match result {
                Ok((meta, mut deltas)) => {
                    yield Ok(data_event(json!({ "citations": meta.citations })));

                    let mut failed = false;
                    while let Some(delta) = deltas.next().await {
                        match delta {
                            Ok(content) => {
                                yield Ok(data_event(json!({ "content": content })));
                            }
                            Err(e) => {
                                error!("Stream error: {}", e);
                                yield Ok(data_event(json!({ "error": e.to_string() })));
                                failed = true;
                                break;
                            }
                        }
                    }

                    if !failed {
                        yield Ok(data_event(json!({ "done": true })));
                    }
                }
                Err(e) => {
                    error!("Query stream failed: {}", e);
                    yield Ok(data_event(json!({ "error": e.to_string() })));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn data_event(payload: serde_json::Value) -> Event {
    Event::default().data(payload.to_string())
}
