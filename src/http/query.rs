//! The query endpoint: `POST /`.
//!
//! The request body is compiled and executed against the database, whose
//! visitor callback pushes one document at a time. Results stream back as a
//! chunked `application/json` body with one frame per document:
//!
//! ```text
//! response := (explain "--------------------")? document* "\r\n"
//! document := "\r\n" decimal_id "\t" json_document
//! ```
//!
//! Execution runs on a blocking worker task; the handler waits for either
//! the first chunk (then commits to a 200 streaming response) or for
//! completion without one (then replies with a plain status). Errors after
//! the first chunk cannot change the status any more: they are logged and
//! the stream is aborted.

use std::io::Write;
use std::sync::Arc;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::db::{Database, DbError, PreparedQuery};
use crate::http::parse::Hints;
use crate::http::respond::{self, ChunkSender, ChunkWriter};

/// Separator emitted between the explain block and the first document.
const EXPLAIN_SEPARATOR: &[u8] = b"--------------------";

/// Handles `POST /`.
pub async fn run(
    db: Arc<dyn Database>,
    body: Bytes,
    hints: Hints,
    read_anon: bool,
) -> Response {
    if body.is_empty() {
        return respond::status_only(StatusCode::BAD_REQUEST);
    }
    let Ok(text) = std::str::from_utf8(&body) else {
        return respond::report(StatusCode::BAD_REQUEST, &DbError::InvalidUtf8);
    };

    // The collection name is embedded in the query itself.
    let query = match db.prepare(text) {
        Ok(query) => query,
        Err(err @ DbError::QueryParse(_)) => {
            return respond::with_body(StatusCode::BAD_REQUEST, "text/plain", err.to_string());
        }
        Err(err @ DbError::NoCollection) => {
            return respond::report(StatusCode::BAD_REQUEST, &err);
        }
        Err(err) => return respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    };

    if read_anon && query.has_apply() {
        // Anonymous admission never covers data modification.
        return respond::status_only(StatusCode::FORBIDDEN);
    }

    let explain = if hints.explain {
        match db.explain(query.as_ref()) {
            Ok(plan) => Some(plan),
            Err(err) => return respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
        }
    } else {
        None
    };

    let (tx, mut rx) = respond::chunk_channel();
    let task =
        tokio::task::spawn_blocking(move || stream_results(&*db, query.as_ref(), explain, &tx));

    // First chunk decides the response shape.
    if let Some(first) = rx.recv().await {
        let body = axum::body::Body::from_stream(
            tokio_stream::once(first).chain(ReceiverStream::new(rx)),
        );
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
    }

    // The channel closed without a chunk: the worker is done and no data
    // reached the client, so a plain status is still possible.
    match task.await {
        Ok(Ok(())) => respond::status_only(StatusCode::OK),
        Ok(Err(err @ DbError::QueryParse(_))) => {
            respond::with_body(StatusCode::BAD_REQUEST, "text/plain", err.to_string())
        }
        Ok(Err(err @ DbError::NoCollection)) => respond::report(StatusCode::BAD_REQUEST, &err),
        Ok(Err(err)) => respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
        Err(join_err) => respond::report(
            StatusCode::INTERNAL_SERVER_ERROR,
            &DbError::Internal(join_err.to_string()),
        ),
    }
}

/// Drives the visitor loop on the blocking side of the bridge.
///
/// Returns the database error only when nothing was sent yet; once data is
/// out, errors are logged here and the stream is aborted instead.
fn stream_results(
    db: &dyn Database,
    query: &dyn PreparedQuery,
    explain: Option<String>,
    tx: &ChunkSender,
) -> Result<(), DbError> {
    let mut writer = ChunkWriter::new(tx.clone());
    let mut pending_explain = explain;
    let mut visited = false;

    let result = db.execute(query, &mut |id, doc| {
        visited = true;
        let buf = writer.buf_mut();
        if let Some(plan) = pending_explain.take() {
            buf.extend_from_slice(plan.as_bytes());
            buf.extend_from_slice(EXPLAIN_SEPARATOR);
        }
        write!(buf, "\r\n{id}\t").map_err(|e| DbError::Internal(e.to_string()))?;
        serde_json::to_writer(&mut *buf, doc).map_err(|e| DbError::Internal(e.to_string()))?;
        writer
            .flush(false)
            .map_err(|_| DbError::Internal("response channel closed".to_string()))
    });

    match result {
        Ok(()) => {
            // An explain-only response is still owed when the result set
            // was empty.
            if let Some(plan) = pending_explain.take() {
                let buf = writer.buf_mut();
                buf.extend_from_slice(plan.as_bytes());
                buf.extend_from_slice(EXPLAIN_SEPARATOR);
            }
            if visited || !writer.buf_mut().is_empty() {
                writer.buf_mut().extend_from_slice(b"\r\n");
                writer
                    .flush(true)
                    .map_err(|_| DbError::Internal("response channel closed".to_string()))?;
            }
            Ok(())
        }
        Err(err) => {
            if writer.data_sent() {
                // Too late for a status change: log, then cut the stream so
                // the client sees a truncated body rather than a clean end.
                error!(error = %err, "query failed after response data was sent");
                writer.abort();
                Ok(())
            } else {
                debug!(error = %err, "query failed before any data was sent");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use serde_json::json;

    fn seeded_db() -> Arc<MemoryDb> {
        let db = Arc::new(MemoryDb::new());
        db.put("users", &json!({"name": "ada"}), 1).unwrap();
        db.put("users", &json!({"name": "bob"}), 2).unwrap();
        db
    }

    fn run_to_chunks(
        db: &Arc<MemoryDb>,
        query: &str,
        explain: Option<String>,
    ) -> (Result<(), DbError>, Vec<std::io::Result<Bytes>>) {
        let prepared = db.prepare(query).unwrap();
        let (tx, mut rx) = respond::chunk_channel();
        let outcome = stream_results(&**db, prepared.as_ref(), explain, &tx);
        drop(tx);
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        (outcome, chunks)
    }

    fn concat(chunks: &[std::io::Result<Bytes>]) -> Vec<u8> {
        chunks
            .iter()
            .flat_map(|c| c.as_ref().unwrap().iter().copied())
            .collect()
    }

    #[test]
    fn documents_are_framed_with_crlf_and_tab() {
        let db = seeded_db();
        let (outcome, chunks) = run_to_chunks(&db, "@users/*", None);
        outcome.unwrap();
        let body = concat(&chunks);
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("\r\n1\t"));
        assert!(text.contains("\r\n2\t"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn explain_block_precedes_documents() {
        let db = seeded_db();
        let plan = "collection: users\n".to_string();
        let (outcome, chunks) = run_to_chunks(&db, "@users/*", Some(plan));
        outcome.unwrap();
        let text = String::from_utf8(concat(&chunks)).unwrap();
        assert!(text.starts_with("collection: users\n--------------------\r\n1\t"));
        assert_eq!(text.matches("--------------------").count(), 1);
    }

    #[test]
    fn empty_result_without_explain_sends_nothing() {
        let db = Arc::new(MemoryDb::new());
        let (outcome, chunks) = run_to_chunks(&db, "@ghosts/*", None);
        outcome.unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn empty_result_with_explain_still_delivers_the_plan() {
        let db = Arc::new(MemoryDb::new());
        let (outcome, chunks) = run_to_chunks(&db, "@ghosts/*", Some("plan\n".to_string()));
        outcome.unwrap();
        let text = String::from_utf8(concat(&chunks)).unwrap();
        assert_eq!(text, "plan\n--------------------\r\n");
    }
}
