//! HTTP request dispatch.
//!
//! A single fallback handler owns the whole REST surface: the path grammar
//! is too strict for router patterns, so requests are parsed by
//! [`parse::parse_path`] and dispatched to one of the six database
//! operations. WebSocket upgrades are peeled off first and handed to
//! [`crate::ws`].

pub mod auth;
pub mod parse;
pub mod query;
pub mod respond;

use std::io;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::config::GatewayConfig;
use crate::db::{Database, DbError, Document};
use crate::http::auth::Admission;
use crate::http::parse::{Method, Target};
use crate::metrics;
use crate::ws;

/// State shared by every request handler.
#[derive(Clone)]
pub(crate) struct AppState {
    pub db: Arc<dyn Database>,
    pub config: Arc<GatewayConfig>,
}

/// Builds the gateway router.
pub(crate) fn router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    metrics::record_request(req.method().as_str());
    let response = handle(state, req).await;
    metrics::record_response(response.status().as_u16());
    response
}

async fn handle(state: AppState, req: Request) -> Response {
    if is_upgrade_request(&req) {
        return ws::upgrade(state, req).await;
    }

    let Some(method) = Method::from_http(req.method()) else {
        return respond::status_only(StatusCode::BAD_REQUEST);
    };
    let Some(target) = parse_path_of(&req, method) else {
        return respond::status_only(StatusCode::BAD_REQUEST);
    };

    let anon_eligible =
        matches!(method, Method::Get | Method::Head) || matches!(target, Target::Query);
    let read_anon = match auth::admit(&state.config, req.headers(), anon_eligible) {
        Admission::Granted { read_anon } => read_anon,
        Admission::Denied(status) => return respond::status_only(status),
    };

    let Ok(hints) = parse::parse_hints(req.headers()) else {
        return respond::status_only(StatusCode::BAD_REQUEST);
    };

    let body = if matches!(method, Method::Put | Method::Post | Method::Patch) {
        match axum::body::to_bytes(req.into_body(), state.config.max_body_size).await {
            Ok(body) => body,
            Err(_) => return respond::status_only(StatusCode::PAYLOAD_TOO_LARGE),
        }
    } else {
        Bytes::new()
    };

    match target {
        Target::Query => query::run(Arc::clone(&state.db), body, hints, read_anon).await,
        Target::Collection(coll) => op_insert(&state, &coll, &body, read_anon),
        Target::Document(coll, id) => match method {
            Method::Get => op_get(&state, &coll, id, false),
            Method::Head => op_get(&state, &coll, id, true),
            Method::Put => op_put(&state, &coll, id, &body, read_anon),
            Method::Patch => op_patch(&state, &coll, id, &body, read_anon),
            Method::Delete => op_delete(&state, &coll, id, read_anon),
            // The parser never produces a document target for POST.
            Method::Post => respond::status_only(StatusCode::BAD_REQUEST),
        },
    }
}

fn is_upgrade_request(req: &Request) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

fn parse_path_of(req: &Request, method: Method) -> Option<Target> {
    parse::parse_path(req.uri().path(), method)
}

// ============================================================================
// Operations
// ============================================================================

/// `GET`/`HEAD /{collection}/{id}`.
fn op_get(state: &AppState, coll: &str, id: i64, head: bool) -> Response {
    let doc = match state.db.get(coll, id) {
        Ok(doc) => doc,
        Err(DbError::NotFound) => return respond::status_only(StatusCode::NOT_FOUND),
        Err(err) => return respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    };
    if head {
        // Size of the pretty rendering, computed without materializing it.
        let mut counter = CountingWriter::default();
        if let Err(err) = serde_json::to_writer_pretty(&mut counter, &doc) {
            return respond::report(
                StatusCode::INTERNAL_SERVER_ERROR,
                &DbError::Internal(err.to_string()),
            );
        }
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (header::CONTENT_LENGTH, counter.0.to_string()),
            ],
        )
            .into_response();
    }
    match serde_json::to_string_pretty(&doc) {
        Ok(body) => respond::with_body(StatusCode::OK, "application/json", body),
        Err(err) => respond::report(
            StatusCode::INTERNAL_SERVER_ERROR,
            &DbError::Internal(err.to_string()),
        ),
    }
}

/// `POST /{collection}` — insert with an allocated id.
fn op_insert(state: &AppState, coll: &str, body: &Bytes, read_anon: bool) -> Response {
    if read_anon {
        return respond::status_only(StatusCode::FORBIDDEN);
    }
    let doc = match parse_body(body) {
        Ok(doc) => doc,
        Err(response) => return response,
    };
    match state.db.put_new(coll, &doc) {
        Ok(id) => respond::with_body(StatusCode::OK, "text/plain", id.to_string()),
        Err(err) => respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

/// `PUT /{collection}/{id}` — create or replace.
fn op_put(state: &AppState, coll: &str, id: i64, body: &Bytes, read_anon: bool) -> Response {
    if read_anon {
        return respond::status_only(StatusCode::FORBIDDEN);
    }
    let doc = match parse_body(body) {
        Ok(doc) => doc,
        Err(response) => return response,
    };
    match state.db.put(coll, &doc, id) {
        Ok(()) => respond::status_only(StatusCode::OK),
        Err(err) => respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

/// `PATCH /{collection}/{id}` — merge patch or JSON patch, decided by the
/// database from the patch body.
fn op_patch(state: &AppState, coll: &str, id: i64, body: &Bytes, read_anon: bool) -> Response {
    if read_anon {
        return respond::status_only(StatusCode::FORBIDDEN);
    }
    if body.is_empty() {
        return respond::status_only(StatusCode::BAD_REQUEST);
    }
    let Ok(patch) = std::str::from_utf8(body) else {
        return respond::report(StatusCode::BAD_REQUEST, &DbError::InvalidUtf8);
    };
    match state.db.patch(coll, patch, id) {
        Ok(()) => respond::status_only(StatusCode::OK),
        Err(err) if err.is_input_error() => respond::report(StatusCode::BAD_REQUEST, &err),
        Err(err) => respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

/// `DELETE /{collection}/{id}`.
fn op_delete(state: &AppState, coll: &str, id: i64, read_anon: bool) -> Response {
    if read_anon {
        return respond::status_only(StatusCode::FORBIDDEN);
    }
    match state.db.remove(coll, id) {
        Ok(()) => respond::status_only(StatusCode::OK),
        Err(DbError::NotFound) => respond::status_only(StatusCode::NOT_FOUND),
        Err(err) => respond::report(StatusCode::INTERNAL_SERVER_ERROR, &err),
    }
}

/// Parses a required JSON request body; failures become the 400 response
/// with the parser's diagnostic.
fn parse_body(body: &Bytes) -> Result<Document, Response> {
    if body.is_empty() {
        return Err(respond::status_only(StatusCode::BAD_REQUEST));
    }
    serde_json::from_slice(body)
        .map_err(|e| respond::with_body(StatusCode::BAD_REQUEST, "text/plain", e.to_string()))
}

/// `io::Write` sink that only counts bytes.
#[derive(Default)]
struct CountingWriter(usize);

impl io::Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
