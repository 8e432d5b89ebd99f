//! WebSocket sessions.
//!
//! A connection upgraded at `/` carries a line-oriented command protocol
//! over text frames (binary frames close the connection):
//!
//! ```text
//! frame   := key WS command WS coll WS (id WS)? body?
//! command := "set" | "add" | "del" | "patch"
//! ```
//!
//! `key` is a client-chosen correlation id (≤ 36 bytes, no whitespace).
//! A frame whose command is not one of the four keywords is a query: the
//! remainder after the key is the query text. Malformed frames are dropped
//! without a reply, mirroring the REST surface's refusal to guess.
//!
//! # Reply protocol
//!
//! Every reply frame starts with the client's key, tab-separated:
//!
//! - `<key>\tok` — `set`/`del`/`patch` acknowledged after completion, and
//!   the terminal frame of a query stream.
//! - `<key>\tok\t<id>` — `add` acknowledged with the new document id.
//! - `<key>\terror\t<message>` — any failure, including anonymous mutation
//!   attempts.
//! - `<key>\t<id>\t<json>` — one query result document, compact JSON.
//!
//! Mutations acknowledge synchronously with the database call.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::StatusCode;
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::{COLLECTION_NAME_MAX, WS_KEY_MAX};
use crate::db::{Database, DbError, Document};
use crate::error::Error;
use crate::http::auth::{self, Admission};
use crate::http::{AppState, respond};
use crate::metrics;

/// Bound of the per-query frame channel; a slow client throttles the
/// visitor, same as the HTTP chunk channel.
const FRAME_CHANNEL_CAPACITY: usize = 4;

/// Reply message for mutations attempted by an anonymous session.
const ACCESS_DENIED: &str = "access denied";

/// Handles an HTTP request that asked for a WebSocket upgrade.
///
/// Upgrades are only served at `/`, only for a 9-byte requested protocol
/// whose second byte is `e`, and only past the same token gate as plain
/// requests (any upgrade is anonymous-eligible).
pub(crate) async fn upgrade(state: AppState, req: Request) -> Response {
    if req.uri().path() != "/" {
        return respond::status_only(StatusCode::BAD_REQUEST);
    }
    let protocol_ok = req
        .headers()
        .get("sec-websocket-protocol")
        .is_some_and(|p| p.as_bytes().len() == 9 && p.as_bytes()[1] == b'e');
    if !protocol_ok {
        return respond::status_only(StatusCode::BAD_REQUEST);
    }

    let read_anon = match auth::admit(&state.config, req.headers(), true) {
        Admission::Granted { read_anon } => read_anon,
        Admission::Denied(status) => return respond::status_only(status),
    };

    let max_message_size = state.config.max_body_size;
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade
            .protocols(["websocket"])
            .max_message_size(max_message_size)
            .on_upgrade(move |socket| session(state, read_anon, socket)),
        Err(rejection) => {
            error!(%rejection, "websocket upgrade failed");
            respond::with_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Error::WsUpgrade.to_string(),
            )
        }
    }
}

/// Per-connection message loop.
async fn session(state: AppState, read_anon: bool, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Binary(_) => {
                // Binary frames are not served.
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Message::Text(text) => {
                if handle_frame(&state, read_anon, text.as_str(), &mut sink)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    debug!("websocket session closed");
}

async fn handle_frame(
    state: &AppState,
    read_anon: bool,
    frame: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let Some(command) = parse_frame(frame) else {
        debug!("ignoring malformed websocket frame");
        return Ok(());
    };
    metrics::record_ws_frame(command.name());

    if let WsCommand::Query { key, query } = command {
        return run_query(state, read_anon, key, query, sink).await;
    }
    if let Some(reply) = mutation_reply(&*state.db, read_anon, &command) {
        send(sink, reply).await?;
    }
    Ok(())
}

async fn send(sink: &mut SplitSink<WebSocket, Message>, frame: String) -> Result<(), axum::Error> {
    sink.send(Message::Text(frame.into())).await
}

/// Streams query results back as keyed frames, ending with `<key>\tok`.
async fn run_query(
    state: &AppState,
    read_anon: bool,
    key: &str,
    query: &str,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Result<(), axum::Error> {
    let prepared = match state.db.prepare(query) {
        Ok(prepared) => prepared,
        Err(err) => return send(sink, error_frame(key, &err.to_string())).await,
    };
    if read_anon && prepared.has_apply() {
        return send(sink, error_frame(key, ACCESS_DENIED)).await;
    }

    let (tx, mut rx) = mpsc::channel::<String>(FRAME_CHANNEL_CAPACITY);
    let db = Arc::clone(&state.db);
    let frame_key = key.to_string();
    let task = tokio::task::spawn_blocking(move || {
        db.execute(prepared.as_ref(), &mut |id, doc| {
            tx.blocking_send(format!("{frame_key}\t{id}\t{doc}"))
                .map_err(|_| DbError::Internal("websocket session closed".to_string()))
        })
    });

    while let Some(frame) = rx.recv().await {
        // A send failure drops the receiver, which aborts the visitor.
        sink.send(Message::Text(frame.into())).await?;
    }

    match task.await {
        Ok(Ok(())) => send(sink, format!("{key}\tok")).await,
        Ok(Err(err)) => send(sink, error_frame(key, &err.to_string())).await,
        Err(join_err) => {
            error!(error = %join_err, "websocket query worker failed");
            send(sink, error_frame(key, "internal error")).await
        }
    }
}

// ============================================================================
// Command grammar
// ============================================================================

/// A parsed text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsCommand<'a> {
    Set {
        key: &'a str,
        collection: &'a str,
        id: i64,
        body: &'a str,
    },
    Add {
        key: &'a str,
        collection: &'a str,
        body: &'a str,
    },
    Del {
        key: &'a str,
        collection: &'a str,
        id: i64,
    },
    Patch {
        key: &'a str,
        collection: &'a str,
        id: i64,
        body: &'a str,
    },
    Query {
        key: &'a str,
        query: &'a str,
    },
}

impl WsCommand<'_> {
    const fn name(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Add { .. } => "add",
            Self::Del { .. } => "del",
            Self::Patch { .. } => "patch",
            Self::Query { .. } => "query",
        }
    }
}

/// Parses one text frame. `None` means the frame is dropped silently.
fn parse_frame(input: &str) -> Option<WsCommand<'_>> {
    let input = input.trim_start();
    // The key must be followed by more content.
    let key_end = input.find(char::is_whitespace)?;
    let (key, rest) = input.split_at(key_end);
    if key.len() > WS_KEY_MAX {
        return None;
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }

    // A lone trailing token is never a keyword command; it is a query.
    let Some(command_end) = rest.find(char::is_whitespace) else {
        return Some(WsCommand::Query { key, query: rest });
    };
    let (command, after) = rest.split_at(command_end);
    if !matches!(command, "set" | "add" | "del" | "patch") {
        return Some(WsCommand::Query { key, query: rest });
    }

    let after = after.trim_start();
    // The collection must also be followed by more content.
    let coll_end = after.find(char::is_whitespace)?;
    let (collection, rest) = after.split_at(coll_end);
    if collection.len() > COLLECTION_NAME_MAX {
        return None;
    }
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }

    if command == "add" {
        return Some(WsCommand::Add {
            key,
            collection,
            body: rest,
        });
    }

    // set / del / patch carry a numeric id before the body.
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let id: i64 = rest[..digits_end].parse().ok()?;
    if id < 1 {
        return None;
    }
    let body = rest[digits_end..].trim_start();

    Some(match command {
        "set" => WsCommand::Set {
            key,
            collection,
            id,
            body,
        },
        "del" => WsCommand::Del { key, collection, id },
        _ => WsCommand::Patch {
            key,
            collection,
            id,
            body,
        },
    })
}

// ============================================================================
// Mutation commands
// ============================================================================

/// Executes a mutation command and renders its reply frame.
///
/// Returns `None` for the query command, which streams instead.
fn mutation_reply(db: &dyn Database, read_anon: bool, command: &WsCommand<'_>) -> Option<String> {
    let reply = match command {
        WsCommand::Query { .. } => return None,
        WsCommand::Set {
            key,
            collection,
            id,
            body,
        } => {
            if read_anon {
                return Some(error_frame(key, ACCESS_DENIED));
            }
            ack(key, parse_doc(body).and_then(|doc| db.put(collection, &doc, *id)).map(|()| None))
        }
        WsCommand::Add {
            key,
            collection,
            body,
        } => {
            if read_anon {
                return Some(error_frame(key, ACCESS_DENIED));
            }
            ack(key, parse_doc(body).and_then(|doc| db.put_new(collection, &doc)).map(Some))
        }
        WsCommand::Del { key, collection, id } => {
            if read_anon {
                return Some(error_frame(key, ACCESS_DENIED));
            }
            ack(key, db.remove(collection, *id).map(|()| None))
        }
        WsCommand::Patch {
            key,
            collection,
            id,
            body,
        } => {
            if read_anon {
                return Some(error_frame(key, ACCESS_DENIED));
            }
            ack(key, db.patch(collection, body, *id).map(|()| None))
        }
    };
    Some(reply)
}

fn parse_doc(body: &str) -> Result<Document, DbError> {
    serde_json::from_str(body).map_err(|e| DbError::from_json(&e))
}

fn ack(key: &str, result: Result<Option<i64>, DbError>) -> String {
    match result {
        Ok(Some(id)) => format!("{key}\tok\t{id}"),
        Ok(None) => format!("{key}\tok"),
        Err(err) => error_frame(key, &err.to_string()),
    }
}

fn error_frame(key: &str, message: &str) -> String {
    format!("{key}\terror\t{message}")
}
