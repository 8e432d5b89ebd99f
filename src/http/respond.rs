//! Response construction.
//!
//! Plain responses are built exactly once per request. Query responses
//! stream: the visitor appends document frames to a per-request assembly
//! buffer owned by [`ChunkWriter`], which hands the buffer to the HTTP
//! layer as a body chunk whenever it reaches [`CHUNK_SIZE`] and once more
//! at finish. The channel between the writer and the socket is small, so a
//! slow client throttles the visitor.

use std::io;

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::db::DbError;
use crate::error::Error;

/// Assembly-buffer size that triggers emission of a non-final chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Bound of the chunk channel between the visitor and the socket. Kept
/// small so the visitor blocks once the client stops draining.
pub const CHUNK_CHANNEL_CAPACITY: usize = 4;

/// A status-only response with an empty body.
pub fn status_only(status: StatusCode) -> Response {
    status.into_response()
}

/// A response with an explicit content type.
pub fn with_body(status: StatusCode, content_type: &'static str, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, content_type)], body).into_response()
}

/// Renders a database failure, logging it first when it is a server error.
///
/// The body is the error's explanation as `text/plain`, which carries the
/// symbolic error name for 5xx statuses.
pub fn report(status: StatusCode, err: &DbError) -> Response {
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    with_body(status, "text/plain", err.to_string())
}

/// Sender half of the chunk channel.
pub type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

/// Receiver half of the chunk channel, consumed by the HTTP body stream.
pub type ChunkReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Creates the bounded chunk channel for one query response.
#[must_use]
pub fn chunk_channel() -> (ChunkSender, ChunkReceiver) {
    mpsc::channel(CHUNK_CHANNEL_CAPACITY)
}

/// Per-request assembly buffer for a streamed query response.
///
/// Lives on the blocking side of the bridge: `flush` uses `blocking_send`
/// and must not be called from the event loop.
pub struct ChunkWriter {
    buf: Vec<u8>,
    tx: ChunkSender,
    data_sent: bool,
}

impl ChunkWriter {
    /// Creates a writer that emits into `tx`.
    #[must_use]
    pub fn new(tx: ChunkSender) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            tx,
            data_sent: false,
        }
    }

    /// Whether at least one chunk has been handed to the HTTP layer. Once
    /// true, the response status can no longer be changed.
    #[must_use]
    pub const fn data_sent(&self) -> bool {
        self.data_sent
    }

    /// The assembly buffer. Document frames are appended here.
    pub const fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    /// Emits the buffered bytes as one chunk.
    ///
    /// A non-final flush below [`CHUNK_SIZE`] is a no-op; a final flush
    /// always drains the buffer. Closing the channel (ending the chunked
    /// response) is done by dropping the writer.
    ///
    /// # Errors
    ///
    /// [`Error::SendResponse`] when the client side of the channel is gone;
    /// the caller must stop producing.
    pub fn flush(&mut self, finish: bool) -> Result<(), Error> {
        if !finish && self.buf.len() < CHUNK_SIZE {
            return Ok(());
        }
        if !self.buf.is_empty() {
            let chunk = Bytes::from(std::mem::take(&mut self.buf));
            self.tx
                .blocking_send(Ok(chunk))
                .map_err(|_| Error::SendResponse)?;
            self.data_sent = true;
        }
        Ok(())
    }

    /// Aborts the response stream after data has been sent.
    ///
    /// The injected I/O error makes the HTTP layer terminate the connection
    /// instead of finishing the chunked body cleanly, so the client can tell
    /// the result set was truncated.
    pub fn abort(&self) {
        let _ = self
            .tx
            .try_send(Err(io::Error::other("query failed mid-stream")));
    }
}
