//! Error types for the gateway itself.
//!
//! Database-side failures live in [`crate::db::DbError`]; this module covers
//! the errors the gateway can produce on its own: listener startup, response
//! delivery, and WebSocket upgrade. Display strings carry a symbolic name so
//! 5xx bodies and logs identify the failure without a debugger.

use thiserror::Error;

/// Top-level error type for gateway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The TCP listener could not be bound.
    #[error("failed to start HTTP network listener (ERROR_HTTP_LISTEN): {0}")]
    Listen(#[source] std::io::Error),

    /// The worker thread or its runtime could not be created.
    #[error("failed to start gateway worker (ERROR_WORKER_START): {0}")]
    WorkerStart(#[source] std::io::Error),

    /// `Gateway::start` was invoked more than once on the same handle.
    #[error("gateway already started (ERROR_ALREADY_STARTED)")]
    AlreadyStarted,

    /// A response (or response chunk) could not be delivered to the client.
    #[error("error sending response (ERROR_SEND_RESPONSE)")]
    SendResponse,

    /// The HTTP connection could not be upgraded to a WebSocket session.
    #[error("failed upgrading to websocket connection (ERROR_WS_UPGRADE)")]
    WsUpgrade,

    /// The event loop terminated abnormally.
    #[error("HTTP event loop failed (ERROR_EVENT_LOOP): {0}")]
    EventLoop(#[source] std::io::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
