//! `docgate` — HTTP/1.1 and WebSocket gateway for embeddable JSON document
//! databases.
//!
//! The gateway attaches to a running database instance (anything
//! implementing [`db::Database`]) and exposes its document and query
//! operations to remote clients: a strict little REST surface for document
//! CRUD, a streaming query endpoint at `POST /`, and a text-framed
//! WebSocket command channel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use docgate::{Gateway, GatewayConfig, MemoryDb};
//!
//! let db = Arc::new(MemoryDb::new());
//! let config = GatewayConfig { port: 9191, ..GatewayConfig::default() };
//! if let Some(gateway) = Gateway::new(db, config) {
//!     gateway.start().expect("gateway failed to start");
//!     // ...
//!     gateway.shutdown();
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod logging;
pub(crate) mod metrics;
pub mod server;
pub mod ws;

pub use config::GatewayConfig;
pub use db::{Database, DbError, Document, MemoryDb, PreparedQuery};
pub use error::{Error, Result};
pub use server::Gateway;
