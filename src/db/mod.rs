//! Database facade consumed by the gateway.
//!
//! The gateway never talks to a storage engine directly; it drives the
//! [`Database`] trait. An embedding host implements the trait over its own
//! engine. The crate ships [`MemoryDb`], an in-memory reference backend used
//! by the `docgate` binary and the test suite.
//!
//! Query execution is push-driven: [`Database::execute`] calls the supplied
//! visitor once per result document, in the engine's natural result order,
//! and must stop producing as soon as the visitor returns an error. The
//! visitor is where response backpressure is applied, so implementations
//! must not buffer results past it.

pub mod memory;

pub use memory::MemoryDb;

use std::any::Any;

use thiserror::Error;

/// A JSON document, as stored and returned by the database.
pub type Document = serde_json::Value;

/// Visitor invoked once per query result document.
///
/// Arguments are the document id and the document body. Returning an error
/// aborts the query.
pub type Visitor<'a> = dyn FnMut(i64, &Document) -> Result<(), DbError> + Send + 'a;

/// Error taxonomy reported by [`Database`] implementations.
///
/// Display strings end with a symbolic name in parentheses; user-visible
/// 5xx bodies are rendered from them directly.
#[derive(Debug, Error)]
pub enum DbError {
    /// The document or collection does not exist.
    #[error("key not found (ERROR_NOTFOUND)")]
    NotFound,

    /// Input is not valid JSON.
    #[error("failed to parse JSON (ERROR_PARSE_JSON): {0}")]
    JsonParse(String),

    /// Input is not valid UTF-8.
    #[error("invalid UTF-8 input (ERROR_PARSE_INVALID_UTF8)")]
    InvalidUtf8,

    /// Input contains an invalid unicode codepoint or escape.
    #[error("invalid unicode codepoint (ERROR_PARSE_INVALID_CODEPOINT)")]
    InvalidCodepoint,

    /// A JSON string is missing its quotes.
    #[error("unquoted JSON string (ERROR_PARSE_UNQUOTED_STRING)")]
    UnquotedString,

    /// A patch path points at a nonexistent target.
    #[error("invalid patch target (ERROR_PATCH_TARGET_INVALID)")]
    PatchTargetInvalid,

    /// A patch operation requires a value but none was given.
    #[error("patch operation is missing a value (ERROR_PATCH_NOVALUE)")]
    PatchNoValue,

    /// A patch operation name is unknown or malformed.
    #[error("invalid patch operation: {0} (ERROR_PATCH_INVALID_OP)")]
    PatchInvalidOp(String),

    /// A patch `test` operation did not match.
    #[error("patch test operation failed (ERROR_PATCH_TEST_FAILED)")]
    PatchTestFailed,

    /// A patch path indexes an array with a non-index token.
    #[error("invalid array index in patch path (ERROR_PATCH_INVALID_ARRAY_INDEX)")]
    PatchInvalidArrayIndex,

    /// A JSON pointer is malformed.
    #[error("malformed JSON pointer (ERROR_JSON_POINTER)")]
    JsonPointer,

    /// The query text could not be parsed. Carries the parser's diagnostic.
    #[error("{0}")]
    QueryParse(String),

    /// The query names no collection.
    #[error("no collection specified in query (ERROR_NO_COLLECTION)")]
    NoCollection,

    /// Any other engine failure.
    #[error("internal database error (ERROR_INTERNAL): {0}")]
    Internal(String),
}

impl DbError {
    /// Whether this error was caused by malformed client input.
    ///
    /// Input errors map to HTTP 400 with the diagnostic as the body; every
    /// other kind is a 500.
    #[must_use]
    pub const fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::JsonParse(_)
                | Self::InvalidUtf8
                | Self::InvalidCodepoint
                | Self::UnquotedString
                | Self::PatchTargetInvalid
                | Self::PatchNoValue
                | Self::PatchInvalidOp(_)
                | Self::PatchTestFailed
                | Self::PatchInvalidArrayIndex
                | Self::JsonPointer
        )
    }

    /// Converts a `serde_json` failure into the input-error taxonomy.
    #[must_use]
    pub fn from_json(err: &serde_json::Error) -> Self {
        Self::JsonParse(err.to_string())
    }
}

/// A compiled query, produced by [`Database::prepare`].
pub trait PreparedQuery: Send + Sync {
    /// Whether the query carries an apply (mutation) clause.
    fn has_apply(&self) -> bool;

    /// Returns `self` as `&dyn Any` so implementations can downcast the
    /// query handed back to [`Database::execute`].
    fn as_any(&self) -> &dyn Any;
}

/// Operations the gateway requires from its database collaborator.
///
/// Implementations do their own locking; the gateway calls them from the
/// event loop (simple operations) and from blocking worker tasks (query
/// execution), potentially concurrently.
pub trait Database: Send + Sync + 'static {
    /// Fetches the document stored under `id`.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`] when the collection or document is absent.
    fn get(&self, collection: &str, id: i64) -> Result<Document, DbError>;

    /// Creates or replaces the document under `id`, creating the collection
    /// on demand.
    ///
    /// # Errors
    ///
    /// Any engine failure.
    fn put(&self, collection: &str, doc: &Document, id: i64) -> Result<(), DbError>;

    /// Inserts a new document, allocating and returning its id.
    ///
    /// # Errors
    ///
    /// Any engine failure.
    fn put_new(&self, collection: &str, doc: &Document) -> Result<i64, DbError>;

    /// Applies an RFC 7396 merge patch or RFC 6902 JSON patch to the
    /// document under `id`. The engine decides which format it was given by
    /// examining the patch body.
    ///
    /// # Errors
    ///
    /// An input-error kind for malformed patches, [`DbError::NotFound`]
    /// when the document is absent.
    fn patch(&self, collection: &str, patch: &str, id: i64) -> Result<(), DbError>;

    /// Removes the document under `id`.
    ///
    /// # Errors
    ///
    /// [`DbError::NotFound`] when the collection or document is absent.
    fn remove(&self, collection: &str, id: i64) -> Result<(), DbError>;

    /// Compiles a query from its textual form.
    ///
    /// # Errors
    ///
    /// [`DbError::QueryParse`] with a diagnostic, or
    /// [`DbError::NoCollection`] when the text names no collection.
    fn prepare(&self, query: &str) -> Result<Box<dyn PreparedQuery>, DbError>;

    /// Renders the execution plan of a compiled query as text.
    ///
    /// # Errors
    ///
    /// Any engine failure.
    fn explain(&self, query: &dyn PreparedQuery) -> Result<String, DbError>;

    /// Executes a compiled query, invoking `visitor` once per result
    /// document in result order. Execution stops at the first visitor
    /// error, which is propagated back to the caller.
    ///
    /// # Errors
    ///
    /// Engine failures, or the first error returned by `visitor`.
    fn execute(&self, query: &dyn PreparedQuery, visitor: &mut Visitor<'_>)
    -> Result<(), DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_error_classification() {
        assert!(DbError::JsonParse("x".into()).is_input_error());
        assert!(DbError::PatchTestFailed.is_input_error());
        assert!(DbError::JsonPointer.is_input_error());
        assert!(!DbError::NotFound.is_input_error());
        assert!(!DbError::Internal("x".into()).is_input_error());
        assert!(!DbError::QueryParse("x".into()).is_input_error());
    }

    #[test]
    fn display_carries_symbolic_name() {
        assert!(DbError::NotFound.to_string().contains("ERROR_NOTFOUND"));
        assert!(
            DbError::PatchNoValue
                .to_string()
                .contains("ERROR_PATCH_NOVALUE")
        );
    }
}
