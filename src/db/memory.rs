//! In-memory reference backend.
//!
//! [`MemoryDb`] implements the [`Database`] facade over a [`DashMap`] of
//! collections. It exists so the gateway can be driven end-to-end (by the
//! `docgate` binary and the test suite) without an external engine; it is
//! not a storage engine and keeps nothing across restarts.
//!
//! # Query language
//!
//! ```text
//! query  := '@' collection '/' filter ( '|' 'apply' patch )?
//! filter := '*' | '[' field '=' value ']'
//! value  := '*' | json-scalar | bare-word
//! ```
//!
//! `[field = *]` matches documents that carry the field at all; `*` matches
//! every document. The optional `apply` clause is an RFC 7396 merge patch
//! applied to each matched document before it is visited.

use std::any::Any;

use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::config::COLLECTION_NAME_MAX;
use crate::db::{Database, DbError, Document, PreparedQuery, Visitor};

/// An in-memory JSON document store.
///
/// Collections are created on demand; document ids start at 1 and are never
/// reused within a collection.
#[derive(Debug, Default)]
pub struct MemoryDb {
    collections: DashMap<String, Collection>,
}

#[derive(Debug)]
struct Collection {
    next_id: i64,
    docs: std::collections::BTreeMap<i64, Document>,
}

impl Default for Collection {
    fn default() -> Self {
        Self {
            next_id: 1,
            docs: std::collections::BTreeMap::new(),
        }
    }
}

impl MemoryDb {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for MemoryDb {
    fn get(&self, collection: &str, id: i64) -> Result<Document, DbError> {
        let coll = self.collections.get(collection).ok_or(DbError::NotFound)?;
        coll.docs.get(&id).cloned().ok_or(DbError::NotFound)
    }

    fn put(&self, collection: &str, doc: &Document, id: i64) -> Result<(), DbError> {
        if id < 1 {
            return Err(DbError::Internal("document id must be >= 1".to_string()));
        }
        let mut coll = self.collections.entry(collection.to_string()).or_default();
        coll.docs.insert(id, doc.clone());
        coll.next_id = coll.next_id.max(id.saturating_add(1));
        Ok(())
    }

    fn put_new(&self, collection: &str, doc: &Document) -> Result<i64, DbError> {
        let mut coll = self.collections.entry(collection.to_string()).or_default();
        let id = coll.next_id;
        coll.next_id += 1;
        coll.docs.insert(id, doc.clone());
        Ok(id)
    }

    fn patch(&self, collection: &str, patch: &str, id: i64) -> Result<(), DbError> {
        let patch: Value = serde_json::from_str(patch).map_err(|e| DbError::from_json(&e))?;
        let mut coll = self
            .collections
            .get_mut(collection)
            .ok_or(DbError::NotFound)?;
        let doc = coll.docs.get_mut(&id).ok_or(DbError::NotFound)?;
        match patch {
            // RFC 6902: a patch document that is an array of operations.
            // Applied to a working copy so a failed `test` leaves the
            // stored document untouched.
            Value::Array(ops) => {
                let mut working = doc.clone();
                for op in &ops {
                    apply_patch_op(&mut working, op)?;
                }
                *doc = working;
                Ok(())
            }
            // Anything else is an RFC 7396 merge patch.
            other => {
                merge_patch(doc, &other);
                Ok(())
            }
        }
    }

    fn remove(&self, collection: &str, id: i64) -> Result<(), DbError> {
        let mut coll = self
            .collections
            .get_mut(collection)
            .ok_or(DbError::NotFound)?;
        coll.docs.remove(&id).map(|_| ()).ok_or(DbError::NotFound)
    }

    fn prepare(&self, query: &str) -> Result<Box<dyn PreparedQuery>, DbError> {
        parse_query(query).map(|q| Box::new(q) as Box<dyn PreparedQuery>)
    }

    fn explain(&self, query: &dyn PreparedQuery) -> Result<String, DbError> {
        let q = downcast(query)?;
        let mut out = format!(
            "collection: {}\nfilter: {}\nindex: none (full collection scan)\n",
            q.collection, q.filter
        );
        if q.apply.is_some() {
            out.push_str("apply: merge patch per matched document\n");
        }
        Ok(out)
    }

    fn execute(
        &self,
        query: &dyn PreparedQuery,
        visitor: &mut Visitor<'_>,
    ) -> Result<(), DbError> {
        let q = downcast(query)?;

        // Snapshot matches under the shard lock, then visit without holding
        // it: the visitor may block on response backpressure.
        let mut matches: Vec<(i64, Document)> = match self.collections.get(&q.collection) {
            None => Vec::new(),
            Some(coll) => coll
                .docs
                .iter()
                .filter(|(_, doc)| q.filter.matches(doc))
                .map(|(id, doc)| (*id, doc.clone()))
                .collect(),
        };

        if let Some(patch) = &q.apply {
            for (_, doc) in &mut matches {
                merge_patch(doc, patch);
            }
            if let Some(mut coll) = self.collections.get_mut(&q.collection) {
                for (id, doc) in &matches {
                    coll.docs.insert(*id, doc.clone());
                }
            }
        }

        for (id, doc) in &matches {
            visitor(*id, doc)?;
        }
        Ok(())
    }
}

fn downcast(query: &dyn PreparedQuery) -> Result<&MemQuery, DbError> {
    query
        .as_any()
        .downcast_ref::<MemQuery>()
        .ok_or_else(|| DbError::Internal("query was not prepared by this backend".to_string()))
}

// ============================================================================
// Query compilation
// ============================================================================

#[derive(Debug)]
struct MemQuery {
    collection: String,
    filter: Filter,
    apply: Option<Document>,
}

impl PreparedQuery for MemQuery {
    fn has_apply(&self) -> bool {
        self.apply.is_some()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
enum Filter {
    All,
    Exists(String),
    Eq(String, Document),
}

impl Filter {
    fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Exists(field) => doc.get(field).is_some(),
            Self::Eq(field, value) => doc.get(field) == Some(value),
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Exists(field) => write!(f, "[{field} = *]"),
            Self::Eq(field, value) => write!(f, "[{field} = {value}]"),
        }
    }
}

fn parse_query(text: &str) -> Result<MemQuery, DbError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DbError::QueryParse("empty query".to_string()));
    }

    let (head, apply) = match text.split_once('|') {
        Some((head, tail)) => (head.trim(), Some(parse_apply(tail)?)),
        None => (text, None),
    };

    let Some(rest) = head.strip_prefix('@') else {
        return Err(DbError::NoCollection);
    };
    let Some((collection, filter)) = rest.split_once('/') else {
        return Err(DbError::QueryParse(
            "expected '/' after collection name".to_string(),
        ));
    };
    let collection = collection.trim();
    if collection.is_empty() {
        return Err(DbError::NoCollection);
    }
    if collection.len() > COLLECTION_NAME_MAX {
        return Err(DbError::QueryParse("collection name too long".to_string()));
    }

    Ok(MemQuery {
        collection: collection.to_string(),
        filter: parse_filter(filter.trim())?,
        apply,
    })
}

fn parse_filter(filter: &str) -> Result<Filter, DbError> {
    if filter == "*" {
        return Ok(Filter::All);
    }
    let inner = filter
        .strip_prefix('[')
        .and_then(|f| f.strip_suffix(']'))
        .ok_or_else(|| DbError::QueryParse(format!("unsupported filter: {filter}")))?;
    let (field, value) = inner
        .split_once('=')
        .ok_or_else(|| DbError::QueryParse(format!("expected '=' in filter: [{inner}]")))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(DbError::QueryParse("empty field name in filter".to_string()));
    }
    let value = value.trim();
    if value == "*" {
        return Ok(Filter::Exists(field.to_string()));
    }
    // A quoted string, number, bool or null parses as JSON; anything else is
    // taken as a bare string.
    let value = serde_json::from_str::<Value>(value)
        .unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(Filter::Eq(field.to_string(), value))
}

fn parse_apply(clause: &str) -> Result<Document, DbError> {
    let clause = clause.trim();
    let Some(patch) = clause.strip_prefix("apply") else {
        return Err(DbError::QueryParse(format!(
            "unsupported query clause: {clause}"
        )));
    };
    serde_json::from_str(patch.trim()).map_err(|e| DbError::from_json(&e))
}

// ============================================================================
// Patching
// ============================================================================

/// RFC 7396 merge patch.
fn merge_patch(target: &mut Document, patch: &Document) {
    let Value::Object(changes) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (key, value) in changes {
            if value.is_null() {
                fields.remove(key);
            } else {
                merge_patch(fields.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Applies one RFC 6902 operation to `doc` in place.
fn apply_patch_op(doc: &mut Document, op: &Value) -> Result<(), DbError> {
    let name = op
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| DbError::PatchInvalidOp("missing 'op' member".to_string()))?;
    let path = op
        .get("path")
        .and_then(Value::as_str)
        .ok_or(DbError::JsonPointer)?;

    match name {
        "add" => {
            let value = op.get("value").ok_or(DbError::PatchNoValue)?.clone();
            pointer_insert(doc, path, value)
        }
        "remove" => pointer_remove(doc, path).map(|_| ()),
        "replace" => {
            let value = op.get("value").ok_or(DbError::PatchNoValue)?.clone();
            if path.is_empty() {
                *doc = value;
                return Ok(());
            }
            pointer_get(doc, path)?;
            pointer_remove(doc, path)?;
            pointer_insert(doc, path, value)
        }
        "move" => {
            let from = op.get("from").and_then(Value::as_str).ok_or(DbError::JsonPointer)?;
            let value = pointer_remove(doc, from)?;
            pointer_insert(doc, path, value)
        }
        "copy" => {
            let from = op.get("from").and_then(Value::as_str).ok_or(DbError::JsonPointer)?;
            let value = pointer_get(doc, from)?.clone();
            pointer_insert(doc, path, value)
        }
        "test" => {
            let value = op.get("value").ok_or(DbError::PatchNoValue)?;
            if pointer_get(doc, path)? == value {
                Ok(())
            } else {
                Err(DbError::PatchTestFailed)
            }
        }
        other => Err(DbError::PatchInvalidOp(other.to_string())),
    }
}

fn pointer_tokens(path: &str) -> Result<Vec<String>, DbError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    if !path.starts_with('/') {
        return Err(DbError::JsonPointer);
    }
    Ok(path
        .split('/')
        .skip(1)
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn array_index(token: &str, len: usize) -> Result<usize, DbError> {
    // Leading zeros and signs are rejected by RFC 6901.
    if token != "0" && (token.starts_with('0') || token.starts_with('+') || token.starts_with('-'))
    {
        return Err(DbError::PatchInvalidArrayIndex);
    }
    let idx: usize = token
        .parse()
        .map_err(|_| DbError::PatchInvalidArrayIndex)?;
    if idx >= len {
        return Err(DbError::PatchInvalidArrayIndex);
    }
    Ok(idx)
}

fn pointer_get<'a>(doc: &'a Document, path: &str) -> Result<&'a Document, DbError> {
    let mut current = doc;
    for token in pointer_tokens(path)? {
        current = match current {
            Value::Object(fields) => fields.get(&token).ok_or(DbError::PatchTargetInvalid)?,
            Value::Array(items) => &items[array_index(&token, items.len())?],
            _ => return Err(DbError::PatchTargetInvalid),
        };
    }
    Ok(current)
}

/// Removes the value at `path` and returns it.
fn pointer_remove(doc: &mut Document, path: &str) -> Result<Document, DbError> {
    let tokens = pointer_tokens(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        // Cannot remove the document root.
        return Err(DbError::PatchTargetInvalid);
    };
    let parent = descend(doc, parents)?;
    match parent {
        Value::Object(fields) => fields.remove(last).ok_or(DbError::PatchTargetInvalid),
        Value::Array(items) => {
            let idx = array_index(last, items.len())?;
            Ok(items.remove(idx))
        }
        _ => Err(DbError::PatchTargetInvalid),
    }
}

/// Inserts `value` at `path`, replacing the root when `path` is empty.
fn pointer_insert(doc: &mut Document, path: &str, value: Document) -> Result<(), DbError> {
    let tokens = pointer_tokens(path)?;
    let Some((last, parents)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    let parent = descend(doc, parents)?;
    match parent {
        Value::Object(fields) => {
            fields.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                // Insertion may target one past the end.
                let idx = array_index(last, items.len().saturating_add(1))?;
                items.insert(idx, value);
            }
            Ok(())
        }
        _ => Err(DbError::PatchTargetInvalid),
    }
}

fn descend<'a>(doc: &'a mut Document, tokens: &[String]) -> Result<&'a mut Document, DbError> {
    let mut current = doc;
    for token in tokens {
        current = match current {
            Value::Object(fields) => fields
                .get_mut(token.as_str())
                .ok_or(DbError::PatchTargetInvalid)?,
            Value::Array(items) => {
                let idx = array_index(token, items.len())?;
                &mut items[idx]
            }
            _ => return Err(DbError::PatchTargetInvalid),
        };
    }
    Ok(current)
}
