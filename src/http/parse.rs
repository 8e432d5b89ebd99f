//! Request parsing: method mapping, the path grammar, and hint headers.
//!
//! The REST surface is deliberately tiny and strict:
//!
//! ```text
//! path       := "/" | "/" collection | "/" collection "/" id
//! collection := 1..=128 bytes, any byte that is not '/'
//! id         := decimal digits, i64, >= 1
//! ```
//!
//! Percent-encoding is NOT decoded anywhere: the collection segment is
//! matched on the raw path bytes, so `%20` is three literal characters of a
//! collection name. A trailing empty id segment (`/coll/`) is treated the
//! same as `/coll`.

use axum::http::HeaderMap;

use crate::config::COLLECTION_NAME_MAX;

/// The six methods the gateway recognizes. Anything else is a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Patch,
    Delete,
}

impl Method {
    /// Maps an HTTP method to the gateway's set, or `None` for a 400.
    #[must_use]
    pub fn from_http(method: &axum::http::Method) -> Option<Self> {
        match method.as_str() {
            "GET" => Some(Self::Get),
            "HEAD" => Some(Self::Head),
            "PUT" => Some(Self::Put),
            "POST" => Some(Self::Post),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// What the URL path resolved to.
#[derive(Debug, PartialEq, Eq)]
pub enum Target {
    /// `POST /` — the query endpoint.
    Query,
    /// `POST /{collection}` — insert with an allocated id.
    Collection(String),
    /// `/{collection}/{id}` — document addressed operations.
    Document(String, i64),
}

impl Target {
    /// The collection this target addresses, if any.
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        match self {
            Self::Query => None,
            Self::Collection(coll) | Self::Document(coll, _) => Some(coll),
        }
    }
}

/// Resolves `path` against the grammar for the given method.
///
/// Returns `None` for any combination that must be rejected with 400.
#[must_use]
pub fn parse_path(path: &str, method: Method) -> Option<Target> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        // Only the query endpoint lives at the root.
        return (method == Method::Post).then_some(Target::Query);
    }

    match rest.split_once('/') {
        None | Some((_, "")) => {
            let coll = rest.strip_suffix('/').unwrap_or(rest);
            if coll.is_empty() || coll.len() > COLLECTION_NAME_MAX {
                return None;
            }
            // A bare collection is only addressable by insert.
            (method == Method::Post).then(|| Target::Collection(coll.to_string()))
        }
        Some((coll, id)) => {
            if coll.is_empty() || coll.len() > COLLECTION_NAME_MAX {
                return None;
            }
            let id: i64 = id.parse().ok()?;
            if id < 1 || method == Method::Post {
                return None;
            }
            Some(Target::Document(coll.to_string(), id))
        }
    }
}

/// Client hints parsed from the `X-Hints` header.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hints {
    /// Prefix the query result stream with the execution plan.
    pub explain: bool,
}

/// Parses the `X-Hints` header: comma-separated tokens, of which `explain`
/// is the only one recognized; unknown tokens are ignored.
///
/// # Errors
///
/// `Err(())` when the header occurs more than once or is not valid ASCII;
/// callers reply 400.
pub fn parse_hints(headers: &HeaderMap) -> Result<Hints, ()> {
    let mut values = headers.get_all("x-hints").iter();
    let Some(value) = values.next() else {
        return Ok(Hints::default());
    };
    if values.next().is_some() {
        return Err(());
    }
    let value = value.to_str().map_err(|_| ())?;
    Ok(Hints {
        explain: value.split(',').any(|token| token.trim() == "explain"),
    })
}
