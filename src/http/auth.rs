//! Token admission.
//!
//! Runs ahead of dispatch for both plain requests and WebSocket upgrades.
//! When no access token is configured every request proceeds. Otherwise the
//! `X-Access-Token` header decides: a single matching value admits the
//! request, a mismatch is a 403, a repeated header is a 400, and a missing
//! header is a 401 — unless anonymous reads are enabled and the request is
//! in the anonymous-eligible class, in which case the request proceeds with
//! the `read_anon` marker that downstream mutation paths turn into a 403.

use axum::http::{HeaderMap, StatusCode};

use crate::config::GatewayConfig;

/// Outcome of the token gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed. `read_anon` is set when the request was admitted without a
    /// token under the anonymous-read policy.
    Granted { read_anon: bool },
    /// Reply with this status and stop.
    Denied(StatusCode),
}

/// Applies the token policy to a request.
///
/// `anon_eligible` is whether this request belongs to the anonymous-read
/// class (GET, HEAD, a root query POST, or a WebSocket upgrade).
#[must_use]
pub fn admit(config: &GatewayConfig, headers: &HeaderMap, anon_eligible: bool) -> Admission {
    let Some(token) = config.access_token.as_deref() else {
        return Admission::Granted { read_anon: false };
    };

    let mut values = headers.get_all("x-access-token").iter();
    let Some(presented) = values.next() else {
        if config.read_anon && anon_eligible {
            return Admission::Granted { read_anon: true };
        }
        return Admission::Denied(StatusCode::UNAUTHORIZED);
    };
    if values.next().is_some() {
        return Admission::Denied(StatusCode::BAD_REQUEST);
    }

    if constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        Admission::Granted { read_anon: false }
    } else {
        Admission::Denied(StatusCode::FORBIDDEN)
    }
}

/// Byte equality that does not short-circuit on the first mismatch.
///
/// The length check still leaks length, which is not secret here.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
