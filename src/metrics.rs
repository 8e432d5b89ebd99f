//! Request metrics.
//!
//! Counters are emitted through the `metrics` facade; installing a recorder
//! (and any exporter) is the embedding host's concern. Method labels are
//! restricted to the verbs the gateway recognizes so attacker-controlled
//! strings never become label values.

use metrics::counter;

/// Known HTTP methods used for label cardinality protection.
const KNOWN_METHODS: [&str; 6] = ["GET", "HEAD", "PUT", "POST", "PATCH", "DELETE"];

/// Sanitizes a method name for use as a metrics label.
fn sanitize_method_label(method: &str) -> &'static str {
    KNOWN_METHODS
        .iter()
        .find(|m| **m == method)
        .copied()
        .unwrap_or("__other__")
}

/// Records one incoming HTTP request.
pub(crate) fn record_request(method: &str) {
    counter!("docgate_requests_total", "method" => sanitize_method_label(method)).increment(1);
}

/// Records one completed HTTP response by status class.
pub(crate) fn record_response(status: u16) {
    let class = match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    counter!("docgate_responses_total", "class" => class).increment(1);
}

/// Records one handled WebSocket command frame.
pub(crate) fn record_ws_frame(command: &'static str) {
    counter!("docgate_ws_frames_total", "command" => command).increment(1);
}
