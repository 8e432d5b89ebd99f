//! Streaming query tests, including wire-level chunked-framing assertions
//! over a raw TCP connection.

mod common;

use common::TestGateway;
use docgate::Database;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Splits a query response body into `(id, document)` frames.
fn parse_frames(body: &str) -> Vec<(i64, Value)> {
    body.split("\r\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            let (id, doc) = frame.split_once('\t').expect("id TAB document");
            (id.parse().unwrap(), serde_json::from_str(doc).unwrap())
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn query_streams_documents_in_id_order() {
    let gw = TestGateway::start(|_| {});
    for (id, name) in [(3, "c"), (1, "a"), (2, "b")] {
        gw.db.put("users", &json!({"name": name}), id).unwrap();
    }

    let resp = gw
        .client
        .post(gw.url("/"))
        .body("@users/*")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let body = resp.text().await.unwrap();
    assert!(body.ends_with("\r\n"));

    let frames = parse_frames(&body);
    assert_eq!(frames.len(), 3);
    assert_eq!(
        frames.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(frames[0].1, json!({"name": "a"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn filter_narrows_the_result_set() {
    let gw = TestGateway::start(|_| {});
    gw.db.put("users", &json!({"name": "ada"}), 1).unwrap();
    gw.db.put("users", &json!({"city": "oslo"}), 2).unwrap();

    let body = gw
        .client
        .post(gw.url("/"))
        .body("@users/[name = *]")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn explain_hint_prepends_the_plan_block() {
    let gw = TestGateway::start(|_| {});
    gw.db.put("users", &json!({"name": "ada"}), 1).unwrap();

    let resp = gw
        .client
        .post(gw.url("/"))
        .header("X-Hints", "explain")
        .body("@users/[name = *]")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.text().await.unwrap();

    let separators = body.matches("--------------------").count();
    assert_eq!(separators, 1);
    let (plan, frames) = body.split_once("--------------------").unwrap();
    assert!(plan.contains("collection: users"));
    assert_eq!(parse_frames(frames).len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_result_set_is_an_empty_200() {
    let gw = TestGateway::start(|_| {});
    let resp = gw
        .client
        .post(gw.url("/"))
        .body("@nothing/*")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.text().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn large_result_sets_span_multiple_chunks() {
    let gw = TestGateway::start(|_| {});
    let filler = "x".repeat(512);
    for id in 1..=64 {
        gw.db
            .put("bulk", &json!({"filler": filler, "id": id}), id)
            .unwrap();
    }

    let body = gw
        .client
        .post(gw.url("/"))
        .body("@bulk/*")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let frames = parse_frames(&body);
    assert_eq!(frames.len(), 64);
    assert_eq!(frames[63].1["id"], json!(64));
}

#[tokio::test(flavor = "multi_thread")]
async fn anonymous_apply_query_is_403() {
    let gw = TestGateway::start(|config| {
        config.access_token = Some("tok".to_string());
        config.read_anon = true;
    });
    gw.db.put("users", &json!({"n": 1}), 1).unwrap();

    let resp = gw
        .client
        .post(gw.url("/"))
        .body(r#"@users/* | apply {"n": 2}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(gw.db.get("users", 1).unwrap(), json!({"n": 1}));

    // With the token the same query runs and mutates.
    let resp = gw
        .client
        .post(gw.url("/"))
        .header("X-Access-Token", "tok")
        .body(r#"@users/* | apply {"n": 2}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(gw.db.get("users", 1).unwrap(), json!({"n": 2}));
}

#[tokio::test(flavor = "multi_thread")]
async fn query_parse_error_is_400_with_diagnostic() {
    let gw = TestGateway::start(|_| {});
    let resp = gw
        .client
        .post(gw.url("/"))
        .body("@users")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.text().await.unwrap().contains("expected '/'"));
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_query_body_is_400() {
    let gw = TestGateway::start(|_| {});
    let resp = gw.client.post(gw.url("/")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

/// Wire-level check: the query response is HTTP/1.1 chunked transfer
/// encoding terminated by the zero-length chunk.
#[tokio::test(flavor = "multi_thread")]
async fn query_response_is_chunk_encoded_on_the_wire() {
    let gw = TestGateway::start(|_| {});
    gw.db.put("users", &json!({"name": "ada"}), 1).unwrap();

    let mut stream = TcpStream::connect(gw.addr).await.unwrap();
    let query = "@users/*";
    let request = format!(
        "POST / HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{query}",
        gw.addr,
        query.len(),
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8_lossy(&raw);

    let (head, body) = raw.split_once("\r\n\r\n").expect("header/body split");
    assert!(head.starts_with("HTTP/1.1 200"));
    assert!(
        head.to_ascii_lowercase()
            .contains("transfer-encoding: chunked")
    );
    // Terminating chunk.
    assert!(body.ends_with("0\r\n\r\n"));
    // The first chunk's payload starts with the first document frame.
    let (size_line, rest) = body.split_once("\r\n").expect("chunk size line");
    let chunk_len = usize::from_str_radix(size_line.trim(), 16).expect("hex chunk size");
    assert!(rest.len() >= chunk_len);
    assert!(rest.starts_with("\r\n1\t"));
}
