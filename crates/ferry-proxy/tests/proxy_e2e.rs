// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end proxy behaviour against a stub upstream and a stub daemon
//! socket: verbatim forwarding, SSE teeing into `api_proxy_event`, the
//! suggestion flag, and the 502 path.
//!
//! One test function: upstream resolution reads process environment, which
//! must not race between parallel tests.

#![cfg(unix)]

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;

use ferry_proto::ClientMessage;
use ferry_proxy::{start, ProxyOptions};

const SSE_BODY: &str = concat!(
    "event: message_start\n",
    "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-x\"}}\n\n",
    "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello \"}}\n\n",
    "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"world\"}}\n\n",
    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
    "data: {\"type\":\"message_stop\"}\n\n",
);

/// Minimal HTTP/1.1 stub: reads one request (headers + content-length
/// body), answers with an SSE response, closes the connection.
async fn run_stub_upstream(listener: TcpListener, saw_requests: mpsc::Sender<(String, String)>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let saw = saw_requests.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut tmp = [0u8; 4096];
            let (head, body_start) = loop {
                let n = match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&tmp[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break (String::from_utf8_lossy(&buf[..pos]).to_string(), pos + 4);
                }
            };

            let content_length: usize = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse().ok())?
                })
                .unwrap_or(0);
            let mut body = buf[body_start..].to_vec();
            while body.len() < content_length {
                let n = match stream.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                body.extend_from_slice(&tmp[..n]);
            }

            let request_line = head.lines().next().unwrap_or("").to_string();
            let _ = saw
                .send((request_line, String::from_utf8_lossy(&body).to_string()))
                .await;

            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{SSE_BODY}"
            );
            let _ = stream.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::test]
async fn forwards_verbatim_and_emits_api_proxy_events() {
    // ── Stub upstream ────────────────────────────────────────────────────────
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let (saw_tx, mut saw_rx) = mpsc::channel(8);
    tokio::spawn(run_stub_upstream(upstream_listener, saw_tx));

    // ── Stub daemon endpoint ─────────────────────────────────────────────────
    let dir = tempfile::tempdir().unwrap();
    let endpoint = dir.path().join("daemon.sock");
    let ipc_listener = UnixListener::bind(&endpoint).unwrap();
    let (event_tx, mut event_rx) = mpsc::channel::<ClientMessage>(8);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = ipc_listener.accept().await else {
                return;
            };
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(msg) = ferry_proto::decode_client_line(line.trim()) {
                        let _ = event_tx.send(msg).await;
                    }
                }
            });
        }
    });

    // ── Proxy under test ─────────────────────────────────────────────────────
    std::env::set_var("ANTHROPIC_BASE_URL", format!("http://{upstream_addr}"));
    let handle = start(ProxyOptions {
        tool: "claude".into(),
        session_id: "sess-e2e".into(),
        ipc_endpoint: endpoint.clone(),
    })
    .await
    .unwrap();
    assert_eq!(handle.upstream, format!("http://{upstream_addr}"));

    // ── Phase 1: normal turn is forwarded byte-for-byte and teed ─────────────
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/v1/messages?beta=true", handle.origin()))
        .header("x-api-key", "sk-test")
        .body(r#"{"model":"claude-x","stream":true}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("text/event-stream"));
    let body = resp.text().await.unwrap();
    assert_eq!(body, SSE_BODY, "SSE body must pass through unchanged");

    let (request_line, upstream_body) =
        tokio::time::timeout(Duration::from_secs(5), saw_rx.recv())
            .await
            .unwrap()
            .unwrap();
    assert_eq!(request_line, "POST /v1/messages?beta=true HTTP/1.1");
    assert_eq!(upstream_body, r#"{"model":"claude-x","stream":true}"#);

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("no api_proxy_event arrived")
        .unwrap();
    let ClientMessage::ApiProxyEvent {
        session_id,
        message,
    } = event
    else {
        panic!("expected api_proxy_event, got {event:?}");
    };
    assert_eq!(session_id, "sess-e2e");
    assert_eq!(message.model, "claude-x");
    assert_eq!(message.text_content, "Hello world");
    assert_eq!(message.stop_reason, "end_turn");
    assert!(!message.is_suggestion);

    // ── Phase 2: suggestion-mode request flags the assembled turn ────────────
    let _ = client
        .post(format!("{}/v1/messages", handle.origin()))
        .body(r#"{"system":"SUGGESTION MODE: complete the user's input"}"#)
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("no suggestion event arrived")
        .unwrap();
    let ClientMessage::ApiProxyEvent { message, .. } = event else {
        panic!("expected api_proxy_event");
    };
    assert!(message.is_suggestion, "suggestion marker must be carried");

    // ── Phase 3: dead upstream yields a plain-text 502 ───────────────────────
    std::env::set_var("ANTHROPIC_BASE_URL", "http://127.0.0.1:9");
    let dead = start(ProxyOptions {
        tool: "claude".into(),
        session_id: "sess-dead".into(),
        ipc_endpoint: endpoint,
    })
    .await
    .unwrap();
    let resp = client
        .post(format!("{}/v1/messages", dead.origin()))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 502);
    let text = resp.text().await.unwrap();
    assert!(text.contains("upstream request failed"), "got: {text}");

    std::env::remove_var("ANTHROPIC_BASE_URL");
}
