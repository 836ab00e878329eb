// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The loopback reverse proxy itself.
//!
//! Every request is forwarded verbatim to the resolved upstream origin —
//! method, path+query, body and headers (minus hop-by-hop), with the Host
//! header rewritten by the HTTP client. Responses stream back byte for
//! byte. A 2xx response advertising `text/event-stream` is additionally
//! teed into the provider's assembler; everything else passes through
//! untouched.
//!
//! Failure semantics: an unreachable upstream yields a plain-text 502; a
//! stream that dies midway still emits whatever text was assembled.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::Response;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ferry_proto::{AssembledMessage, ClientMessage, IpcClient};
use ferry_sse::{AnthropicAssembler, Assembler, OpenAiAssembler, SseFramer};

use crate::upstream::{resolve_upstream, tool_kind, ToolKind};

/// Marker in a request body identifying an in-place suggestion call whose
/// reply must never reach chat.
const SUGGESTION_MARKER: &[u8] = b"SUGGESTION MODE";

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// The wrapped tool's command name as invoked.
    pub tool: String,
    pub session_id: String,
    /// The daemon's IPC endpoint to deliver `api_proxy_event`s to.
    pub ipc_endpoint: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProxyHandle {
    pub local_addr: SocketAddr,
    pub upstream: String,
    pub kind: ToolKind,
}

impl ProxyHandle {
    pub fn origin(&self) -> String {
        format!("http://{}", self.local_addr)
    }
}

#[derive(Clone)]
struct ProxyState {
    upstream: String,
    client: reqwest::Client,
    kind: ToolKind,
    events: mpsc::Sender<AssembledMessage>,
}

/// Bind the loopback listener and start serving in the background.
pub async fn start(options: ProxyOptions) -> anyhow::Result<ProxyHandle> {
    let kind = tool_kind(&options.tool)
        .with_context(|| format!("tool {:?} has no reply-assembly support", options.tool))?;

    let claude_settings = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("settings.json");
    let upstream = resolve_upstream(kind, |k| std::env::var(k).ok(), &claude_settings);

    let (events_tx, events_rx) = mpsc::channel(64);
    tokio::spawn(forward_events(
        events_rx,
        options.ipc_endpoint.clone(),
        options.session_id.clone(),
    ));

    let state = ProxyState {
        upstream: upstream.clone(),
        client: reqwest::Client::new(),
        kind,
        events: events_tx,
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("binding proxy listener")?;
    let local_addr = listener.local_addr()?;

    let app = axum::Router::new().fallback(forward).with_state(state);
    tokio::spawn(axum::serve(listener, app).into_future());

    info!(%local_addr, upstream = %upstream, ?kind, "reply-assembly proxy listening");
    Ok(ProxyHandle {
        local_addr,
        upstream,
        kind,
    })
}

// ── Request forwarding ────────────────────────────────────────────────────────

async fn forward(State(state): State<ProxyState>, req: axum::extract::Request) -> Response {
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();

    // The body is buffered so it can be inspected for the suggestion
    // marker; request bodies here are chat completions, not uploads.
    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => return plain_error(StatusCode::BAD_REQUEST, &format!("bad request body: {e}")),
    };
    let suggestion = contains_marker(&body, SUGGESTION_MARKER);

    let url = format!("{}{}", state.upstream, path_and_query);
    let mut upstream_req = state.client.request(method, &url);
    for (name, value) in headers.iter() {
        if !skip_request_header(name) {
            upstream_req = upstream_req.header(name, value);
        }
    }

    let upstream_resp = match upstream_req.body(body.to_vec()).send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(url = %url, "upstream request failed: {e}");
            return plain_error(
                StatusCode::BAD_GATEWAY,
                &format!("ferry proxy: upstream request failed: {e}"),
            );
        }
    };

    let status = upstream_resp.status();
    let resp_headers = upstream_resp.headers().clone();
    let is_sse = status.is_success() && is_event_stream(&resp_headers);

    let byte_stream = upstream_resp.bytes_stream();
    let body = if is_sse {
        debug!(url = %url, suggestion, "teeing SSE response");
        let (tee_tx, tee_rx) = mpsc::unbounded_channel();
        tokio::spawn(assemble(tee_rx, state.kind, suggestion, state.events.clone()));

        Body::from_stream(byte_stream.map(move |chunk| match chunk {
            Ok(bytes) => {
                let _ = tee_tx.send(TeeMsg::Chunk(bytes.clone()));
                Ok::<_, std::io::Error>(bytes)
            }
            Err(e) => {
                // Mid-stream failure: the assembler flushes what it has.
                let _ = tee_tx.send(TeeMsg::Failed);
                Err(std::io::Error::other(e))
            }
        }))
    } else {
        Body::from_stream(
            byte_stream.map(|chunk| chunk.map_err(std::io::Error::other)),
        )
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in resp_headers.iter() {
        if !skip_response_header(name) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(body)
        .unwrap_or_else(|e| plain_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
}

// ── SSE tee → assembler ───────────────────────────────────────────────────────

enum TeeMsg {
    Chunk(Bytes),
    Failed,
}

async fn assemble(
    mut rx: mpsc::UnboundedReceiver<TeeMsg>,
    kind: ToolKind,
    suggestion: bool,
    events: mpsc::Sender<AssembledMessage>,
) {
    let mut framer = SseFramer::new();
    let mut assembler = match kind {
        ToolKind::Claude => Assembler::Anthropic(AnthropicAssembler::new()),
        ToolKind::Codex => Assembler::Openai(OpenAiAssembler::new()),
    };
    assembler.set_suggestion(suggestion);

    while let Some(msg) = rx.recv().await {
        match msg {
            TeeMsg::Chunk(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                for ev in framer.feed(&text) {
                    if let Some(assembled) = assembler.feed(&ev) {
                        if events.send(assembled).await.is_err() {
                            return;
                        }
                    }
                }
            }
            TeeMsg::Failed => {
                if let Some(partial) = assembler.finish_partial() {
                    let _ = events.send(partial).await;
                }
                return;
            }
        }
    }
}

/// Relay assembled turns to the daemon, reconnecting once per message on
/// failure. The proxy must keep serving even with no daemon around.
async fn forward_events(
    mut rx: mpsc::Receiver<AssembledMessage>,
    endpoint: PathBuf,
    session_id: String,
) {
    let mut client: Option<IpcClient> = None;
    while let Some(message) = rx.recv().await {
        let event = ClientMessage::ApiProxyEvent {
            session_id: session_id.clone(),
            message,
        };
        for _attempt in 0..2 {
            if client.is_none() {
                client = match IpcClient::connect(&endpoint).await {
                    Ok(c) => Some(c),
                    Err(e) => {
                        debug!("daemon not reachable: {e}");
                        break;
                    }
                };
            }
            match client.as_mut() {
                Some(c) => match c.send(&event).await {
                    Ok(()) => break,
                    Err(_) => client = None, // retry once with a new connection
                },
                None => break,
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn contains_marker(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("text/event-stream"))
        .unwrap_or(false)
}

/// Hop-by-hop and transport headers the upstream request must not inherit.
/// `accept-encoding` is stripped so the reply arrives uncompressed — the
/// tee reads the same bytes the client does.
fn skip_request_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
            | "accept-encoding"
    )
}

fn skip_response_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection" | "keep-alive" | "transfer-encoding" | "content-length"
    )
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_proto::Provider;

    #[test]
    fn suggestion_marker_is_found_anywhere_in_the_body() {
        assert!(contains_marker(
            br#"{"system":"SUGGESTION MODE: complete the line"}"#,
            SUGGESTION_MARKER
        ));
        assert!(!contains_marker(b"{\"system\":\"normal\"}", SUGGESTION_MARKER));
    }

    #[test]
    fn event_stream_detection_is_case_insensitive_and_param_tolerant() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "Text/Event-Stream; charset=utf-8".parse().unwrap(),
        );
        assert!(is_event_stream(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        assert!(!is_event_stream(&headers));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        assert!(skip_request_header(&HeaderName::from_static("host")));
        assert!(skip_request_header(&HeaderName::from_static("accept-encoding")));
        assert!(!skip_request_header(&HeaderName::from_static("x-api-key")));
        assert!(!skip_request_header(&HeaderName::from_static("anthropic-version")));
        assert!(skip_response_header(&HeaderName::from_static("transfer-encoding")));
        assert!(!skip_response_header(&HeaderName::from_static("content-type")));
    }

    #[tokio::test]
    async fn tee_assembles_an_anthropic_turn() {
        let (tee_tx, tee_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        tokio::spawn(assemble(tee_rx, ToolKind::Claude, false, events_tx));

        let stream = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-x\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello world\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        // Split mid-record to exercise reassembly across chunks.
        let (a, b) = stream.split_at(40);
        tee_tx.send(TeeMsg::Chunk(Bytes::from(a.to_string()))).unwrap();
        tee_tx.send(TeeMsg::Chunk(Bytes::from(b.to_string()))).unwrap();
        drop(tee_tx);

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), events_rx.recv())
            .await
            .expect("assembler produced nothing")
            .unwrap();
        assert_eq!(msg.provider, Provider::Anthropic);
        assert_eq!(msg.text_content, "Hello world");
        assert_eq!(msg.stop_reason, "end_turn");
    }

    #[tokio::test]
    async fn mid_stream_failure_still_emits_partial_text() {
        let (tee_tx, tee_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        tokio::spawn(assemble(tee_rx, ToolKind::Claude, false, events_tx));

        tee_tx
            .send(TeeMsg::Chunk(Bytes::from(
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"half an answer\"}}\n\n",
            )))
            .unwrap();
        tee_tx.send(TeeMsg::Failed).unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), events_rx.recv())
            .await
            .expect("partial text must be emitted")
            .unwrap();
        assert_eq!(msg.text_content, "half an answer");
    }

    #[tokio::test]
    async fn suggestion_flag_reaches_the_assembled_message() {
        let (tee_tx, tee_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::channel(8);
        tokio::spawn(assemble(tee_rx, ToolKind::Codex, true, events_tx));

        tee_tx
            .send(TeeMsg::Chunk(Bytes::from(
                "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n",
            )))
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.is_suggestion);
    }
}
