// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between the ferry daemon and its local IPC clients
//! (CLI hosts, the reply-assembly proxy, and the desktop controller).
//!
//! Everything is newline-delimited JSON over a filesystem-namespaced
//! endpoint — a per-user Unix socket or a named pipe on Windows. No TCP
//! socket is ever involved. Each line is one message of the form
//! `{"type": "...", "payload": {...}}`; the adjacently tagged serde enums
//! below produce exactly that shape.
//!
//! # Typical session flow
//!
//! ```text
//! CLI host                              Daemon
//!    │                                     │
//!    │── register_session {sessionId} ────►│  row created, defaults bound
//!    │── pty_output {data} ── × N ────────►│  buffers fed
//!    │                                     │
//!    │◄─ feishu_input {text, images?} ─────│  (user wrote in chat)
//!    │── pty_output {data} ── × N ────────►│  silence → reply posted
//!    │                                     │
//!    │── session_ended {sessionId} ───────►│  summary card, teardown
//! ```
//!
//! Control clients (the GUI) use the `*_request`/`*_response` pairs on the
//! same endpoint; requests are answered in order on the same connection.
//!
//! Unknown `type` tags and malformed payloads are dropped by the receiver
//! without closing the connection — the decoder returning `Err` is the
//! normal path for forward compatibility.

pub mod client;
pub mod message;

pub use client::IpcClient;
pub use message::{
    AssembledMessage, BotConfig, BotKind, BotWarning, ClientMessage, DaemonMessage, LockFile,
    Provider, SessionSnapshot, SessionStatus, ToolUseBlock,
};

/// Encode any protocol message as one newline-terminated JSON line.
pub fn encode_line<T: serde::Serialize>(msg: &T) -> anyhow::Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode a single line into a [`ClientMessage`].
///
/// Returns `Err` for malformed JSON, a missing/unknown `type` tag, or a
/// payload that fails the variant schema. Callers discard such lines.
pub fn decode_client_line(line: &str) -> anyhow::Result<ClientMessage> {
    Ok(serde_json::from_str(line)?)
}

/// Decode a single line into a [`DaemonMessage`].
pub fn decode_daemon_line(line: &str) -> anyhow::Result<DaemonMessage> {
    Ok(serde_json::from_str(line)?)
}
