// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `ferry notify <tool>` — relay a completion hook to the daemon.
//!
//! The two hook dialects differ:
//!
//! - **codex** calls its `notify` command with the payload JSON as the
//!   final argument: `{"type":"agent-turn-complete",
//!   "last-assistant-message":"...","cwd":"..."}`.
//! - **claude** pipes the Stop-hook payload to stdin:
//!   `{"session_id":"...","transcript_path":"...","cwd":"..."}` — the
//!   final reply text itself lives in the transcript, so the last
//!   assistant entry is read back out of it.

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use serde_json::Value;

use ferry_proto::{ClientMessage, IpcClient};

use crate::cli::NotifyTool;

pub async fn run(tool: NotifyTool, payload_arg: Option<String>) -> anyhow::Result<()> {
    let payload = match payload_arg {
        Some(arg) if !arg.trim().is_empty() => arg,
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading hook payload from stdin")?;
            buf
        }
    };
    let payload: Value = serde_json::from_str(payload.trim())
        .context("hook payload is not valid JSON")?;

    let cwd = payload["cwd"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string())
        })
        .context("hook payload has no cwd and none can be derived")?;

    let message = match tool {
        NotifyTool::Codex => payload["last-assistant-message"]
            .as_str()
            .or_else(|| payload["last_assistant_message"].as_str())
            .unwrap_or("")
            .to_string(),
        NotifyTool::Claude => {
            // The Stop payload carries no text; pull it from the transcript.
            payload["transcript_path"]
                .as_str()
                .and_then(|p| last_assistant_message(Path::new(p)))
                .unwrap_or_default()
        }
    };

    if message.trim().is_empty() {
        // Nothing to forward; not an error — tool turns can end silently.
        return Ok(());
    }

    let msg = match tool {
        NotifyTool::Codex => ClientMessage::CodexNotify { cwd, message },
        NotifyTool::Claude => ClientMessage::ClaudeNotify { cwd, message },
    };

    let mut client = IpcClient::connect(&ferry_config::paths::ipc_endpoint())
        .await
        .context("ferry daemon is not running")?;
    client.send(&msg).await
}

/// Scan a claude transcript (JSONL) backwards for the last assistant turn
/// and join its text blocks.
fn last_assistant_message(transcript: &Path) -> Option<String> {
    let text = std::fs::read_to_string(transcript).ok()?;
    for line in text.lines().rev() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry["type"].as_str() != Some("assistant") {
            continue;
        }
        let content = entry["message"]["content"].as_array()?;
        let joined: Vec<&str> = content
            .iter()
            .filter(|block| block["type"].as_str() == Some("text"))
            .filter_map(|block| block["text"].as_str())
            .collect();
        if !joined.is_empty() {
            return Some(joined.join("\n"));
        }
    }
    None
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_scan_finds_the_last_assistant_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"type":"user","message":{"content":"hi"}}"#,
                "\n",
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}"#,
                "\n",
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"x"},{"type":"text","text":"final answer"}]}}"#,
                "\n",
            ),
        )
        .unwrap();
        assert_eq!(
            last_assistant_message(&path).as_deref(),
            Some("final answer")
        );
    }

    #[test]
    fn transcript_without_assistant_entries_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");
        std::fs::write(&path, r#"{"type":"user","message":{"content":"hi"}}"#).unwrap();
        assert!(last_assistant_message(&path).is_none());
    }

    #[test]
    fn missing_transcript_yields_none() {
        assert!(last_assistant_message(Path::new("/definitely/not/here.jsonl")).is_none());
    }
}
