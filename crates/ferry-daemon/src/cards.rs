// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Outbound message composition: interactive cards, webhook payload
//! envelopes, and the one-line rendering of tool activity.

use serde_json::{json, Value};

use ferry_proto::ToolUseBlock;

use crate::registry::SessionRow;

/// Argument keys worth surfacing for a tool call, most interesting first.
const PREFERRED_ARG_KEYS: &[&str] = &["command", "file_path", "pattern", "query", "workdir"];

/// Cap for raw-JSON fallbacks in tool lines.
const RAW_ARGS_LIMIT: usize = 120;

// ── Tool activity lines ───────────────────────────────────────────────────────

/// Render tool-use blocks as `tool <name>: <key arg>` lines.
///
/// The selected argument is the first preferred key present; a call with
/// none of them shows its first argument value, and unparseable input falls
/// back to the raw (truncated) JSON string.
pub fn format_tool_activity(blocks: &[ToolUseBlock]) -> String {
    blocks
        .iter()
        .map(|block| format!("tool {}: {}", block.name, summarize_args(&block.input)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn summarize_args(input: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(input).ok();
    if let Some(Value::Object(map)) = parsed {
        for key in PREFERRED_ARG_KEYS {
            if let Some(v) = map.get(*key) {
                return display_value(v);
            }
        }
        if let Some((_, v)) = map.iter().next() {
            return display_value(v);
        }
    }
    clip(input.trim(), RAW_ARGS_LIMIT)
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => clip(s, RAW_ARGS_LIMIT),
        other => clip(&other.to_string(), RAW_ARGS_LIMIT),
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

// ── Cards ─────────────────────────────────────────────────────────────────────

/// The end-of-session summary card.
pub fn session_summary_card(row: &SessionRow, summary_tail: &str) -> Value {
    let body = if summary_tail.trim().is_empty() {
        "session ended (no output captured)".to_string()
    } else {
        summary_tail.to_string()
    };

    json!({
        "config": { "wide_screen_mode": true },
        "header": {
            "template": "blue",
            "title": { "tag": "plain_text", "content": format!("{} session ended", row.cli) }
        },
        "elements": [
            {
                "tag": "div",
                "text": {
                    "tag": "lark_md",
                    "content": format!("**cwd** {}\n**started** {}", row.cwd, row.started_at.to_rfc3339())
                }
            },
            { "tag": "hr" },
            {
                "tag": "div",
                "text": { "tag": "plain_text", "content": body }
            }
        ]
    })
}

/// Answer to a chat message that has no session to go to.
pub fn no_session_card() -> Value {
    json!({
        "config": { "wide_screen_mode": true },
        "header": {
            "template": "orange",
            "title": { "tag": "plain_text", "content": "No active session" }
        },
        "elements": [{
            "tag": "div",
            "text": {
                "tag": "lark_md",
                "content": "No terminal session is bound to this bot right now. \
                            Start the CLI host and bind the session, then try again."
            }
        }]
    })
}

// ── Webhook payload envelopes ─────────────────────────────────────────────────

pub fn webhook_card(card: Value) -> Value {
    json!({ "msg_type": "interactive", "card": card })
}

pub fn webhook_post(post_body: Value) -> Value {
    json!({ "msg_type": "post", "content": { "post": post_body } })
}

pub fn webhook_text(text: &str) -> Value {
    json!({ "msg_type": "text", "content": { "text": text } })
}

// ── Unit tests ────────────────────────────────────────────────────────────────
