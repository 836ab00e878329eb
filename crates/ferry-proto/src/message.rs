// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Message types for the IPC protocol.
//!
//! Payload fields are camelCase on the wire (the GUI and the CLI host speak
//! that dialect); type tags are snake_case. Both directions are modelled as
//! one enum each so a connection can carry events and request/response pairs
//! interleaved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ferry_config::schema::{
    ConfigDocument, DefaultBots, InteractiveBotConfig, PushBotConfig, Settings,
};

// ── Client → daemon ───────────────────────────────────────────────────────────

/// Everything an IPC client may send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Announce a CLI-host session. Idempotent; re-registering a live
    /// session refreshes timestamps and keeps its bot bindings.
    #[serde(rename_all = "camelCase")]
    RegisterSession {
        session_id: String,
        /// Command name as invoked (`claude`, `codex`, `aider`, ...).
        cli: String,
        /// Absolute working directory of the wrapped tool.
        cwd: String,
        /// True when the CLI host interposed the reply-assembly proxy.
        #[serde(default)]
        proxy_mode: bool,
    },

    /// A chunk of raw PTY output, lossily UTF-8 decoded by the CLI host.
    #[serde(rename_all = "camelCase")]
    PtyOutput { session_id: String, data: String },

    /// The wrapped tool exited (or the user closed the terminal).
    #[serde(rename_all = "camelCase")]
    SessionEnded { session_id: String },

    /// One assembled assistant turn captured by the in-CLI API proxy.
    #[serde(rename_all = "camelCase")]
    ApiProxyEvent {
        session_id: String,
        message: AssembledMessage,
    },

    /// Completion hook fired by the codex CLI (configured via `notify`).
    #[serde(rename_all = "camelCase")]
    CodexNotify { cwd: String, message: String },

    /// Completion hook fired by the claude CLI (Stop hook).
    #[serde(rename_all = "camelCase")]
    ClaudeNotify { cwd: String, message: String },

    // ── Control requests (GUI / `ferry` CLI) ─────────────────────────────────
    StatusRequest {},
    StopRequest {},
    ListBotsRequest {},
    SaveBotRequest {
        bot: BotConfig,
    },
    #[serde(rename_all = "camelCase")]
    DeleteBotRequest { bot_id: String },
    #[serde(rename_all = "camelCase")]
    BindBotRequest {
        session_id: String,
        kind: BotKind,
        bot_id: String,
    },
    #[serde(rename_all = "camelCase")]
    UnbindBotRequest { session_id: String, kind: BotKind },
    #[serde(rename_all = "camelCase")]
    TestBotRequest { kind: BotKind, bot_id: String },
    GetConfigRequest {},
    SaveConfigRequest {
        settings: Settings,
    },
    #[serde(rename_all = "camelCase")]
    SetDefaultBotRequest {
        kind: BotKind,
        /// `None` clears the default.
        bot_id: Option<String>,
    },
    GetDefaultsRequest {},
    CheckCodexConfigRequest {},
    SetupCodexConfigRequest {},
    CheckClaudeConfigRequest {},
    SetupClaudeConfigRequest {},
}

// ── Daemon → client ───────────────────────────────────────────────────────────

/// Everything the daemon may send to an IPC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// A user chat message to inject as typed input into the PTY.
    ///
    /// `text` already carries its trailing newline. The Enter-retry hints
    /// exist because some Windows terminals swallow the first CR while the
    /// TUI is redrawing.
    #[serde(rename_all = "camelCase")]
    FeishuInput {
        session_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
        enter_retry_count: u32,
        enter_retry_interval_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    StatusResponse {
        pid: u32,
        started_at: DateTime<Utc>,
        sessions: Vec<SessionSnapshot>,
        warnings: Vec<BotWarning>,
    },
    StopResponse {
        ok: bool,
    },
    ListBotsResponse {
        interactive: Vec<InteractiveBotConfig>,
        push: Vec<PushBotConfig>,
    },
    SaveBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DeleteBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BindBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    UnbindBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TestBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetConfigResponse {
        config: ConfigDocument,
    },
    SaveConfigResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SetDefaultBotResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetDefaultsResponse {
        defaults: DefaultBots,
    },
    CheckCodexConfigResponse {
        configured: bool,
        path: String,
    },
    SetupCodexConfigResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    CheckClaudeConfigResponse {
        configured: bool,
        path: String,
    },
    SetupClaudeConfigResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

// ── Supporting types ──────────────────────────────────────────────────────────

/// Which of the two bot families an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotKind {
    Interactive,
    Push,
}

/// A bot configuration in transit (save_bot payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BotConfig {
    Interactive(InteractiveBotConfig),
    Push(PushBotConfig),
}

/// Lifecycle state of a bridged session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Registered, no PTY output seen yet.
    Listening,
    /// PTY output has started flowing.
    ProxyOn,
    /// Terminal state; never left.
    Ended,
}

/// Summary of one session as reported by `status_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub cli: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive_bot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_bot_id: Option<String>,
    pub push_enabled: bool,
    pub proxy_mode: bool,
}

/// A user-visible connection warning surfaced on `status_response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotWarning {
    pub bot_id: String,
    pub message: String,
}

// ── AssembledMessage ──────────────────────────────────────────────────────────

/// Upstream provider whose SSE dialect produced an [`AssembledMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    Openai,
}

/// One tool invocation captured from the stream.
///
/// `input` is the provider's partial-JSON argument string exactly as
/// accumulated — deliberately not parsed here, so a truncated stream still
/// round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub name: String,
    pub input: String,
}

/// The normalized output of one assistant turn, provider-independent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssembledMessage {
    pub provider: Provider,
    pub model: String,
    /// Free-form; notable values: `end_turn`, `stop`, `tool_use`,
    /// `tool_calls`.
    pub stop_reason: String,
    pub text_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_blocks: Option<Vec<ToolUseBlock>>,
    pub is_suggestion: bool,
    pub completed_at: DateTime<Utc>,
}

// ── Lock file ─────────────────────────────────────────────────────────────────

/// On-disk shape of `~/.ferry/daemon.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: u32,
    /// Endpoint path the daemon is serving on.
    pub ipc: String,
    pub started_at: DateTime<Utc>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_session_wire_shape() {
        let msg = ClientMessage::RegisterSession {
            session_id: "s1".into(),
            cli: "claude".into(),
            cwd: "/home/u/proj".into(),
            proxy_mode: true,
        };
        let v: serde_json::Value = serde_json::from_str(&crate::encode_line(&msg).unwrap()).unwrap();
        assert_eq!(v["type"], "register_session");
        assert_eq!(v["payload"]["sessionId"], "s1");
        assert_eq!(v["payload"]["proxyMode"], true);
    }

    #[test]
    fn proxy_mode_defaults_to_false() {
        let line = r#"{"type":"register_session","payload":{"sessionId":"s2","cli":"codex","cwd":"/tmp"}}"#;
        let msg = crate::decode_client_line(line).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::RegisterSession { proxy_mode: false, .. }
        ));
    }

    #[test]
    fn unknown_type_tag_is_an_error_not_a_panic() {
        let line = r#"{"type":"time_travel","payload":{}}"#;
        assert!(crate::decode_client_line(line).is_err());
    }

    #[test]
    fn missing_payload_field_is_an_error() {
        let line = r#"{"type":"pty_output","payload":{"sessionId":"s"}}"#;
        assert!(crate::decode_client_line(line).is_err());
    }

    #[test]
    fn feishu_input_omits_empty_images() {
        let msg = DaemonMessage::FeishuInput {
            session_id: "s1".into(),
            text: "ping\n".into(),
            images: vec![],
            enter_retry_count: 3,
            enter_retry_interval_ms: 150,
        };
        let line = crate::encode_line(&msg).unwrap();
        assert!(!line.contains("images"), "empty images[] must be omitted: {line}");
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "feishu_input");
        assert_eq!(v["payload"]["enterRetryCount"], 3);
    }

    #[test]
    fn assembled_message_round_trip() {
        let msg = AssembledMessage {
            provider: Provider::Openai,
            model: "gpt-4o".into(),
            stop_reason: "tool_calls".into(),
            text_content: String::new(),
            tool_use_blocks: Some(vec![ToolUseBlock {
                name: "get_weather".into(),
                input: r#"{"city":"Tokyo"}"#.into(),
            }]),
            is_suggestion: false,
            completed_at: Utc::now(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AssembledMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider, Provider::Openai);
        assert_eq!(back.tool_use_blocks.unwrap()[0].name, "get_weather");
    }

    #[test]
    fn bot_config_is_internally_tagged_by_kind() {
        let line = r#"{"kind":"push","id":"p1","name":"alerts","webhookUrl":"https://open.feishu.cn/open-apis/bot/v2/hook/x"}"#;
        let bot: BotConfig = serde_json::from_str(line).unwrap();
        assert!(matches!(bot, BotConfig::Push(ref p) if p.id == "p1"));
    }

    #[test]
    fn session_status_serializes_as_snake_case() {
        let s = serde_json::to_string(&SessionStatus::ProxyOn).unwrap();
        assert_eq!(s, "\"proxy_on\"");
    }
}
