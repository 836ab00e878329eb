// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The configuration document and its sections.
//!
//! Field names are camelCase on disk — the document is shared with the
//! desktop controller, which edits it through the daemon's IPC surface
//! rather than touching the file directly.

use serde::{Deserialize, Serialize};

/// The whole of `~/.ferry/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub bots: BotLists,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub defaults: DefaultBots,
    #[serde(default)]
    pub input: InputConfig,
    /// Emoji token used for the "message seen" acknowledgment reaction.
    /// Kept configurable: the service accepts several kinds and the right
    /// one is a matter of workspace taste.
    #[serde(default = "default_ack_emoji")]
    pub ack_emoji: String,
}

fn default_ack_emoji() -> String {
    "EYES".to_string()
}

impl Default for ConfigDocument {
    fn default() -> Self {
        Self {
            bots: BotLists::default(),
            reconnect: ReconnectConfig::default(),
            push: PushConfig::default(),
            defaults: DefaultBots::default(),
            input: InputConfig::default(),
            ack_emoji: default_ack_emoji(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotLists {
    #[serde(default)]
    pub interactive: Vec<InteractiveBotConfig>,
    #[serde(default)]
    pub push: Vec<PushBotConfig>,
}

/// An interactive bot: holds an outbound event-stream connection, can both
/// receive user messages and post replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractiveBotConfig {
    pub id: String,
    pub name: String,
    pub app_id: String,
    /// Sensitive; `enc:`-prefixed at rest.
    pub app_secret: String,
    /// Optional event-encryption key. Sensitive; `enc:`-prefixed at rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key: Option<String>,
}

/// A push bot: one-way webhook, no inbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBotConfig {
    pub id: String,
    pub name: String,
    pub webhook_url: String,
    /// Optional signing secret. Sensitive; `enc:`-prefixed at rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Reconnection policy for interactive bot connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub max_retries: u32,
    /// Seconds before the first retry.
    pub initial_interval: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: 2,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Total unhealthy time (seconds) after which the connector logs a
    /// terminal warning: `max_retries × initial_interval × m^(max_retries−1)`.
    pub fn give_up_after_secs(&self) -> f64 {
        self.max_retries as f64
            * self.initial_interval as f64
            * self
                .backoff_multiplier
                .powi(self.max_retries.saturating_sub(1) as i32)
    }

    /// Delay before retry number `attempt` (0-based), capped at 60 s.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let secs = self.initial_interval as f64 * self.backoff_multiplier.powi(attempt as i32);
        std::time::Duration::from_secs_f64(secs.min(60.0))
    }
}

/// Push-buffer behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    /// Coalescing window for streamed PTY output, in milliseconds.
    pub merge_window_ms: u64,
    /// Per-message UTF-8 size cap; longer output keeps its tail.
    pub max_message_bytes: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            merge_window_ms: 2000,
            max_message_bytes: 4096,
        }
    }
}

/// Default bot bindings applied to newly registered sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultBots {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_interactive_bot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_push_bot_id: Option<String>,
}

/// PTY input injection tuning, forwarded verbatim on `feishu_input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub enter_retry_count: u32,
    pub enter_retry_interval_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enter_retry_count: 3,
            enter_retry_interval_ms: 150,
        }
    }
}

/// The non-bot portion of the document, as submitted by `save_config`.
///
/// `defaults` and `input` are optional: an older controller that does not
/// know about them must not wipe them (backward-compat path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub reconnect: ReconnectConfig,
    pub push: PushConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultBots>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<InputConfig>,
}

// ── Unit tests ────────────────────────────────────────────────────────────────
