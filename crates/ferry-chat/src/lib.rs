// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat connectivity for ferry.
//!
//! The daemon talks to Feishu/Lark in two modes:
//!
//! - **Interactive bots** hold one outbound websocket event stream each
//!   (shared across every session bound to the bot) and post replies
//!   through the Web API — cards, rich-text posts, reactions.
//! - **Push bots** are one-way: signed HTTP POSTs to a custom-bot webhook
//!   URL, with the hosts restricted to the service's own domains.
//!
//! All service I/O goes through the [`ChatTransport`] trait so the router
//! can be driven by a mock in tests; [`feishu::FeishuTransport`] is the
//! production implementation. [`connector::ChatConnector`] owns connection
//! lifecycles, reconnection with backoff, and the health/warning state the
//! daemon surfaces on `status_response`.

pub mod connector;
pub mod feishu;
pub mod webhook;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ferry_config::schema::{InteractiveBotConfig, PushBotConfig};

pub use connector::{ChatConnector, ChatEvent};
pub use webhook::{host_is_whitelisted, sign_webhook, WebhookError};

/// Outcome of a webhook send that got an answer from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// The service's rate-limit code — the caller widens its merge window.
    RateLimited,
}

/// One inbound chat message, minimally decoded.
///
/// `content` is the service's opaque content JSON, passed through verbatim;
/// interpretation (text extraction, image keys) happens in the router.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message_id: String,
    pub chat_id: String,
    pub message_type: String,
    pub content: String,
}

/// Everything ferry needs from the chat service.
///
/// Methods take the bot configuration explicitly — credentials live in the
/// config store and the transport keeps only derived state (token cache).
#[async_trait]
pub trait ChatTransport: Send + Sync + 'static {
    /// Run one event-stream connection for `bot`, forwarding messages into
    /// `events` until the connection closes or fails. Reconnection is the
    /// connector's job, not the transport's.
    async fn run_event_stream(
        &self,
        bot: &InteractiveBotConfig,
        events: mpsc::Sender<IncomingMessage>,
    ) -> anyhow::Result<()>;

    /// Post an interactive card to a chat.
    async fn send_card(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        card: &serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Post a rich-text ("post") message to a chat.
    async fn send_post(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        post_body: &serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn add_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()>;

    /// Best-effort removal: looks the reaction up by kind first, tolerates
    /// it being gone already.
    async fn remove_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()>;

    /// Download an image attached to a message.
    async fn download_image(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        image_key: &str,
    ) -> anyhow::Result<Vec<u8>>;

    /// Credential check for an interactive bot (token fetch).
    async fn test_interactive(&self, bot: &InteractiveBotConfig) -> anyhow::Result<()>;

    /// Signed webhook POST for a push bot. The URL's host must be
    /// whitelisted; violations fail before any network I/O.
    async fn send_webhook(
        &self,
        bot: &PushBotConfig,
        payload: &serde_json::Value,
    ) -> anyhow::Result<SendOutcome>;
}
