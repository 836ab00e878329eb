// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Feishu/Lark production transport.
//!
//! Interactive bots authenticate with a tenant access token (fetched from
//! the app credentials, cached until shortly before expiry) and hold one
//! outbound websocket for inbound events — no listening port is ever
//! opened. Replies, reactions and image downloads go through the Web API.
//!
//! The event-stream endpoint is obtained per connection: the service hands
//! out a short-lived wss URL bound to the app credentials.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use ferry_config::schema::{InteractiveBotConfig, PushBotConfig};

use crate::{ChatTransport, IncomingMessage, SendOutcome};

const API_BASE: &str = "https://open.feishu.cn";

/// Refresh tokens two minutes before the service expires them.
const TOKEN_SLACK: Duration = Duration::from_secs(120);

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct FeishuTransport {
    http: reqwest::Client,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl Default for FeishuTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FeishuTransport {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch (or reuse) the tenant access token for a bot's app.
    async fn tenant_token(&self, bot: &InteractiveBotConfig) -> anyhow::Result<String> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(cached) = tokens.get(&bot.app_id) {
                if cached.expires_at > Instant::now() {
                    return Ok(cached.token.clone());
                }
            }
        }

        let resp: Value = self
            .http
            .post(format!("{API_BASE}/open-apis/auth/v3/tenant_access_token/internal"))
            .json(&json!({ "app_id": bot.app_id, "app_secret": bot.app_secret }))
            .send()
            .await
            .context("tenant token request failed")?
            .json()
            .await
            .context("tenant token response is not JSON")?;

        check_api_code(&resp).context("tenant token rejected")?;
        let token = resp["tenant_access_token"]
            .as_str()
            .context("tenant token response missing token")?
            .to_string();
        let expire_secs = resp["expire"].as_u64().unwrap_or(7200);

        let mut tokens = self.tokens.lock().await;
        tokens.insert(
            bot.app_id.clone(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(expire_secs)
                    - TOKEN_SLACK.min(Duration::from_secs(expire_secs / 2)),
            },
        );
        Ok(token)
    }

    /// Obtain the short-lived websocket endpoint for the event stream.
    async fn fetch_ws_endpoint(&self, bot: &InteractiveBotConfig) -> anyhow::Result<String> {
        let resp: Value = self
            .http
            .post(format!("{API_BASE}/callback/ws/endpoint"))
            .json(&json!({ "AppID": bot.app_id, "AppSecret": bot.app_secret }))
            .send()
            .await
            .context("ws endpoint request failed")?
            .json()
            .await
            .context("ws endpoint response is not JSON")?;

        resp["data"]["URL"]
            .as_str()
            .or_else(|| resp["URL"].as_str())
            .map(|s| s.to_string())
            .context("ws endpoint response carries no URL")
    }

    async fn send_message(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        msg_type: &str,
        content: &Value,
    ) -> anyhow::Result<()> {
        let token = self.tenant_token(bot).await?;
        let resp: Value = self
            .http
            .post(format!(
                "{API_BASE}/open-apis/im/v1/messages?receive_id_type=chat_id"
            ))
            .bearer_auth(&token)
            .json(&json!({
                "receive_id": chat_id,
                "msg_type": msg_type,
                // The API wants the content as a JSON *string*.
                "content": content.to_string(),
            }))
            .send()
            .await
            .context("message send failed")?
            .json()
            .await
            .context("message send response is not JSON")?;
        check_api_code(&resp)
    }
}

#[async_trait]
impl ChatTransport for FeishuTransport {
    async fn run_event_stream(
        &self,
        bot: &InteractiveBotConfig,
        events: mpsc::Sender<IncomingMessage>,
    ) -> anyhow::Result<()> {
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;

        let wss_url = self.fetch_ws_endpoint(bot).await?;
        debug!(bot = %bot.id, "event stream: got websocket endpoint");

        let (ws_stream, _) = connect_async(&wss_url)
            .await
            .map_err(|e| anyhow::anyhow!("websocket connect: {e}"))?;
        let (_sink, mut stream) = ws_stream.split();

        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Text(text) => {
                    if let Some(msg) = parse_event_frame(&text) {
                        if events.send(msg).await.is_err() {
                            // Router is gone; nothing left to deliver to.
                            break;
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn send_card(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        card: &Value,
    ) -> anyhow::Result<()> {
        self.send_message(bot, chat_id, "interactive", card).await
    }

    async fn send_post(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        post_body: &Value,
    ) -> anyhow::Result<()> {
        self.send_message(bot, chat_id, "post", &json!({ "post": post_body }))
            .await
    }

    async fn add_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()> {
        let token = self.tenant_token(bot).await?;
        let resp: Value = self
            .http
            .post(format!(
                "{API_BASE}/open-apis/im/v1/messages/{message_id}/reactions"
            ))
            .bearer_auth(&token)
            .json(&json!({ "reaction_type": { "emoji_type": kind } }))
            .send()
            .await
            .context("reaction create failed")?
            .json()
            .await
            .context("reaction create response is not JSON")?;
        check_api_code(&resp)
    }

    async fn remove_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()> {
        let token = self.tenant_token(bot).await?;

        // The delete call needs the reaction id, which only the list call
        // returns. Filter by emoji kind and delete whatever matches.
        let resp: Value = self
            .http
            .get(format!(
                "{API_BASE}/open-apis/im/v1/messages/{message_id}/reactions"
            ))
            .query(&[("reaction_type", kind)])
            .bearer_auth(&token)
            .send()
            .await
            .context("reaction list failed")?
            .json()
            .await
            .context("reaction list response is not JSON")?;
        check_api_code(&resp)?;

        let Some(items) = resp["data"]["items"].as_array() else {
            return Ok(());
        };
        for item in items {
            let Some(reaction_id) = item["reaction_id"].as_str() else {
                continue;
            };
            let resp: Value = self
                .http
                .delete(format!(
                    "{API_BASE}/open-apis/im/v1/messages/{message_id}/reactions/{reaction_id}"
                ))
                .bearer_auth(&token)
                .send()
                .await
                .context("reaction delete failed")?
                .json()
                .await
                .context("reaction delete response is not JSON")?;
            if let Err(e) = check_api_code(&resp) {
                // Already removed by a user, message deleted, etc.
                warn!(message_id, "reaction delete rejected: {e}");
            }
        }
        Ok(())
    }

    async fn download_image(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        image_key: &str,
    ) -> anyhow::Result<Vec<u8>> {
        let token = self.tenant_token(bot).await?;
        let resp = self
            .http
            .get(format!(
                "{API_BASE}/open-apis/im/v1/messages/{message_id}/resources/{image_key}"
            ))
            .query(&[("type", "image")])
            .bearer_auth(&token)
            .send()
            .await
            .context("image download failed")?;
        if !resp.status().is_success() {
            bail!("image download failed: HTTP {}", resp.status());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn test_interactive(&self, bot: &InteractiveBotConfig) -> anyhow::Result<()> {
        // Drop any cached token so the test exercises the credentials.
        self.tokens.lock().await.remove(&bot.app_id);
        self.tenant_token(bot).await.map(|_| ())
    }

    async fn send_webhook(
        &self,
        bot: &PushBotConfig,
        payload: &Value,
    ) -> anyhow::Result<SendOutcome> {
        crate::webhook::send_webhook(&self.http, bot, payload).await
    }
}

/// Reject the service's `{code != 0}` error envelope.
fn check_api_code(resp: &Value) -> anyhow::Result<()> {
    let code = resp["code"].as_i64().unwrap_or(0);
    if code != 0 {
        bail!(
            "service error {code}: {}",
            resp["msg"].as_str().unwrap_or("-")
        );
    }
    Ok(())
}

/// Decode one websocket frame into an [`IncomingMessage`].
///
/// Only `im.message.receive_v1` events are interesting; everything else
/// (pings, member events, card callbacks) is ignored here.
fn parse_event_frame(text: &str) -> Option<IncomingMessage> {
    let v: Value = serde_json::from_str(text).ok()?;
    let event_type = v["header"]["event_type"].as_str().unwrap_or("");
    if event_type != "im.message.receive_v1" {
        return None;
    }
    let message = &v["event"]["message"];
    Some(IncomingMessage {
        message_id: message["message_id"].as_str()?.to_string(),
        chat_id: message["chat_id"].as_str()?.to_string(),
        message_type: message["message_type"].as_str().unwrap_or("").to_string(),
        content: message["content"].as_str().unwrap_or("").to_string(),
    })
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_receive_frame_is_parsed() {
        let frame = r#"{
            "header": { "event_type": "im.message.receive_v1" },
            "event": { "message": {
                "message_id": "om_1", "chat_id": "oc_9",
                "message_type": "text", "content": "{\"text\":\"ping\"}"
            }}
        }"#;
        let msg = parse_event_frame(frame).unwrap();
        assert_eq!(msg.message_id, "om_1");
        assert_eq!(msg.chat_id, "oc_9");
        assert_eq!(msg.message_type, "text");
        assert_eq!(msg.content, r#"{"text":"ping"}"#);
    }

    #[test]
    fn unrelated_event_types_are_ignored() {
        let frame = r#"{"header":{"event_type":"im.chat.member.bot.added_v1"},"event":{}}"#;
        assert!(parse_event_frame(frame).is_none());
    }

    #[test]
    fn garbage_frames_are_ignored() {
        assert!(parse_event_frame("ping").is_none());
        assert!(parse_event_frame("{}").is_none());
    }

    #[test]
    fn api_error_envelope_is_rejected() {
        let resp = json!({ "code": 99991663, "msg": "app ticket invalid" });
        assert!(check_api_code(&resp).is_err());
        assert!(check_api_code(&json!({ "code": 0 })).is_ok());
    }
}
