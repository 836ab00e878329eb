// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Push-bot webhooks: domain guard, request signing, rate-limit detection.
//!
//! # Signing
//!
//! The custom-bot webhook signature is unusual: the secret and timestamp
//! form the HMAC **key** and the message is empty —
//!
//! ```text
//! sign = base64( HMAC-SHA256( key = timestamp + "\n" + secret, msg = "" ) )
//! ```
//!
//! That is what the service documents and verifies; see the service docs
//! before reusing this for any other webhook flavour.
//!
//! # Domain guard
//!
//! `send_webhook` refuses any URL whose host is not under the service's CN
//! or international domains. The check runs before any request is issued,
//! so a mistyped (or malicious) webhook URL never receives a payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use ferry_config::schema::PushBotConfig;

use crate::SendOutcome;

/// Host suffixes a webhook URL may resolve under.
const ALLOWED_HOST_SUFFIXES: &[&str] = &[".feishu.cn", ".larksuite.com"];

/// Numeric response code the service uses for webhook rate limiting.
const RATE_LIMIT_CODE: i64 = 11232;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook URL is not valid: {0}")]
    InvalidUrl(String),
    #[error("webhook host {0:?} is not on the service domain whitelist")]
    DomainRejected(String),
}

/// Check a webhook URL's host against the whitelist.
pub fn host_is_whitelisted(url: &str) -> Result<(), WebhookError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;
    let Some(host) = parsed.host_str() else {
        return Err(WebhookError::InvalidUrl("no host".into()));
    };

    let allowed = ALLOWED_HOST_SUFFIXES.iter().any(|suffix| {
        host.ends_with(suffix) || host == suffix.trim_start_matches('.')
    });
    if allowed {
        Ok(())
    } else {
        Err(WebhookError::DomainRejected(host.to_string()))
    }
}

/// Compute the webhook signature for `timestamp` (seconds).
pub fn sign_webhook(secret: &str, timestamp: i64) -> String {
    use base64::Engine;

    let key = format!("{timestamp}\n{secret}");
    // HMAC keys of any length are valid; new_from_slice only fails for
    // unsized-key algorithms, which SHA-256 HMAC is not.
    let mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    let digest = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// POST `payload` to a push bot's webhook.
///
/// The payload is augmented with `timestamp` and `sign` when the bot has a
/// signing secret. Returns [`SendOutcome::RateLimited`] when the service
/// answers with its rate-limit code so the caller can widen its merge
/// window; the dropped message itself is not retried.
pub async fn send_webhook(
    client: &reqwest::Client,
    bot: &PushBotConfig,
    payload: &serde_json::Value,
) -> anyhow::Result<SendOutcome> {
    host_is_whitelisted(&bot.webhook_url)?;

    let mut body = payload.clone();
    if let Some(secret) = bot.secret.as_deref() {
        let timestamp = chrono::Utc::now().timestamp();
        if let Some(map) = body.as_object_mut() {
            map.insert("timestamp".into(), serde_json::json!(timestamp.to_string()));
            map.insert("sign".into(), serde_json::json!(sign_webhook(secret, timestamp)));
        }
    }

    let resp = client.post(&bot.webhook_url).json(&body).send().await?;
    let status = resp.status();

    if status.as_u16() == 429 {
        warn!(bot = %bot.id, "webhook rate limited (HTTP 429)");
        return Ok(SendOutcome::RateLimited);
    }

    let answer: serde_json::Value = resp.json().await.unwrap_or_default();
    let code = answer
        .get("code")
        .and_then(|c| c.as_i64())
        .or_else(|| answer.get("StatusCode").and_then(|c| c.as_i64()))
        .unwrap_or(0);

    if code == RATE_LIMIT_CODE {
        warn!(bot = %bot.id, "webhook rate limited (code {RATE_LIMIT_CODE})");
        return Ok(SendOutcome::RateLimited);
    }
    if !status.is_success() || code != 0 {
        anyhow::bail!(
            "webhook send failed: HTTP {status}, code {code}, msg {}",
            answer.get("msg").and_then(|m| m.as_str()).unwrap_or("-")
        );
    }
    Ok(SendOutcome::Delivered)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cn_and_international_hosts_are_accepted() {
        assert!(host_is_whitelisted("https://open.feishu.cn/open-apis/bot/v2/hook/abc").is_ok());
        assert!(host_is_whitelisted("https://open.larksuite.com/open-apis/bot/v2/hook/abc").is_ok());
    }

    #[test]
    fn foreign_hosts_are_rejected() {
        let err = host_is_whitelisted("https://evil.example.com/hook").unwrap_err();
        assert!(matches!(err, WebhookError::DomainRejected(host) if host == "evil.example.com"));
    }

    #[test]
    fn lookalike_suffix_is_rejected() {
        // "notfeishu.cn" must not pass a naive contains() check.
        assert!(host_is_whitelisted("https://notfeishu.cn/hook").is_err());
        assert!(host_is_whitelisted("https://feishu.cn.evil.com/hook").is_err());
    }

    #[test]
    fn bare_service_domain_is_accepted() {
        assert!(host_is_whitelisted("https://feishu.cn/hook").is_ok());
    }

    #[test]
    fn garbage_url_is_invalid() {
        assert!(matches!(
            host_is_whitelisted("not a url"),
            Err(WebhookError::InvalidUrl(_))
        ));
    }

    #[test]
    fn signature_is_deterministic_and_base64() {
        use base64::Engine;
        let a = sign_webhook("secret", 1700000000);
        let b = sign_webhook("secret", 1700000000);
        assert_eq!(a, b);
        let raw = base64::engine::general_purpose::STANDARD.decode(&a).unwrap();
        assert_eq!(raw.len(), 32, "HMAC-SHA256 digest is 32 bytes");
    }

    #[test]
    fn signature_depends_on_secret_and_timestamp() {
        let base = sign_webhook("secret", 1700000000);
        assert_ne!(base, sign_webhook("other", 1700000000));
        assert_ne!(base, sign_webhook("secret", 1700000001));
    }
}
