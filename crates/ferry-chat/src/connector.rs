// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Connection manager for interactive bots.
//!
//! One live outbound connection per bot, shared by every session bound to
//! it. Each connection runs in its own task:
//!
//! ```text
//! start_interactive(bot)
//!     │ spawns
//!     ▼
//! connection loop ── run_event_stream ──► per-conn channel ──► forwarder
//!     │   ▲                                                       │
//!     │   └── backoff (reconnect config), attempt reset on event  │
//!     ▼                                                           ▼
//! cancelled by stop_interactive                    events_tx (router) +
//!                                                  health bookkeeping
//! ```
//!
//! A 30-second health tick inspects each bot's last-event time; more than
//! 90 seconds of silence marks the connection unhealthy and surfaces a
//! warning on `status_response`. Any subsequent event clears it. Once the
//! total unhealthy time exceeds the reconnect policy's give-up horizon a
//! terminal warning is logged (the loop keeps trying — the warning is for
//! the operator, not a stop signal).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ferry_config::schema::{InteractiveBotConfig, PushBotConfig, ReconnectConfig};
use ferry_proto::BotWarning;

use crate::{ChatTransport, IncomingMessage, SendOutcome};

const HEALTH_TICK: Duration = Duration::from_secs(30);
const SILENCE_LIMIT: Duration = Duration::from_secs(90);

/// An inbound chat message, tagged with the bot that received it.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub bot_id: String,
    pub message: IncomingMessage,
}

struct HealthState {
    last_event: StdMutex<Instant>,
    unhealthy_since: StdMutex<Option<Instant>>,
    warning: StdMutex<Option<String>>,
    gave_up: AtomicBool,
}

impl HealthState {
    fn new() -> Self {
        Self {
            last_event: StdMutex::new(Instant::now()),
            unhealthy_since: StdMutex::new(None),
            warning: StdMutex::new(None),
            gave_up: AtomicBool::new(false),
        }
    }

    fn record_event(&self) {
        *self.last_event.lock().unwrap() = Instant::now();
        *self.unhealthy_since.lock().unwrap() = None;
        *self.warning.lock().unwrap() = None;
        self.gave_up.store(false, Ordering::Relaxed);
    }
}

struct BotState {
    cancel: CancellationToken,
    health: Arc<HealthState>,
}

struct Inner<T: ChatTransport> {
    transport: Arc<T>,
    reconnect: StdMutex<ReconnectConfig>,
    events_tx: mpsc::Sender<ChatEvent>,
    bots: Mutex<HashMap<String, BotState>>,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle owning all interactive connections.
pub struct ChatConnector<T: ChatTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ChatTransport> Clone for ChatConnector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ChatTransport> ChatConnector<T> {
    /// Build the connector; the receiver delivers every inbound message to
    /// its single consumer (the router).
    pub fn new(transport: Arc<T>, reconnect: ReconnectConfig) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let inner = Arc::new(Inner {
            transport,
            reconnect: StdMutex::new(reconnect),
            events_tx,
            bots: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(health_tick_loop(inner.clone()));

        (Self { inner }, events_rx)
    }

    /// Adopt a new reconnect policy (config was saved).
    pub fn set_reconnect_policy(&self, reconnect: ReconnectConfig) {
        *self.inner.reconnect.lock().unwrap() = reconnect;
    }

    /// Open the event-stream connection for `bot` if not already running.
    pub async fn start_interactive(&self, bot: InteractiveBotConfig) {
        let mut bots = self.inner.bots.lock().await;
        if bots.contains_key(&bot.id) {
            return;
        }

        let cancel = self.inner.shutdown.child_token();
        let health = Arc::new(HealthState::new());
        bots.insert(
            bot.id.clone(),
            BotState {
                cancel: cancel.clone(),
                health: health.clone(),
            },
        );
        drop(bots);

        info!(bot = %bot.id, "starting interactive connection");
        tokio::spawn(connection_loop(self.inner.clone(), bot, cancel, health));
    }

    /// Tear down the connection for `bot_id` (last bound session left).
    pub async fn stop_interactive(&self, bot_id: &str) {
        if let Some(state) = self.inner.bots.lock().await.remove(bot_id) {
            info!(bot = %bot_id, "stopping interactive connection");
            state.cancel.cancel();
        }
    }

    /// Stop every connection (daemon shutdown).
    pub async fn stop_all(&self) {
        self.inner.shutdown.cancel();
        self.inner.bots.lock().await.clear();
    }

    pub async fn has_connection(&self, bot_id: &str) -> bool {
        self.inner.bots.lock().await.contains_key(bot_id)
    }

    /// Healthy = connected and no silence warning outstanding.
    pub async fn is_healthy(&self, bot_id: &str) -> bool {
        let bots = self.inner.bots.lock().await;
        match bots.get(bot_id) {
            Some(state) => state.health.warning.lock().unwrap().is_none(),
            None => false,
        }
    }

    /// Current connection warnings for `status_response`.
    pub async fn warnings(&self) -> Vec<BotWarning> {
        let bots = self.inner.bots.lock().await;
        bots.iter()
            .filter_map(|(id, state)| {
                state.health.warning.lock().unwrap().clone().map(|message| BotWarning {
                    bot_id: id.clone(),
                    message,
                })
            })
            .collect()
    }

    // ── Outbound operations (thin passthrough to the transport) ──────────────

    pub async fn send_interactive_card(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        card: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.inner.transport.send_card(bot, chat_id, card).await
    }

    pub async fn send_interactive_post(
        &self,
        bot: &InteractiveBotConfig,
        chat_id: &str,
        post_body: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.inner.transport.send_post(bot, chat_id, post_body).await
    }

    pub async fn add_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()> {
        self.inner.transport.add_reaction(bot, message_id, kind).await
    }

    pub async fn remove_reaction(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        kind: &str,
    ) -> anyhow::Result<()> {
        self.inner
            .transport
            .remove_reaction(bot, message_id, kind)
            .await
    }

    pub async fn download_image(
        &self,
        bot: &InteractiveBotConfig,
        message_id: &str,
        image_key: &str,
    ) -> anyhow::Result<Vec<u8>> {
        self.inner
            .transport
            .download_image(bot, message_id, image_key)
            .await
    }

    pub async fn send_webhook_card(
        &self,
        bot: &PushBotConfig,
        payload: &serde_json::Value,
    ) -> anyhow::Result<SendOutcome> {
        self.inner.transport.send_webhook(bot, payload).await
    }

    pub async fn test_interactive(&self, bot: &InteractiveBotConfig) -> anyhow::Result<()> {
        self.inner.transport.test_interactive(bot).await
    }

    /// Push-bot connectivity test: a tiny signed text payload.
    pub async fn test_push(&self, bot: &PushBotConfig) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "msg_type": "text",
            "content": { "text": "ferry connectivity test" }
        });
        match self.inner.transport.send_webhook(bot, &payload).await? {
            SendOutcome::Delivered | SendOutcome::RateLimited => Ok(()),
        }
    }
}

// ── Connection loop ───────────────────────────────────────────────────────────

async fn connection_loop<T: ChatTransport>(
    inner: Arc<Inner<T>>,
    bot: InteractiveBotConfig,
    cancel: CancellationToken,
    health: Arc<HealthState>,
) {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let connected_at = Instant::now();
        let (conn_tx, mut conn_rx) = mpsc::channel::<IncomingMessage>(64);

        // Forward per-connection messages to the router, stamping health.
        let forward = {
            let health = health.clone();
            let events_tx = inner.events_tx.clone();
            let bot_id = bot.id.clone();
            async move {
                while let Some(message) = conn_rx.recv().await {
                    health.record_event();
                    if events_tx
                        .send(ChatEvent {
                            bot_id: bot_id.clone(),
                            message,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        };

        let stream = inner.transport.run_event_stream(&bot, conn_tx);

        tokio::select! {
            _ = cancel.cancelled() => break,
            (result, ()) = futures::future::join(stream, forward) => {
                match result {
                    Ok(()) => debug!(bot = %bot.id, "event stream closed"),
                    Err(e) => warn!(bot = %bot.id, "event stream error: {e}"),
                }
            }
        }

        // A connection that delivered events resets the backoff ladder.
        if *health.last_event.lock().unwrap() > connected_at {
            attempt = 0;
        }

        let reconnect = inner.reconnect.lock().unwrap().clone();
        let capped = attempt.min(reconnect.max_retries.saturating_sub(1));
        let delay = reconnect.delay_for_attempt(capped);
        attempt = attempt.saturating_add(1);
        debug!(bot = %bot.id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(bot = %bot.id, "connection loop ended");
}

// ── Health tick ───────────────────────────────────────────────────────────────

async fn health_tick_loop<T: ChatTransport>(inner: Arc<Inner<T>>) {
    let mut tick = tokio::time::interval(HEALTH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }

        let give_up_after = {
            let reconnect = inner.reconnect.lock().unwrap();
            Duration::from_secs_f64(reconnect.give_up_after_secs().max(1.0))
        };

        let bots = inner.bots.lock().await;
        for (bot_id, state) in bots.iter() {
            let silence = state.health.last_event.lock().unwrap().elapsed();
            if silence <= SILENCE_LIMIT {
                continue;
            }

            let mut unhealthy_since = state.health.unhealthy_since.lock().unwrap();
            let since = *unhealthy_since.get_or_insert_with(Instant::now);
            let message = format!(
                "no events from bot for {}s; connection may be stale",
                silence.as_secs()
            );
            warn!(bot = %bot_id, "{message}");
            *state.health.warning.lock().unwrap() = Some(message);

            if since.elapsed() > give_up_after
                && !state.health.gave_up.swap(true, Ordering::Relaxed)
            {
                error!(
                    bot = %bot_id,
                    unhealthy_secs = since.elapsed().as_secs(),
                    "connection unhealthy beyond the retry budget; check the bot credentials and network"
                );
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
