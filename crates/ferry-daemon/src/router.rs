// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The router — glue between IPC clients, the session registry, the output
//! buffers and the chat connector.
//!
//! # Design
//!
//! ```text
//!  IPC reader tasks ──┐
//!  chat connector ────┼──► mpsc ──► Router::run()   (single owner of
//!  timer tasks ───────┤                              registry + buffers)
//!  dispatch tasks ────┘                                   │
//!                                                         │ spawns
//!                                  send/dispatch tasks ◄──┘
//! ```
//!
//! All mutable state lives inside the loop — no shared locks, no await
//! while holding anything. Work that can block (chat sends, webhook POSTs,
//! image downloads) runs in spawned tasks that report back through the same
//! channel. Timers are sleep tasks carrying a generation number; a stale
//! generation is ignored by the buffer it returns to.
//!
//! # Reply-path selection (rule of three)
//!
//! 1. `api_proxy_event` — authoritative when present; marks the session as
//!    proxy-mode, which suppresses both other paths.
//! 2. `codex_notify` / `claude_notify` — clean final reply matched to a
//!    session by exact `cwd`; skipped in proxy mode.
//! 3. Terminal output through the buffers — the lossy fallback, only for
//!    CLIs without a hook and sessions without a proxy.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ferry_chat::{ChatConnector, ChatEvent, ChatTransport, SendOutcome};
use ferry_config::schema::{InteractiveBotConfig, PushBotConfig};
use ferry_config::ConfigStore;
use ferry_proto::{
    encode_line, AssembledMessage, BotConfig, BotKind, ClientMessage, DaemonMessage,
};

use crate::buffers::{
    truncate_for_send, InteractiveBuffer, PushBuffer, SummaryBuffer, INTERACTIVE_SILENCE,
};
use crate::cards;
use crate::ipc::ConnWriter;
use crate::registry::{RegisterOutcome, SessionRegistry, SessionRow};
use crate::toolcfg;

/// Substring in a model name marking internal/auxiliary requests that must
/// never surface in chat.
const LIGHTWEIGHT_MODEL_MARKER: &str = "haiku";

/// Everything that can wake the router.
#[derive(Debug)]
pub enum RouterMsg {
    ClientConnected {
        conn_id: u64,
        writer: ConnWriter,
    },
    Client {
        conn_id: u64,
        msg: ClientMessage,
    },
    ClientGone {
        conn_id: u64,
    },
    /// Inbound chat message (from the connector's event channel).
    Chat(ChatEvent),
    /// Image downloads finished; forward the user input to the PTY.
    DeliverInput {
        session_id: String,
        text: String,
        images: Vec<String>,
    },
    /// Interactive silence timer fired.
    FlushInteractive {
        session_id: String,
        generation: u64,
    },
    /// Push merge-window timer fired.
    FlushPush {
        session_id: String,
        generation: u64,
    },
    /// A dispatch task finished sending; the next queued reply may go.
    ReplyDispatched {
        session_id: String,
    },
    /// A webhook send hit the service's rate limit.
    PushRateLimited {
        session_id: String,
    },
    /// Periodic registry maintenance.
    PruneTick,
    /// Graceful shutdown (signal or `stop_request`).
    Shutdown,
}

// ── Per-session output buffers ────────────────────────────────────────────────

struct SessionBuffers {
    interactive: InteractiveBuffer,
    push: PushBuffer,
    summary: SummaryBuffer,
}

impl SessionBuffers {
    fn new(merge_window_ms: u64) -> Self {
        Self {
            interactive: InteractiveBuffer::default(),
            push: PushBuffer::new(std::time::Duration::from_millis(merge_window_ms)),
            summary: SummaryBuffer::default(),
        }
    }
}

// ── Per-session routing state ─────────────────────────────────────────────────

#[derive(Default)]
struct SessionRuntime {
    /// A reply is being dispatched; further replies queue behind it.
    pending_reply: bool,
    queue: VecDeque<ReplyJob>,
    /// Chat to address replies (and the end-of-session summary) to.
    chat_target: Option<String>,
    /// Most recent user message, for acknowledgment-reaction cleanup.
    last_user_message_id: Option<String>,
    /// Session ended; the runtime is dropped once the queue drains.
    ending: bool,
}

/// One outbound send, owned data only — survives buffer teardown.
enum ReplyJob {
    InteractivePost {
        bot: InteractiveBotConfig,
        chat_id: String,
        text: String,
        /// Remove the acknowledgment reaction from this message afterwards.
        remove_ack_from: Option<String>,
    },
    InteractiveCard {
        bot: InteractiveBotConfig,
        chat_id: String,
        card: Value,
    },
    PushText {
        bot: PushBotConfig,
        text: String,
    },
    PushPost {
        bot: PushBotConfig,
        text: String,
    },
    PushCard {
        bot: PushBotConfig,
        card: Value,
    },
}

// ── Router ────────────────────────────────────────────────────────────────────

pub struct Router<T: ChatTransport> {
    rx: mpsc::Receiver<RouterMsg>,
    tx: mpsc::Sender<RouterMsg>,
    chat_rx: mpsc::Receiver<ChatEvent>,

    registry: SessionRegistry,
    config: ConfigStore,
    connector: ChatConnector<T>,

    conns: HashMap<u64, ConnWriter>,
    conn_sessions: HashMap<u64, Vec<String>>,
    /// sessionId → the one IPC connection currently speaking for it.
    socket_map: HashMap<String, u64>,

    buffers: HashMap<String, SessionBuffers>,
    runtime: HashMap<String, SessionRuntime>,

    started_at: DateTime<Utc>,
    /// Cancels the IPC accept loop and the connector on shutdown.
    shutdown: CancellationToken,
    stopping: bool,
}

impl<T: ChatTransport> Router<T> {
    pub fn new(
        config: ConfigStore,
        connector: ChatConnector<T>,
        chat_rx: mpsc::Receiver<ChatEvent>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Sender<RouterMsg>) {
        let (tx, rx) = mpsc::channel(1024);
        let router = Self {
            rx,
            tx: tx.clone(),
            chat_rx,
            registry: SessionRegistry::new(),
            config,
            connector,
            conns: HashMap::new(),
            conn_sessions: HashMap::new(),
            socket_map: HashMap::new(),
            buffers: HashMap::new(),
            runtime: HashMap::new(),
            started_at: Utc::now(),
            shutdown,
            stopping: false,
        };
        (router, tx)
    }

    /// Run until shutdown. Consumes the router.
    pub async fn run(mut self) {
        info!("router started");
        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle(msg).await;
                }
                ev = self.chat_rx.recv() => {
                    if let Some(ev) = ev {
                        self.handle(RouterMsg::Chat(ev)).await;
                    }
                }
            }
            if self.stopping {
                break;
            }
        }
        self.drain().await;
        info!("router stopped");
    }

    async fn handle(&mut self, msg: RouterMsg) {
        match msg {
            RouterMsg::ClientConnected { conn_id, writer } => {
                self.conns.insert(conn_id, writer);
                self.conn_sessions.entry(conn_id).or_default();
            }
            RouterMsg::Client { conn_id, msg } => self.handle_client(conn_id, msg).await,
            RouterMsg::ClientGone { conn_id } => self.handle_client_gone(conn_id).await,
            RouterMsg::Chat(ev) => self.handle_chat(ev).await,
            RouterMsg::DeliverInput {
                session_id,
                text,
                images,
            } => self.deliver_input(&session_id, text, images),
            RouterMsg::FlushInteractive {
                session_id,
                generation,
            } => self.flush_interactive(&session_id, generation),
            RouterMsg::FlushPush {
                session_id,
                generation,
            } => self.flush_push(&session_id, generation),
            RouterMsg::ReplyDispatched { session_id } => self.reply_dispatched(&session_id),
            RouterMsg::PushRateLimited { session_id } => {
                if let Some(bufs) = self.buffers.get_mut(&session_id) {
                    bufs.push.widen();
                    info!(
                        session = %session_id,
                        window_ms = bufs.push.window().as_millis() as u64,
                        "push merge window widened after rate limit"
                    );
                }
            }
            RouterMsg::PruneTick => {
                self.registry.prune_ended();
                let dead_buffers: Vec<String> = self
                    .buffers
                    .keys()
                    .filter(|sid| self.registry.get(sid).is_none())
                    .cloned()
                    .collect();
                for sid in dead_buffers {
                    self.buffers.remove(&sid);
                }
                let dead_runtime: Vec<String> = self
                    .runtime
                    .iter()
                    .filter(|(sid, rt)| !rt.pending_reply && self.registry.get(sid).is_none())
                    .map(|(sid, _)| sid.clone())
                    .collect();
                for sid in dead_runtime {
                    self.runtime.remove(&sid);
                }
            }
            RouterMsg::Shutdown => {
                self.stopping = true;
            }
        }
    }

    // ── IPC client messages ──────────────────────────────────────────────────

    async fn handle_client(&mut self, conn_id: u64, msg: ClientMessage) {
        match msg {
            ClientMessage::RegisterSession {
                session_id,
                cli,
                cwd,
                proxy_mode,
            } => {
                self.register_session(conn_id, &session_id, &cli, &cwd, proxy_mode)
                    .await
            }
            ClientMessage::PtyOutput { session_id, data } => self.pty_output(&session_id, &data),
            ClientMessage::SessionEnded { session_id } => self.end_session(&session_id).await,
            ClientMessage::ApiProxyEvent {
                session_id,
                message,
            } => self.api_proxy_event(&session_id, message),
            ClientMessage::CodexNotify { cwd, message } => self.hook_notify(&cwd, &message),
            ClientMessage::ClaudeNotify { cwd, message } => self.hook_notify(&cwd, &message),

            ClientMessage::StatusRequest {} => {
                let warnings = self.connector.warnings().await;
                self.respond(
                    conn_id,
                    &DaemonMessage::StatusResponse {
                        pid: std::process::id(),
                        started_at: self.started_at,
                        sessions: self.registry.snapshots(),
                        warnings,
                    },
                );
            }
            ClientMessage::StopRequest {} => {
                self.respond(conn_id, &DaemonMessage::StopResponse { ok: true });
                info!("stop requested over IPC");
                self.stopping = true;
            }
            ClientMessage::ListBotsRequest {} => {
                let doc = self.config.document();
                self.respond(
                    conn_id,
                    &DaemonMessage::ListBotsResponse {
                        interactive: doc.bots.interactive.clone(),
                        push: doc.bots.push.clone(),
                    },
                );
            }
            ClientMessage::SaveBotRequest { bot } => self.save_bot(conn_id, bot).await,
            ClientMessage::DeleteBotRequest { bot_id } => self.delete_bot(conn_id, &bot_id).await,
            ClientMessage::BindBotRequest {
                session_id,
                kind,
                bot_id,
            } => self.bind_bot(conn_id, &session_id, kind, &bot_id).await,
            ClientMessage::UnbindBotRequest { session_id, kind } => {
                self.unbind_bot(conn_id, &session_id, kind).await
            }
            ClientMessage::TestBotRequest { kind, bot_id } => self.test_bot(conn_id, kind, &bot_id),
            ClientMessage::GetConfigRequest {} => {
                self.respond(
                    conn_id,
                    &DaemonMessage::GetConfigResponse {
                        config: self.config.document().clone(),
                    },
                );
            }
            ClientMessage::SaveConfigRequest { settings } => {
                let reconnect = settings.reconnect.clone();
                let result = self.config.save_settings(settings);
                if result.is_ok() {
                    self.connector.set_reconnect_policy(reconnect);
                }
                self.respond_ack(conn_id, AckKind::SaveConfig, result.err().map(|e| e.to_string()));
            }
            ClientMessage::SetDefaultBotRequest { kind, bot_id } => {
                let result = match kind {
                    BotKind::Interactive => self.config.set_default_interactive(bot_id),
                    BotKind::Push => self.config.set_default_push(bot_id),
                };
                let error = match result {
                    Ok(true) => None,
                    Ok(false) => Some("bot not found".to_string()),
                    Err(e) => Some(e.to_string()),
                };
                self.respond_ack(conn_id, AckKind::SetDefaultBot, error);
            }
            ClientMessage::GetDefaultsRequest {} => {
                self.respond(
                    conn_id,
                    &DaemonMessage::GetDefaultsResponse {
                        defaults: self.config.defaults().clone(),
                    },
                );
            }
            ClientMessage::CheckCodexConfigRequest {} => {
                let status = toolcfg::check_codex(&toolcfg::codex_config_path());
                self.respond(
                    conn_id,
                    &DaemonMessage::CheckCodexConfigResponse {
                        configured: status.configured,
                        path: status.path.display().to_string(),
                    },
                );
            }
            ClientMessage::SetupCodexConfigRequest {} => {
                let error = toolcfg::setup_codex(&toolcfg::codex_config_path())
                    .err()
                    .map(|e| e.to_string());
                self.respond_ack(conn_id, AckKind::SetupCodexConfig, error);
            }
            ClientMessage::CheckClaudeConfigRequest {} => {
                let status = toolcfg::check_claude(&toolcfg::claude_settings_path());
                self.respond(
                    conn_id,
                    &DaemonMessage::CheckClaudeConfigResponse {
                        configured: status.configured,
                        path: status.path.display().to_string(),
                    },
                );
            }
            ClientMessage::SetupClaudeConfigRequest {} => {
                let error = toolcfg::setup_claude(&toolcfg::claude_settings_path())
                    .err()
                    .map(|e| e.to_string());
                self.respond_ack(conn_id, AckKind::SetupClaudeConfig, error);
            }
        }
    }

    async fn register_session(
        &mut self,
        conn_id: u64,
        session_id: &str,
        cli: &str,
        cwd: &str,
        proxy_mode: bool,
    ) {
        let outcome = self.registry.register(session_id, cli, cwd, proxy_mode);

        // Invariant: one socket per session. A re-register from a new
        // connection steals the mapping from the old one.
        self.socket_map.insert(session_id.to_string(), conn_id);
        let sessions = self.conn_sessions.entry(conn_id).or_default();
        if !sessions.iter().any(|s| s == session_id) {
            sessions.push(session_id.to_string());
        }

        if outcome == RegisterOutcome::New {
            info!(session = %session_id, cli, cwd, proxy_mode, "session registered");
            let merge_window = self.config.document().push.merge_window_ms;
            self.buffers
                .insert(session_id.to_string(), SessionBuffers::new(merge_window));
            self.runtime
                .insert(session_id.to_string(), SessionRuntime::default());

            // Auto-bind configured defaults.
            let defaults = self.config.defaults().clone();
            if let Some(bot_id) = defaults.default_interactive_bot_id {
                if let Some(bot) = self.config.interactive_bot(&bot_id).cloned() {
                    self.registry.bind_interactive(session_id, &bot_id);
                    self.connector.start_interactive(bot).await;
                } else {
                    warn!(bot = %bot_id, "default interactive bot is not configured");
                }
            }
            if let Some(bot_id) = defaults.default_push_bot_id {
                if self.config.push_bot(&bot_id).is_some() {
                    self.registry.bind_push(session_id, &bot_id);
                } else {
                    warn!(bot = %bot_id, "default push bot is not configured");
                }
            }
        } else {
            debug!(session = %session_id, "session re-registered");
            self.buffers.entry(session_id.to_string()).or_insert_with(|| {
                SessionBuffers::new(self.config.document().push.merge_window_ms)
            });
            self.runtime.entry(session_id.to_string()).or_default();
        }
    }

    fn pty_output(&mut self, session_id: &str, data: &str) {
        let Some(row) = self.registry.get(session_id) else {
            return;
        };
        if !row.is_active() {
            return;
        }
        let row = row.clone();
        self.registry.touch_proxy(session_id);

        let mut timers: Vec<(std::time::Duration, RouterMsg)> = Vec::new();
        {
            let Some(bufs) = self.buffers.get_mut(session_id) else {
                return;
            };

            // The summary tail sees everything, bindings or not.
            bufs.summary.append(data);

            // Hook CLIs deliver their reply via *_notify; proxy-mode
            // sessions via api_proxy_event. Either way the collection
            // buffers stay out of it.
            if !is_hook_cli(&row.cli) && !row.proxy_mode {
                if row.interactive_bot_id.is_some() {
                    if let Some(generation) = bufs.interactive.append(data) {
                        timers.push((
                            INTERACTIVE_SILENCE,
                            RouterMsg::FlushInteractive {
                                session_id: session_id.to_string(),
                                generation,
                            },
                        ));
                    }
                }
                if row.push_bot_id.is_some() && row.push_enabled {
                    if let Some((generation, window)) = bufs.push.append(data) {
                        timers.push((
                            window,
                            RouterMsg::FlushPush {
                                session_id: session_id.to_string(),
                                generation,
                            },
                        ));
                    }
                }
            }
        }
        for (after, msg) in timers {
            self.schedule(after, msg);
        }
    }

    // ── Reply path 1: API proxy events ───────────────────────────────────────

    fn api_proxy_event(&mut self, session_id: &str, message: AssembledMessage) {
        let Some(row) = self.registry.get(session_id) else {
            return;
        };
        if !row.is_active() {
            return;
        }
        let row = row.clone();
        self.registry.set_proxy_mode(session_id);

        if message
            .model
            .to_ascii_lowercase()
            .contains(LIGHTWEIGHT_MODEL_MARKER)
        {
            debug!(session = %session_id, model = %message.model, "dropping lightweight-model turn");
            return;
        }
        if message.is_suggestion {
            debug!(session = %session_id, "dropping suggestion-mode turn");
            return;
        }

        match message.stop_reason.as_str() {
            "tool_use" | "tool_calls" => {
                // Tool activity goes to the push bot only — it is progress
                // notification, not a reply.
                let Some(blocks) = message.tool_use_blocks.as_deref() else {
                    return;
                };
                if blocks.is_empty() {
                    return;
                }
                if let Some(bot) = self.bound_push_bot(&row) {
                    let text = cards::format_tool_activity(blocks);
                    self.dispatch(session_id, ReplyJob::PushText { bot, text });
                }
            }
            _ => {
                // end_turn / stop: the user-visible reply.
                if message.text_content.trim().is_empty() {
                    return;
                }
                let text = truncate_for_send(&message.text_content, self.max_message_bytes());
                self.fan_out_reply(session_id, &row, text);
            }
        }
    }

    // ── Reply path 2: completion hooks ───────────────────────────────────────

    fn hook_notify(&mut self, cwd: &str, message: &str) {
        let Some(row) = self.registry.active_session_for_cwd(cwd) else {
            debug!(cwd, "hook notification without a matching session");
            return;
        };
        let row = row.clone();
        if row.proxy_mode {
            // The proxy path is authoritative for this session.
            return;
        }
        if message.trim().is_empty() {
            return;
        }
        let text = truncate_for_send(message, self.max_message_bytes());
        let session_id = row.session_id.clone();
        self.fan_out_reply(&session_id, &row, text);
    }

    /// Final-reply fan-out: interactive bot as a rich-text post (full
    /// variant), push bot as a basic-variant post.
    fn fan_out_reply(&mut self, session_id: &str, row: &SessionRow, text: String) {
        if let Some(bot) = self.bound_interactive_bot(row) {
            let chat_id = self
                .runtime
                .get(session_id)
                .and_then(|rt| rt.chat_target.clone());
            if let Some(chat_id) = chat_id {
                let remove_ack_from = self
                    .runtime
                    .get_mut(session_id)
                    .and_then(|rt| rt.last_user_message_id.take());
                self.dispatch(
                    session_id,
                    ReplyJob::InteractivePost {
                        bot,
                        chat_id,
                        text: text.clone(),
                        remove_ack_from,
                    },
                );
            } else {
                debug!(session = %session_id, "no chat target yet; interactive reply skipped");
            }
        }
        if let Some(bot) = self.bound_push_bot(row) {
            self.dispatch(session_id, ReplyJob::PushPost { bot, text });
        }
    }

    // ── Reply path 3: terminal fallback ──────────────────────────────────────

    fn flush_interactive(&mut self, session_id: &str, generation: u64) {
        let Some(bufs) = self.buffers.get_mut(session_id) else {
            return;
        };
        let Some(raw) = bufs.interactive.flush(generation) else {
            return;
        };
        let Some(row) = self.registry.get(session_id).cloned() else {
            return;
        };
        if !row.is_active() {
            return;
        }

        let text = self.clean_terminal_reply(&raw);
        if text.is_empty() {
            return;
        }

        let Some(bot) = self.bound_interactive_bot(&row) else {
            return;
        };
        let Some(chat_id) = self
            .runtime
            .get(session_id)
            .and_then(|rt| rt.chat_target.clone())
        else {
            return;
        };
        let remove_ack_from = self
            .runtime
            .get_mut(session_id)
            .and_then(|rt| rt.last_user_message_id.take());
        self.dispatch(
            session_id,
            ReplyJob::InteractivePost {
                bot,
                chat_id,
                text,
                remove_ack_from,
            },
        );
    }

    fn flush_push(&mut self, session_id: &str, generation: u64) {
        let Some(bufs) = self.buffers.get_mut(session_id) else {
            return;
        };
        let Some(raw) = bufs.push.flush(generation) else {
            return;
        };
        let Some(row) = self.registry.get(session_id).cloned() else {
            return;
        };
        if !row.is_active() {
            return;
        }
        let Some(bot) = self.bound_push_bot(&row) else {
            return;
        };

        let text = truncate_for_send(
            ferry_term::strip_escapes(&raw).trim(),
            self.max_message_bytes(),
        );
        if text.is_empty() {
            return;
        }
        self.dispatch(session_id, ReplyJob::PushText { bot, text });
    }

    /// Render raw PTY bytes, extract the assistant prose, cap the size.
    fn clean_terminal_reply(&self, raw: &str) -> String {
        let rendered = ferry_term::render(raw.as_bytes(), ferry_term::RenderOptions::default());
        let extracted = ferry_term::extract_response(&rendered);
        truncate_for_send(extracted.trim(), self.max_message_bytes())
    }

    // ── Inbound chat ─────────────────────────────────────────────────────────

    async fn handle_chat(&mut self, ev: ChatEvent) {
        let Some(bot) = self.config.interactive_bot(&ev.bot_id).cloned() else {
            warn!(bot = %ev.bot_id, "chat event for unknown bot");
            return;
        };
        let msg = ev.message;
        let ack_emoji = self.config.document().ack_emoji.clone();

        // Acknowledge receipt before any routing decision.
        {
            let connector = self.connector.clone();
            let bot = bot.clone();
            let message_id = msg.message_id.clone();
            let ack_emoji = ack_emoji.clone();
            tokio::spawn(async move {
                if let Err(e) = connector.add_reaction(&bot, &message_id, &ack_emoji).await {
                    debug!("ack reaction failed: {e}");
                }
            });
        }

        let Some(extracted) = extract_chat_content(&msg.message_type, &msg.content) else {
            debug!(kind = %msg.message_type, "ignoring non-text chat message");
            return;
        };

        let Some(row) = self.registry.active_session_for_interactive(&ev.bot_id) else {
            // Nothing to route to: tell the user rather than stay silent.
            let connector = self.connector.clone();
            let chat_id = msg.chat_id.clone();
            tokio::spawn(async move {
                let card = cards::no_session_card();
                if let Err(e) = connector.send_interactive_card(&bot, &chat_id, &card).await {
                    warn!("no-session card failed: {e}");
                }
            });
            return;
        };
        let session_id = row.session_id.clone();

        // The chat-side identity is persisted on first sight so the session
        // summary can be addressed even when no reply is in flight.
        let rt = self.runtime.entry(session_id.clone()).or_default();
        rt.chat_target.get_or_insert(msg.chat_id.clone());
        rt.last_user_message_id = Some(msg.message_id.clone());

        if extracted.image_keys.is_empty() {
            let _ = self.tx.try_send(RouterMsg::DeliverInput {
                session_id,
                text: extracted.text,
                images: Vec::new(),
            });
            return;
        }

        // Download attachments first, then deliver text + local paths.
        let connector = self.connector.clone();
        let tx = self.tx.clone();
        let message_id = msg.message_id.clone();
        let dir = ferry_config::paths::session_images_dir(&session_id);
        tokio::spawn(async move {
            let mut images = Vec::new();
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                warn!("cannot create image directory: {e}");
            } else {
                for (idx, key) in extracted.image_keys.iter().enumerate() {
                    match connector.download_image(&bot, &message_id, key).await {
                        Ok(bytes) => {
                            let path = dir.join(format!("{message_id}_{idx}.png"));
                            match tokio::fs::write(&path, &bytes).await {
                                Ok(()) => images.push(path.display().to_string()),
                                Err(e) => warn!("cannot store image: {e}"),
                            }
                        }
                        Err(e) => warn!(key = %key, "image download failed: {e}"),
                    }
                }
            }
            let _ = tx
                .send(RouterMsg::DeliverInput {
                    session_id,
                    text: extracted.text,
                    images,
                })
                .await;
        });
    }

    fn deliver_input(&mut self, session_id: &str, text: String, images: Vec<String>) {
        let Some(row) = self.registry.get(session_id) else {
            return;
        };
        if !row.is_active() {
            return;
        }

        let Some(conn_id) = self.socket_map.get(session_id) else {
            warn!(session = %session_id, "no IPC socket for session; dropping chat input");
            return;
        };
        let Some(writer) = self.conns.get(conn_id) else {
            return;
        };

        let input = self.config.document().input.clone();
        let msg = DaemonMessage::FeishuInput {
            session_id: session_id.to_string(),
            text: format!("{text}\n"),
            images,
            enter_retry_count: input.enter_retry_count,
            enter_retry_interval_ms: input.enter_retry_interval_ms,
        };
        match encode_line(&msg) {
            Ok(line) => {
                if writer.try_send(line).is_err() {
                    warn!(session = %session_id, "IPC writer is backed up; input dropped");
                    return;
                }
            }
            Err(e) => {
                warn!("cannot encode feishu_input: {e}");
                return;
            }
        }

        // Arm the reply collection — unless a reply is already being
        // dispatched, in which case the in-flight collection keeps going.
        // The silence timer itself starts with the first output chunk.
        let pending = self
            .runtime
            .get(session_id)
            .map(|rt| rt.pending_reply)
            .unwrap_or(false);
        if !pending {
            if let Some(bufs) = self.buffers.get_mut(session_id) {
                bufs.interactive.start_collecting();
            }
        }
    }

    // ── Session end ──────────────────────────────────────────────────────────

    async fn end_session(&mut self, session_id: &str) {
        let Some(row) = self.registry.get(session_id).cloned() else {
            return;
        };
        if !row.is_active() {
            return;
        }
        info!(session = %session_id, "session ended");

        // Pending interactive output goes out as one final reply.
        if let Some(raw) = self
            .buffers
            .get_mut(session_id)
            .and_then(|b| b.interactive.force_flush())
        {
            let text = self.clean_terminal_reply(&raw);
            if !text.is_empty() {
                if let (Some(bot), Some(chat_id)) = (
                    self.bound_interactive_bot(&row),
                    self.runtime
                        .get(session_id)
                        .and_then(|rt| rt.chat_target.clone()),
                ) {
                    self.dispatch(
                        session_id,
                        ReplyJob::InteractivePost {
                            bot,
                            chat_id,
                            text,
                            remove_ack_from: None,
                        },
                    );
                }
            }
        }

        // Task summary card from the rolling tail.
        let tail = self
            .buffers
            .get(session_id)
            .map(|b| b.summary.tail().to_string())
            .unwrap_or_default();
        let card = cards::session_summary_card(&row, &tail);
        if let (Some(bot), Some(chat_id)) = (
            self.bound_interactive_bot(&row),
            self.runtime
                .get(session_id)
                .and_then(|rt| rt.chat_target.clone()),
        ) {
            self.dispatch(
                session_id,
                ReplyJob::InteractiveCard {
                    bot,
                    chat_id,
                    card: card.clone(),
                },
            );
        }
        if let Some(bot) = self.bound_push_bot(&row) {
            self.dispatch(session_id, ReplyJob::PushCard { bot, card });
        }

        // Best-effort: clear the 👀-style acknowledgment from the most
        // recent user message.
        if let Some(message_id) = self
            .runtime
            .get_mut(session_id)
            .and_then(|rt| rt.last_user_message_id.take())
        {
            if let Some(bot) = self.bound_interactive_bot(&row) {
                let connector = self.connector.clone();
                let ack_emoji = self.config.document().ack_emoji.clone();
                tokio::spawn(async move {
                    if let Err(e) = connector
                        .remove_reaction(&bot, &message_id, &ack_emoji)
                        .await
                    {
                        debug!("ack reaction cleanup failed: {e}");
                    }
                });
            }
        }

        // Teardown.
        self.registry.end(session_id);
        self.socket_map.remove(session_id);
        self.buffers.remove(session_id);
        if let Some(rt) = self.runtime.get_mut(session_id) {
            rt.ending = true;
            rt.chat_target = None;
            if !rt.pending_reply && rt.queue.is_empty() {
                self.runtime.remove(session_id);
            }
        }

        // Image scratch space for the session.
        let dir = ferry_config::paths::session_images_dir(session_id);
        tokio::spawn(async move {
            let _ = tokio::fs::remove_dir_all(dir).await;
        });

        // Invariant: a bot with zero bound sessions is not kept connected.
        if let Some(bot_id) = row.interactive_bot_id.as_deref() {
            if !self.registry.interactive_bot_in_use(bot_id) {
                self.connector.stop_interactive(bot_id).await;
            }
        }
    }

    async fn handle_client_gone(&mut self, conn_id: u64) {
        self.conns.remove(&conn_id);
        let sessions = self.conn_sessions.remove(&conn_id).unwrap_or_default();
        for session_id in sessions {
            // Only if no newer connection took the session over.
            if self.socket_map.get(&session_id) == Some(&conn_id) {
                debug!(session = %session_id, "IPC client dropped; ending session");
                self.end_session(&session_id).await;
            }
        }
    }

    // ── Bot management requests ──────────────────────────────────────────────

    async fn save_bot(&mut self, conn_id: u64, bot: BotConfig) {
        let result = match bot {
            BotConfig::Interactive(bot) => {
                let id = bot.id.clone();
                let result = self.config.upsert_interactive(bot.clone());
                // A live connection keeps using old credentials otherwise.
                if result.is_ok() && self.connector.has_connection(&id).await {
                    self.connector.stop_interactive(&id).await;
                    self.connector.start_interactive(bot).await;
                }
                result
            }
            BotConfig::Push(bot) => self.config.upsert_push(bot),
        };
        self.respond_ack(conn_id, AckKind::SaveBot, result.err().map(|e| e.to_string()));
    }

    async fn delete_bot(&mut self, conn_id: u64, bot_id: &str) {
        match self.config.delete_bot(bot_id) {
            Ok(true) => {
                let touched = self.registry.unbind_bot_everywhere(bot_id);
                if !touched.is_empty() {
                    info!(bot = %bot_id, sessions = touched.len(), "bot deleted; sessions unbound");
                }
                self.connector.stop_interactive(bot_id).await;
                self.respond_ack(conn_id, AckKind::DeleteBot, None);
            }
            Ok(false) => {
                self.respond_ack(conn_id, AckKind::DeleteBot, Some("bot not found".into()))
            }
            Err(e) => self.respond_ack(conn_id, AckKind::DeleteBot, Some(e.to_string())),
        }
    }

    async fn bind_bot(&mut self, conn_id: u64, session_id: &str, kind: BotKind, bot_id: &str) {
        let error = match kind {
            BotKind::Interactive => match self.config.interactive_bot(bot_id).cloned() {
                None => Some("bot not found".to_string()),
                Some(bot) => {
                    let previous = self
                        .registry
                        .get(session_id)
                        .and_then(|r| r.interactive_bot_id.clone());
                    if self.registry.bind_interactive(session_id, bot_id) {
                        self.connector.start_interactive(bot).await;
                        // Rebinding may have orphaned the previous bot's
                        // connection.
                        if let Some(previous) = previous.filter(|p| p != bot_id) {
                            if !self.registry.interactive_bot_in_use(&previous) {
                                self.connector.stop_interactive(&previous).await;
                            }
                        }
                        None
                    } else {
                        Some("session not found".to_string())
                    }
                }
            },
            BotKind::Push => {
                if self.config.push_bot(bot_id).is_none() {
                    Some("bot not found".to_string())
                } else if self.registry.bind_push(session_id, bot_id) {
                    None
                } else {
                    Some("session not found".to_string())
                }
            }
        };
        self.respond_ack(conn_id, AckKind::BindBot, error);
    }

    async fn unbind_bot(&mut self, conn_id: u64, session_id: &str, kind: BotKind) {
        let error = match kind {
            BotKind::Interactive => {
                let bot_id = self
                    .registry
                    .get(session_id)
                    .and_then(|r| r.interactive_bot_id.clone());
                if self.registry.unbind_interactive(session_id) {
                    if let Some(bot_id) = bot_id {
                        if !self.registry.interactive_bot_in_use(&bot_id) {
                            self.connector.stop_interactive(&bot_id).await;
                        }
                    }
                    None
                } else {
                    Some("session not found".to_string())
                }
            }
            BotKind::Push => {
                if self.registry.unbind_push(session_id) {
                    // Buffer teardown on push unbind: drop pending window.
                    if let Some(bufs) = self.buffers.get_mut(session_id) {
                        let window = bufs.push.window();
                        bufs.push = PushBuffer::new(window);
                    }
                    None
                } else {
                    Some("session not found".to_string())
                }
            }
        };
        self.respond_ack(conn_id, AckKind::UnbindBot, error);
    }

    fn test_bot(&mut self, conn_id: u64, kind: BotKind, bot_id: &str) {
        let Some(writer) = self.conns.get(&conn_id).cloned() else {
            return;
        };
        let connector = self.connector.clone();

        enum Target {
            Interactive(InteractiveBotConfig),
            Push(PushBotConfig),
        }
        let target = match kind {
            BotKind::Interactive => self.config.interactive_bot(bot_id).cloned().map(Target::Interactive),
            BotKind::Push => self.config.push_bot(bot_id).cloned().map(Target::Push),
        };
        let Some(target) = target else {
            self.respond_ack(conn_id, AckKind::TestBot, Some("bot not found".into()));
            return;
        };

        // Network round-trip: answer from a task, not the router loop.
        tokio::spawn(async move {
            let result = match target {
                Target::Interactive(bot) => connector.test_interactive(&bot).await,
                Target::Push(bot) => connector.test_push(&bot).await,
            };
            let msg = DaemonMessage::TestBotResponse {
                ok: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            };
            if let Ok(line) = encode_line(&msg) {
                let _ = writer.send(line).await;
            }
        });
    }

    // ── Reply dispatch (serialized per session) ──────────────────────────────

    fn dispatch(&mut self, session_id: &str, job: ReplyJob) {
        let rt = self.runtime.entry(session_id.to_string()).or_default();
        if rt.pending_reply {
            rt.queue.push_back(job);
            return;
        }
        rt.pending_reply = true;
        self.spawn_send(session_id.to_string(), job);
    }

    fn reply_dispatched(&mut self, session_id: &str) {
        let Some(rt) = self.runtime.get_mut(session_id) else {
            return;
        };
        rt.pending_reply = false;
        if let Some(job) = rt.queue.pop_front() {
            rt.pending_reply = true;
            self.spawn_send(session_id.to_string(), job);
        } else if rt.ending {
            self.runtime.remove(session_id);
        }
    }

    fn spawn_send(&self, session_id: String, job: ReplyJob) {
        let connector = self.connector.clone();
        let tx = self.tx.clone();
        let ack_emoji = self.config.document().ack_emoji.clone();

        tokio::spawn(async move {
            match job {
                ReplyJob::InteractivePost {
                    bot,
                    chat_id,
                    text,
                    remove_ack_from,
                } => {
                    let doc = ferry_richtext::to_post_full(&text, "");
                    if let Err(e) = connector
                        .send_interactive_post(&bot, &chat_id, &doc.into_body())
                        .await
                    {
                        warn!(bot = %bot.id, "interactive reply failed: {e}");
                    } else if let Some(message_id) = remove_ack_from {
                        if let Err(e) = connector
                            .remove_reaction(&bot, &message_id, &ack_emoji)
                            .await
                        {
                            debug!("ack reaction cleanup failed: {e}");
                        }
                    }
                }
                ReplyJob::InteractiveCard { bot, chat_id, card } => {
                    if let Err(e) = connector.send_interactive_card(&bot, &chat_id, &card).await {
                        warn!(bot = %bot.id, "interactive card failed: {e}");
                    }
                }
                ReplyJob::PushText { bot, text } => {
                    send_push(&connector, &tx, &session_id, &bot, cards::webhook_text(&text)).await;
                }
                ReplyJob::PushPost { bot, text } => {
                    let doc = ferry_richtext::to_post_basic(&text, "");
                    send_push(
                        &connector,
                        &tx,
                        &session_id,
                        &bot,
                        cards::webhook_post(doc.into_body()),
                    )
                    .await;
                }
                ReplyJob::PushCard { bot, card } => {
                    send_push(&connector, &tx, &session_id, &bot, cards::webhook_card(card)).await;
                }
            }
            let _ = tx
                .send(RouterMsg::ReplyDispatched { session_id })
                .await;
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn bound_interactive_bot(&self, row: &SessionRow) -> Option<InteractiveBotConfig> {
        row.interactive_bot_id
            .as_deref()
            .and_then(|id| self.config.interactive_bot(id))
            .cloned()
    }

    fn bound_push_bot(&self, row: &SessionRow) -> Option<PushBotConfig> {
        if !row.push_enabled {
            return None;
        }
        row.push_bot_id
            .as_deref()
            .and_then(|id| self.config.push_bot(id))
            .cloned()
    }

    fn max_message_bytes(&self) -> usize {
        self.config.document().push.max_message_bytes
    }

    fn schedule(&self, after: std::time::Duration, msg: RouterMsg) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(msg).await;
        });
    }

    fn respond(&self, conn_id: u64, msg: &DaemonMessage) {
        let Some(writer) = self.conns.get(&conn_id) else {
            return;
        };
        match encode_line(msg) {
            Ok(line) => {
                let _ = writer.try_send(line);
            }
            Err(e) => warn!("cannot encode response: {e}"),
        }
    }

    fn respond_ack(&self, conn_id: u64, kind: AckKind, error: Option<String>) {
        let ok = error.is_none();
        let msg = match kind {
            AckKind::SaveBot => DaemonMessage::SaveBotResponse { ok, error },
            AckKind::DeleteBot => DaemonMessage::DeleteBotResponse { ok, error },
            AckKind::BindBot => DaemonMessage::BindBotResponse { ok, error },
            AckKind::UnbindBot => DaemonMessage::UnbindBotResponse { ok, error },
            AckKind::TestBot => DaemonMessage::TestBotResponse { ok, error },
            AckKind::SaveConfig => DaemonMessage::SaveConfigResponse { ok, error },
            AckKind::SetDefaultBot => DaemonMessage::SetDefaultBotResponse { ok, error },
            AckKind::SetupCodexConfig => DaemonMessage::SetupCodexConfigResponse { ok, error },
            AckKind::SetupClaudeConfig => DaemonMessage::SetupClaudeConfigResponse { ok, error },
        };
        self.respond(conn_id, &msg);
    }

    /// Graceful drain: force-flush pending interactive buffers, stop chat
    /// connections, give in-flight sends a moment to finish.
    async fn drain(&mut self) {
        self.shutdown.cancel();

        let session_ids: Vec<String> = self.buffers.keys().cloned().collect();
        for session_id in session_ids {
            let Some(raw) = self
                .buffers
                .get_mut(&session_id)
                .and_then(|b| b.interactive.force_flush())
            else {
                continue;
            };
            let Some(row) = self.registry.get(&session_id).cloned() else {
                continue;
            };
            let text = self.clean_terminal_reply(&raw);
            if text.is_empty() {
                continue;
            }
            if let (Some(bot), Some(chat_id)) = (
                self.bound_interactive_bot(&row),
                self.runtime
                    .get(&session_id)
                    .and_then(|rt| rt.chat_target.clone()),
            ) {
                self.dispatch(
                    &session_id,
                    ReplyJob::InteractivePost {
                        bot,
                        chat_id,
                        text,
                        remove_ack_from: None,
                    },
                );
            }
        }

        // Best-effort grace for the spawned sends.
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.connector.stop_all().await;
    }
}

enum AckKind {
    SaveBot,
    DeleteBot,
    BindBot,
    UnbindBot,
    TestBot,
    SaveConfig,
    SetDefaultBot,
    SetupCodexConfig,
    SetupClaudeConfig,
}

async fn send_push<T: ChatTransport>(
    connector: &ChatConnector<T>,
    tx: &mpsc::Sender<RouterMsg>,
    session_id: &str,
    bot: &PushBotConfig,
    payload: Value,
) {
    match connector.send_webhook_card(bot, &payload).await {
        Ok(SendOutcome::Delivered) => {}
        Ok(SendOutcome::RateLimited) => {
            let _ = tx
                .send(RouterMsg::PushRateLimited {
                    session_id: session_id.to_string(),
                })
                .await;
        }
        Err(e) => warn!(bot = %bot.id, "push send failed: {e}"),
    }
}

/// Hook-set membership: CLIs that ship their own completion hook.
fn is_hook_cli(cli: &str) -> bool {
    let base = cli
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(cli)
        .to_ascii_lowercase();
    let base = base
        .strip_suffix(".exe")
        .or_else(|| base.strip_suffix(".cmd"))
        .or_else(|| base.strip_suffix(".bat"))
        .unwrap_or(&base);
    matches!(base, "codex" | "claude")
}

// ── Chat content extraction ───────────────────────────────────────────────────

struct ExtractedContent {
    text: String,
    image_keys: Vec<String>,
}

/// Pull plain text and image keys out of the service's opaque content JSON.
///
/// `text` messages carry `{"text": ...}`; `image` messages an
/// `{"image_key": ...}`; `post` messages nest runs of tagged nodes. Every
/// other message type is ignored.
fn extract_chat_content(message_type: &str, content: &str) -> Option<ExtractedContent> {
    let v: Value = serde_json::from_str(content).ok()?;
    match message_type {
        "text" => {
            let text = v["text"].as_str()?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(ExtractedContent {
                text,
                image_keys: Vec::new(),
            })
        }
        "image" => {
            let key = v["image_key"].as_str()?.to_string();
            Some(ExtractedContent {
                text: String::new(),
                image_keys: vec![key],
            })
        }
        "post" => {
            let mut text = String::new();
            let mut image_keys = Vec::new();
            let content = v
                .get("content")
                .and_then(|c| c.as_array())
                .cloned()
                .unwrap_or_default();
            for paragraph in &content {
                let Some(nodes) = paragraph.as_array() else {
                    continue;
                };
                for node in nodes {
                    match node["tag"].as_str().unwrap_or("") {
                        "text" => {
                            if let Some(t) = node["text"].as_str() {
                                text.push_str(t);
                            }
                        }
                        "a" => {
                            if let Some(t) = node["text"].as_str() {
                                text.push_str(t);
                            }
                        }
                        "img" => {
                            if let Some(k) = node["image_key"].as_str() {
                                image_keys.push(k.to_string());
                            }
                        }
                        _ => {}
                    }
                }
                text.push('\n');
            }
            let text = text.trim().to_string();
            if text.is_empty() && image_keys.is_empty() {
                return None;
            }
            Some(ExtractedContent { text, image_keys })
        }
        _ => None,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
