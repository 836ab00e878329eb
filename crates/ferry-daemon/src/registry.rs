// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! In-memory session registry.
//!
//! Rows are plain data — no upward pointers, no I/O. All mutation happens
//! from the router's single event loop, so the registry needs no interior
//! locking of its own.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use ferry_proto::{SessionSnapshot, SessionStatus};

/// Ended rows linger this long before pruning, so a `status_request` right
/// after a session closed still explains what happened.
pub const ENDED_RETENTION_MINUTES: i64 = 30;

fn ended_retention() -> Duration {
    Duration::minutes(ENDED_RETENTION_MINUTES)
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub cli: String,
    pub cwd: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub interactive_bot_id: Option<String>,
    pub push_bot_id: Option<String>,
    pub push_enabled: bool,
    pub proxy_mode: bool,
}

impl SessionRow {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            cli: self.cli.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            started_at: self.started_at,
            updated_at: self.updated_at,
            interactive_bot_id: self.interactive_bot_id.clone(),
            push_bot_id: self.push_bot_id.clone(),
            push_enabled: self.push_enabled,
            proxy_mode: self.proxy_mode,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status != SessionStatus::Ended
    }
}

/// Result of a `register` call; a new registration triggers default-bot
/// binding, a refresh must not disturb existing bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    New,
    Refreshed,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    rows: HashMap<String, SessionRow>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a session.
    ///
    /// Re-registering a still-active session keeps its bindings and only
    /// refreshes cli/cwd/timestamps — the CLI host re-registers after a
    /// daemon restart and must not lose its configuration. An ended row
    /// never transitions back; registering its id starts a fresh lifecycle.
    pub fn register(
        &mut self,
        session_id: &str,
        cli: &str,
        cwd: &str,
        proxy_mode: bool,
    ) -> RegisterOutcome {
        let now = Utc::now();
        match self.rows.get_mut(session_id) {
            Some(row) if row.is_active() => {
                row.cli = cli.to_string();
                row.cwd = cwd.to_string();
                row.proxy_mode = row.proxy_mode || proxy_mode;
                row.updated_at = now;
                RegisterOutcome::Refreshed
            }
            _ => {
                self.rows.insert(
                    session_id.to_string(),
                    SessionRow {
                        session_id: session_id.to_string(),
                        cli: cli.to_string(),
                        cwd: cwd.to_string(),
                        status: SessionStatus::Listening,
                        started_at: now,
                        updated_at: now,
                        interactive_bot_id: None,
                        push_bot_id: None,
                        push_enabled: true,
                        proxy_mode,
                    },
                );
                RegisterOutcome::New
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionRow> {
        self.rows.get(session_id)
    }

    /// First PTY output: `Listening → ProxyOn`. Ended rows stay ended.
    pub fn touch_proxy(&mut self, session_id: &str) {
        if let Some(row) = self.rows.get_mut(session_id) {
            if row.status == SessionStatus::Listening {
                row.status = SessionStatus::ProxyOn;
            }
            row.updated_at = Utc::now();
        }
    }

    /// Mark the session as using the API-proxy reply path.
    pub fn set_proxy_mode(&mut self, session_id: &str) {
        if let Some(row) = self.rows.get_mut(session_id) {
            row.proxy_mode = true;
        }
    }

    /// Terminal transition. Idempotent.
    pub fn end(&mut self, session_id: &str) {
        if let Some(row) = self.rows.get_mut(session_id) {
            row.status = SessionStatus::Ended;
            row.updated_at = Utc::now();
        }
    }

    /// Bind a bot. `false` when the session does not exist — binding never
    /// creates sessions.
    pub fn bind_interactive(&mut self, session_id: &str, bot_id: &str) -> bool {
        match self.rows.get_mut(session_id) {
            Some(row) if row.is_active() => {
                row.interactive_bot_id = Some(bot_id.to_string());
                row.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn bind_push(&mut self, session_id: &str, bot_id: &str) -> bool {
        match self.rows.get_mut(session_id) {
            Some(row) if row.is_active() => {
                row.push_bot_id = Some(bot_id.to_string());
                row.push_enabled = true;
                row.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn unbind_interactive(&mut self, session_id: &str) -> bool {
        match self.rows.get_mut(session_id) {
            Some(row) if row.is_active() => {
                row.interactive_bot_id = None;
                row.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    pub fn unbind_push(&mut self, session_id: &str) -> bool {
        match self.rows.get_mut(session_id) {
            Some(row) if row.is_active() => {
                row.push_bot_id = None;
                row.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Remove `bot_id` from every session's bindings (bot was deleted).
    /// Returns the ids of sessions that referenced it.
    pub fn unbind_bot_everywhere(&mut self, bot_id: &str) -> Vec<String> {
        let mut touched = Vec::new();
        for row in self.rows.values_mut() {
            let mut hit = false;
            if row.interactive_bot_id.as_deref() == Some(bot_id) {
                row.interactive_bot_id = None;
                hit = true;
            }
            if row.push_bot_id.as_deref() == Some(bot_id) {
                row.push_bot_id = None;
                hit = true;
            }
            if hit {
                row.updated_at = Utc::now();
                touched.push(row.session_id.clone());
            }
        }
        touched
    }

    /// The active session currently bound to an interactive bot, if any.
    ///
    /// At most one is expected in practice (one chat ↔ one terminal); when
    /// several match, the most recently updated one wins.
    pub fn active_session_for_interactive(&self, bot_id: &str) -> Option<&SessionRow> {
        self.rows
            .values()
            .filter(|r| r.is_active() && r.interactive_bot_id.as_deref() == Some(bot_id))
            .max_by_key(|r| r.updated_at)
    }

    /// Active session whose working directory matches exactly (hook path).
    pub fn active_session_for_cwd(&self, cwd: &str) -> Option<&SessionRow> {
        self.rows
            .values()
            .filter(|r| r.is_active() && r.cwd == cwd)
            .max_by_key(|r| r.updated_at)
    }

    /// True when any active session still references this interactive bot.
    pub fn interactive_bot_in_use(&self, bot_id: &str) -> bool {
        self.rows
            .values()
            .any(|r| r.is_active() && r.interactive_bot_id.as_deref() == Some(bot_id))
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut rows: Vec<_> = self.rows.values().collect();
        rows.sort_by_key(|r| r.started_at);
        rows.iter().map(|r| r.snapshot()).collect()
    }

    /// Drop ended rows older than the retention window.
    pub fn prune_ended(&mut self) {
        let cutoff = Utc::now() - ended_retention();
        self.rows
            .retain(|_, row| row.is_active() || row.updated_at > cutoff);
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get() {
        let mut reg = SessionRegistry::new();
        assert_eq!(
            reg.register("s1", "claude", "/work", false),
            RegisterOutcome::New
        );
        let row = reg.get("s1").unwrap();
        assert_eq!(row.status, SessionStatus::Listening);
        assert!(row.push_enabled);
    }

    #[test]
    fn reregister_preserves_bindings() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/work", false);
        assert!(reg.bind_interactive("s1", "b1"));
        assert!(reg.bind_push("s1", "p1"));

        assert_eq!(
            reg.register("s1", "claude", "/elsewhere", false),
            RegisterOutcome::Refreshed
        );
        let row = reg.get("s1").unwrap();
        assert_eq!(row.interactive_bot_id.as_deref(), Some("b1"));
        assert_eq!(row.push_bot_id.as_deref(), Some("p1"));
        assert_eq!(row.cwd, "/elsewhere");
    }

    #[test]
    fn ended_is_terminal_and_reregister_starts_fresh() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/work", false);
        reg.bind_interactive("s1", "b1");
        reg.end("s1");

        // touch_proxy must not resurrect.
        reg.touch_proxy("s1");
        assert_eq!(reg.get("s1").unwrap().status, SessionStatus::Ended);

        // Registering the same id starts over without the old bindings.
        assert_eq!(
            reg.register("s1", "claude", "/work", false),
            RegisterOutcome::New
        );
        let row = reg.get("s1").unwrap();
        assert_eq!(row.status, SessionStatus::Listening);
        assert!(row.interactive_bot_id.is_none());
    }

    #[test]
    fn touch_proxy_transitions_once() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "codex", "/w", false);
        reg.touch_proxy("s1");
        assert_eq!(reg.get("s1").unwrap().status, SessionStatus::ProxyOn);
        reg.touch_proxy("s1");
        assert_eq!(reg.get("s1").unwrap().status, SessionStatus::ProxyOn);
    }

    #[test]
    fn bind_on_missing_session_is_refused() {
        let mut reg = SessionRegistry::new();
        assert!(!reg.bind_interactive("ghost", "b1"));
        assert!(!reg.bind_push("ghost", "p1"));
        assert!(reg.get("ghost").is_none(), "bind must not create sessions");
    }

    #[test]
    fn bind_on_ended_session_is_refused() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/w", false);
        reg.end("s1");
        assert!(!reg.bind_interactive("s1", "b1"));
    }

    #[test]
    fn unbind_on_ended_session_is_refused() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/w", false);
        reg.bind_interactive("s1", "b1");
        reg.bind_push("s1", "p1");
        reg.end("s1");
        assert!(!reg.unbind_interactive("s1"));
        assert!(!reg.unbind_push("s1"));
        // The ended row keeps its bindings untouched.
        let row = reg.get("s1").unwrap();
        assert_eq!(row.interactive_bot_id.as_deref(), Some("b1"));
        assert_eq!(row.push_bot_id.as_deref(), Some("p1"));
    }

    #[test]
    fn unbind_bot_everywhere_clears_all_references() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/a", false);
        reg.register("s2", "codex", "/b", false);
        reg.bind_interactive("s1", "b1");
        reg.bind_push("s2", "b1");

        let touched = reg.unbind_bot_everywhere("b1");
        assert_eq!(touched.len(), 2);
        assert!(reg.get("s1").unwrap().interactive_bot_id.is_none());
        assert!(reg.get("s2").unwrap().push_bot_id.is_none());
    }

    #[test]
    fn active_session_lookup_ignores_ended_rows() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "claude", "/w", false);
        reg.bind_interactive("s1", "b1");
        reg.end("s1");
        assert!(reg.active_session_for_interactive("b1").is_none());
        assert!(!reg.interactive_bot_in_use("b1"));
    }

    #[test]
    fn cwd_lookup_is_exact() {
        let mut reg = SessionRegistry::new();
        reg.register("s1", "codex", "/home/u/project", false);
        assert!(reg.active_session_for_cwd("/home/u/project").is_some());
        assert!(reg.active_session_for_cwd("/home/u/proj").is_none());
    }

    #[test]
    fn prune_keeps_active_and_recent_rows() {
        let mut reg = SessionRegistry::new();
        reg.register("live", "claude", "/a", false);
        reg.register("done", "claude", "/b", false);
        reg.end("done");

        reg.prune_ended();
        // The ended row is recent, so both survive.
        assert!(reg.get("live").is_some());
        assert!(reg.get("done").is_some());

        // Age the ended row artificially past retention.
        if let Some(row) = reg.rows.get_mut("done") {
            row.updated_at = Utc::now() - ended_retention() - Duration::minutes(1);
        }
        reg.prune_ended();
        assert!(reg.get("live").is_some());
        assert!(reg.get("done").is_none());
    }
}
