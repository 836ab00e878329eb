// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Upstream origin resolution, keyed on the wrapped tool's identity.
//!
//! The proxy must forward to wherever the tool would have gone on its own,
//! or interposing it silently changes behaviour. Resolution order:
//!
//! 1. the tool's well-known base-URL environment variable,
//! 2. (claude only) the `env` block of `~/.claude/settings.json`,
//! 3. the provider's public default.

use std::path::Path;

/// The two wrapped tools the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// Anthropic-style stream; node runtime.
    Claude,
    /// OpenAI-style stream; static binary.
    Codex,
}

impl ToolKind {
    pub fn base_url_env(&self) -> &'static str {
        match self {
            ToolKind::Claude => "ANTHROPIC_BASE_URL",
            ToolKind::Codex => "OPENAI_BASE_URL",
        }
    }

    pub fn default_upstream(&self) -> &'static str {
        match self {
            ToolKind::Claude => "https://api.anthropic.com",
            ToolKind::Codex => "https://api.openai.com",
        }
    }
}

/// Derive the tool kind from the command as invoked: basename, with
/// `.exe` / `.cmd` / `.bat` stripped, case-insensitive.
pub fn tool_kind(cli: &str) -> Option<ToolKind> {
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
    match base {
        "claude" => Some(ToolKind::Claude),
        "codex" => Some(ToolKind::Codex),
        _ => None,
    }
}

/// Resolve the upstream origin for `kind`.
///
/// `env` is injected for testability; production passes
/// `|k| std::env::var(k).ok()`. `claude_settings` points at the tool's
/// settings file (usually `~/.claude/settings.json`).
pub fn resolve_upstream(
    kind: ToolKind,
    env: impl Fn(&str) -> Option<String>,
    claude_settings: &Path,
) -> String {
    if let Some(url) = env(kind.base_url_env()).filter(|v| !v.trim().is_empty()) {
        return normalize_origin(&url);
    }

    if kind == ToolKind::Claude {
        if let Some(url) = claude_settings_base_url(claude_settings) {
            return normalize_origin(&url);
        }
    }

    kind.default_upstream().to_string()
}

/// Read `env.ANTHROPIC_BASE_URL` out of the claude settings file.
fn claude_settings_base_url(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let doc: serde_json::Value = serde_json::from_str(&text).ok()?;
    doc["env"]["ANTHROPIC_BASE_URL"]
        .as_str()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

fn normalize_origin(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_kind_from_basename() {
        assert_eq!(tool_kind("claude"), Some(ToolKind::Claude));
        assert_eq!(tool_kind("/usr/bin/claude"), Some(ToolKind::Claude));
        assert_eq!(tool_kind(r"C:\npm\claude.CMD"), Some(ToolKind::Claude));
        assert_eq!(tool_kind("codex.exe"), Some(ToolKind::Codex));
        assert_eq!(tool_kind("aider"), None);
    }

    #[test]
    fn env_var_wins() {
        let dir = tempfile::tempdir().unwrap();
        let url = resolve_upstream(
            ToolKind::Claude,
            |k| (k == "ANTHROPIC_BASE_URL").then(|| "https://gw.corp.example/".to_string()),
            &dir.path().join("settings.json"),
        );
        assert_eq!(url, "https://gw.corp.example");
    }

    #[test]
    fn claude_falls_back_to_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(
            &settings,
            r#"{"env":{"ANTHROPIC_BASE_URL":"https://relay.example"}}"#,
        )
        .unwrap();
        let url = resolve_upstream(ToolKind::Claude, |_| None, &settings);
        assert_eq!(url, "https://relay.example");
    }

    #[test]
    fn codex_ignores_claude_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(
            &settings,
            r#"{"env":{"ANTHROPIC_BASE_URL":"https://relay.example"}}"#,
        )
        .unwrap();
        let url = resolve_upstream(ToolKind::Codex, |_| None, &settings);
        assert_eq!(url, "https://api.openai.com");
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() {
        let dir = tempfile::tempdir().unwrap();
        let url = resolve_upstream(
            ToolKind::Claude,
            |_| None,
            &dir.path().join("settings.json"),
        );
        assert_eq!(url, "https://api.anthropic.com");
    }

    #[test]
    fn empty_env_value_is_treated_as_unset() {
        let dir = tempfile::tempdir().unwrap();
        let url = resolve_upstream(
            ToolKind::Codex,
            |_| Some("  ".to_string()),
            &dir.path().join("settings.json"),
        );
        assert_eq!(url, "https://api.openai.com");
    }
}
