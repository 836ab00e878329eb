// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Completion-hook configuration for the two AI CLIs that ship one.
//!
//! Both tools can announce a finished turn out-of-band, which gives ferry a
//! clean reply string without terminal scraping:
//!
//! - **codex** — `~/.codex/config.toml`, a `notify = [command...]` array
//!   invoked with the turn summary as its final JSON argument.
//! - **claude** — `~/.claude/settings.json`, a `hooks.Stop` entry whose
//!   command receives the hook payload on stdin.
//!
//! Both are pointed at `ferry notify <tool>`, which relays the payload to
//! the daemon as a `codex_notify` / `claude_notify` event.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Result of a `check_*_config` request.
#[derive(Debug, Clone)]
pub struct HookStatus {
    pub configured: bool,
    pub path: PathBuf,
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn ferry_exe() -> String {
    std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "ferry".to_string())
}

// ── codex (TOML, notify array) ────────────────────────────────────────────────

pub fn codex_config_path() -> PathBuf {
    home().join(".codex").join("config.toml")
}

pub fn check_codex(path: &Path) -> HookStatus {
    let configured = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| text.parse::<toml::Table>().ok())
        .and_then(|table| table.get("notify").cloned())
        .map(|notify| notify.to_string().contains("ferry"))
        .unwrap_or(false);
    HookStatus {
        configured,
        path: path.to_path_buf(),
    }
}

/// Point the codex `notify` hook at `ferry notify codex`.
///
/// The rest of the document is preserved; only the `notify` key is
/// replaced.
pub fn setup_codex(path: &Path) -> anyhow::Result<()> {
    let mut table = match std::fs::read_to_string(path) {
        Ok(text) => text
            .parse::<toml::Table>()
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    table.insert(
        "notify".to_string(),
        toml::Value::Array(vec![
            toml::Value::String(ferry_exe()),
            toml::Value::String("notify".into()),
            toml::Value::String("codex".into()),
        ]),
    );

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, toml::to_string_pretty(&table)?)
        .with_context(|| format!("writing {}", path.display()))
}

// ── claude (JSON, Stop hook) ──────────────────────────────────────────────────

pub fn claude_settings_path() -> PathBuf {
    home().join(".claude").join("settings.json")
}

pub fn check_claude(path: &Path) -> HookStatus {
    let configured = std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .map(|doc| doc["hooks"]["Stop"].to_string().contains("ferry"))
        .unwrap_or(false);
    HookStatus {
        configured,
        path: path.to_path_buf(),
    }
}

/// Install a `hooks.Stop` entry invoking `ferry notify claude`.
///
/// Existing settings (and any foreign Stop hooks) are preserved; a previous
/// ferry entry is replaced rather than duplicated.
pub fn setup_claude(path: &Path) -> anyhow::Result<()> {
    let mut doc: serde_json::Value = match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => serde_json::json!({}),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let command = format!("{} notify claude", ferry_exe());
    let entry = serde_json::json!({
        "matcher": "",
        "hooks": [{ "type": "command", "command": command }]
    });

    let hooks = doc
        .as_object_mut()
        .context("settings root must be an object")?
        .entry("hooks")
        .or_insert_with(|| serde_json::json!({}));
    let stop = hooks
        .as_object_mut()
        .context("hooks must be an object")?
        .entry("Stop")
        .or_insert_with(|| serde_json::json!([]));

    match stop.as_array_mut() {
        Some(arr) => {
            arr.retain(|e| !e.to_string().contains("ferry"));
            arr.push(entry);
        }
        None => *stop = serde_json::json!([entry]),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&doc)?)
        .with_context(|| format!("writing {}", path.display()))
}

// ── Unit tests ────────────────────────────────────────────────────────────────
