// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Config store — loads, mutates and persists the configuration document.
//!
//! All secret fields pass through the [`SecretStore`] at this boundary:
//! encrypted on every save, decrypted on load, plaintext in memory. A write
//! is atomic (temp file + rename) so a crash mid-save never leaves a
//! half-written `config.json` behind.
//!
//! A corrupt document is replaced with defaults rather than refusing to
//! start; a corrupt *key file* is fatal (see [`SecretStore::open`]).

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::warn;

use crate::schema::{ConfigDocument, DefaultBots, InteractiveBotConfig, PushBotConfig, Settings};
use crate::secret::SecretStore;

pub struct ConfigStore {
    path: PathBuf,
    secrets: SecretStore,
    doc: ConfigDocument,
}

impl ConfigStore {
    /// Open the store: load the master key, then the document.
    ///
    /// A missing document is created from defaults; an unreadable or corrupt
    /// one is overwritten with defaults (the old content is logged away).
    pub fn open(config_path: &Path, key_path: &Path) -> anyhow::Result<Self> {
        let secrets = SecretStore::open(key_path)?;

        let doc = match std::fs::read_to_string(config_path) {
            Ok(text) => match serde_json::from_str::<ConfigDocument>(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(
                        path = %config_path.display(),
                        error = %e,
                        "config document is corrupt; resetting to defaults"
                    );
                    ConfigDocument::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigDocument::default(),
            Err(e) => {
                warn!(
                    path = %config_path.display(),
                    error = %e,
                    "config document is unreadable; resetting to defaults"
                );
                ConfigDocument::default()
            }
        };

        let mut store = Self {
            path: config_path.to_path_buf(),
            secrets,
            doc,
        };
        store.decrypt_in_place()?;
        // Write-through so a fresh install has a file to point the user at,
        // and so hand-entered plaintext secrets get sealed immediately.
        store.save()?;
        Ok(store)
    }

    /// The current document (secrets in plaintext).
    pub fn document(&self) -> &ConfigDocument {
        &self.doc
    }

    pub fn interactive_bot(&self, id: &str) -> Option<&InteractiveBotConfig> {
        self.doc.bots.interactive.iter().find(|b| b.id == id)
    }

    pub fn push_bot(&self, id: &str) -> Option<&PushBotConfig> {
        self.doc.bots.push.iter().find(|b| b.id == id)
    }

    pub fn defaults(&self) -> &DefaultBots {
        &self.doc.defaults
    }

    /// Insert or replace an interactive bot by id.
    pub fn upsert_interactive(&mut self, bot: InteractiveBotConfig) -> anyhow::Result<()> {
        match self.doc.bots.interactive.iter_mut().find(|b| b.id == bot.id) {
            Some(slot) => *slot = bot,
            None => self.doc.bots.interactive.push(bot),
        }
        self.save()
    }

    /// Insert or replace a push bot by id.
    pub fn upsert_push(&mut self, bot: PushBotConfig) -> anyhow::Result<()> {
        match self.doc.bots.push.iter_mut().find(|b| b.id == bot.id) {
            Some(slot) => *slot = bot,
            None => self.doc.bots.push.push(bot),
        }
        self.save()
    }

    /// Delete a bot from either list. Clears a matching default binding.
    ///
    /// Returns `false` when no bot with that id exists (the caller answers
    /// `{ok:false, error:"bot not found"}`).
    pub fn delete_bot(&mut self, id: &str) -> anyhow::Result<bool> {
        let before =
            self.doc.bots.interactive.len() + self.doc.bots.push.len();
        self.doc.bots.interactive.retain(|b| b.id != id);
        self.doc.bots.push.retain(|b| b.id != id);
        let found = self.doc.bots.interactive.len() + self.doc.bots.push.len() != before;
        if !found {
            return Ok(false);
        }

        if self.doc.defaults.default_interactive_bot_id.as_deref() == Some(id) {
            self.doc.defaults.default_interactive_bot_id = None;
        }
        if self.doc.defaults.default_push_bot_id.as_deref() == Some(id) {
            self.doc.defaults.default_push_bot_id = None;
        }

        self.save()?;
        Ok(true)
    }

    /// Set (or clear, with `None`) a default bot. Validates existence.
    pub fn set_default_interactive(&mut self, id: Option<String>) -> anyhow::Result<bool> {
        if let Some(ref id) = id {
            if self.interactive_bot(id).is_none() {
                return Ok(false);
            }
        }
        self.doc.defaults.default_interactive_bot_id = id;
        self.save()?;
        Ok(true)
    }

    pub fn set_default_push(&mut self, id: Option<String>) -> anyhow::Result<bool> {
        if let Some(ref id) = id {
            if self.push_bot(id).is_none() {
                return Ok(false);
            }
        }
        self.doc.defaults.default_push_bot_id = id;
        self.save()?;
        Ok(true)
    }

    /// Replace the non-bot portion of the document.
    ///
    /// `defaults` and `input` are preserved when the caller omits them, so
    /// an older controller build cannot wipe newer sections.
    pub fn save_settings(&mut self, settings: Settings) -> anyhow::Result<()> {
        self.doc.reconnect = settings.reconnect;
        self.doc.push = settings.push;
        if let Some(defaults) = settings.defaults {
            self.doc.defaults = defaults;
        }
        if let Some(input) = settings.input {
            self.doc.input = input;
        }
        self.save()
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Serialize with secrets encrypted, then atomically replace the file.
    fn save(&mut self) -> anyhow::Result<()> {
        let mut on_disk = self.doc.clone();
        for bot in &mut on_disk.bots.interactive {
            bot.app_secret = self.secrets.encrypt(&bot.app_secret)?;
            if let Some(key) = bot.encrypt_key.take() {
                bot.encrypt_key = Some(self.secrets.encrypt(&key)?);
            }
        }
        for bot in &mut on_disk.bots.push {
            if let Some(secret) = bot.secret.take() {
                bot.secret = Some(self.secrets.encrypt(&secret)?);
            }
        }

        let json = serde_json::to_string_pretty(&on_disk).context("serializing config")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }

    fn decrypt_in_place(&mut self) -> anyhow::Result<()> {
        for bot in &mut self.doc.bots.interactive {
            bot.app_secret = self.secrets.decrypt(&bot.app_secret)?;
            if let Some(key) = bot.encrypt_key.take() {
                bot.encrypt_key = Some(self.secrets.decrypt(&key)?);
            }
        }
        for bot in &mut self.doc.bots.push {
            if let Some(secret) = bot.secret.take() {
                bot.secret = Some(self.secrets.decrypt(&secret)?);
            }
        }
        Ok(())
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn open_in(dir: &tempfile::TempDir) -> ConfigStore {
        ConfigStore::open(&dir.path().join("config.json"), &dir.path().join(".master-key"))
            .unwrap()
    }

    fn sample_interactive(id: &str) -> InteractiveBotConfig {
        InteractiveBotConfig {
            id: id.into(),
            name: format!("bot {id}"),
            app_id: "cli_a1b2".into(),
            app_secret: "s3cr3t".into(),
            encrypt_key: Some("evkey".into()),
        }
    }

    #[test]
    fn missing_document_starts_with_defaults_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_in(&dir);
        assert_eq!(store.document().reconnect.max_retries, 5);
        assert!(dir.path().join("config.json").exists());
    }

    #[test]
    fn corrupt_document_is_replaced_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let store = open_in(&dir);
        assert!(store.document().bots.interactive.is_empty());
    }

    #[test]
    fn secrets_are_encrypted_on_disk_and_plaintext_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.upsert_interactive(sample_interactive("b1")).unwrap();

        // In memory: plaintext.
        assert_eq!(store.interactive_bot("b1").unwrap().app_secret, "s3cr3t");

        // On disk: enc: prefix, no plaintext anywhere.
        let text = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!text.contains("s3cr3t"));
        assert!(text.contains("enc:"));
    }

    #[test]
    fn save_then_reload_round_trips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = open_in(&dir);
            store.upsert_interactive(sample_interactive("b1")).unwrap();
        }
        let store = open_in(&dir);
        let bot = store.interactive_bot("b1").unwrap();
        assert_eq!(bot.app_secret, "s3cr3t");
        assert_eq!(bot.encrypt_key.as_deref(), Some("evkey"));
    }

    #[test]
    fn upsert_replaces_existing_bot() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.upsert_interactive(sample_interactive("b1")).unwrap();
        let mut updated = sample_interactive("b1");
        updated.name = "renamed".into();
        store.upsert_interactive(updated).unwrap();
        assert_eq!(store.document().bots.interactive.len(), 1);
        assert_eq!(store.interactive_bot("b1").unwrap().name, "renamed");
    }

    #[test]
    fn delete_bot_clears_matching_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.upsert_interactive(sample_interactive("b1")).unwrap();
        assert!(store.set_default_interactive(Some("b1".into())).unwrap());

        assert!(store.delete_bot("b1").unwrap());
        assert!(store.defaults().default_interactive_bot_id.is_none());
    }

    #[test]
    fn delete_unknown_bot_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        assert!(!store.delete_bot("ghost").unwrap());
    }

    #[test]
    fn set_default_validates_existence() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        assert!(!store.set_default_interactive(Some("nope".into())).unwrap());
        assert!(store.set_default_interactive(None).unwrap());
    }

    #[test]
    fn save_settings_preserves_omitted_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.upsert_interactive(sample_interactive("b1")).unwrap();
        store.set_default_interactive(Some("b1".into())).unwrap();

        store
            .save_settings(Settings {
                reconnect: crate::schema::ReconnectConfig {
                    max_retries: 9,
                    initial_interval: 1,
                    backoff_multiplier: 1.5,
                },
                push: crate::schema::PushConfig {
                    merge_window_ms: 750,
                    max_message_bytes: 2048,
                },
                defaults: None,
                input: None,
            })
            .unwrap();

        assert_eq!(store.document().reconnect.max_retries, 9);
        assert_eq!(store.document().push.merge_window_ms, 750);
        // Omitted sections kept.
        assert_eq!(
            store.defaults().default_interactive_bot_id.as_deref(),
            Some("b1")
        );
        assert_eq!(store.document().input.enter_retry_count, 3);
    }

    #[test]
    fn no_tmp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = open_in(&dir);
        store.upsert_push(PushBotConfig {
            id: "p1".into(),
            name: "alerts".into(),
            webhook_url: "https://open.feishu.cn/open-apis/bot/v2/hook/x".into(),
            secret: Some("signing".into()),
        })
        .unwrap();
        assert!(!dir.path().join("config.json.tmp").exists());
    }
}
