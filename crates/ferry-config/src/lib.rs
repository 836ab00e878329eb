// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Ferry's on-disk state: the configuration document and the secret store.
//!
//! Everything lives under `~/.ferry/`:
//!
//! - `config.json`   — the configuration document; human-readable JSON with
//!   sensitive fields stored as `enc:`-prefixed ciphertext.
//! - `.master-key`   — hex-encoded 32-byte AES key, owner-only permissions.
//! - `daemon.json`   — daemon lock file (written by the daemon, not here).
//! - `daemon.sock`   — IPC endpoint (POSIX; Windows uses a named pipe).
//! - `images/<id>/`  — inbound chat images, per session.
//!
//! Secrets cross the plaintext/ciphertext boundary exactly once, inside
//! [`store::ConfigStore`]: encrypted on save, decrypted on load, always
//! plaintext in memory.

pub mod paths;
pub mod schema;
pub mod secret;
pub mod store;

pub use schema::{
    BotLists, ConfigDocument, DefaultBots, InputConfig, InteractiveBotConfig, PushBotConfig,
    PushConfig, ReconnectConfig, Settings,
};
pub use secret::SecretStore;
pub use store::ConfigStore;
