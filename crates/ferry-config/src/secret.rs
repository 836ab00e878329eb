// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Secret store — at-rest encryption for bot credentials.
//!
//! # Security model
//!
//! A random 256-bit master key is generated on first use and stored
//! hex-encoded at `~/.ferry/.master-key` with owner-only permissions
//! (mode 0o600 on Unix). Secrets are encrypted with AES-256-GCM:
//!
//! ```text
//! "enc:" || base64( nonce(12) ‖ tag(16) ‖ ciphertext )
//! ```
//!
//! The `enc:` prefix makes encrypted values self-describing, so
//! [`SecretStore::encrypt`] is idempotent and a hand-edited plaintext value
//! in `config.json` is picked up and re-encrypted on the next save.
//!
//! Losing or corrupting the key file makes every stored secret unreadable;
//! an unreadable key file is therefore a fatal startup error rather than
//! something to silently regenerate.

use std::path::{Path, PathBuf};

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use anyhow::{bail, Context};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

const ENC_PREFIX: &str = "enc:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Holds the master key; encrypts and decrypts opaque secret strings.
pub struct SecretStore {
    key: [u8; 32],
    path: PathBuf,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SecretStore {
    /// Load the master key from `path`, generating it on first use.
    ///
    /// Failure to read or create the key file is fatal to the caller: the
    /// daemon cannot operate without its secrets.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading master key {}", path.display()))?;
            let bytes = hex::decode(text.trim())
                .with_context(|| format!("decoding master key {}", path.display()))?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("master key {} is not 32 bytes", path.display()))?;
            return Ok(Self {
                key,
                path: path.to_path_buf(),
            });
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating key directory {}", parent.display()))?;
        }
        write_secret_file(path, hex::encode(key).as_bytes())?;
        tracing::info!(path = %path.display(), "generated new master key");

        Ok(Self {
            key,
            path: path.to_path_buf(),
        })
    }

    /// True when `value` already carries the `enc:` prefix.
    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    /// Encrypt a plaintext secret. Idempotent on already-encrypted values.
    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
        if Self::is_encrypted(plaintext) {
            return Ok(plaintext.to_string());
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| anyhow::anyhow!("invalid key length"))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        // aes-gcm appends the 16-byte tag to the ciphertext; reorder to
        // nonce ‖ tag ‖ ciphertext, the layout the controller also reads.
        let sealed = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &[],
                },
            )
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut packed = Vec::with_capacity(NONCE_LEN + TAG_LEN + body.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(tag);
        packed.extend_from_slice(body);

        Ok(format!(
            "{ENC_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(packed)
        ))
    }

    /// Decrypt an `enc:`-prefixed value. Plaintext passes through unchanged.
    pub fn decrypt(&self, value: &str) -> anyhow::Result<String> {
        let Some(b64) = value.strip_prefix(ENC_PREFIX) else {
            return Ok(value.to_string());
        };

        let packed = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .context("decoding encrypted value")?;
        if packed.len() < NONCE_LEN + TAG_LEN {
            bail!("encrypted value too short");
        }

        let (nonce_bytes, rest) = packed.split_at(NONCE_LEN);
        let (tag, body) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| anyhow::anyhow!("invalid key length"))?;
        let plain = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| {
                anyhow::anyhow!(
                    "decryption failed — wrong master key at {}?",
                    self.path.display()
                )
            })?;

        String::from_utf8(plain).context("decrypted value is not UTF-8")
    }
}

/// Write `data` to `path` with mode 0o600 on Unix (owner-read/write only).
fn write_secret_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("writing secret file {}", path.display()))?;
        f.write_all(data)?;
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, data)
            .with_context(|| format!("writing secret file {}", path.display()))?;
    }
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
