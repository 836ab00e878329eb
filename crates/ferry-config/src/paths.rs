// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Well-known filesystem locations, all rooted at `~/.ferry/`.

use std::path::PathBuf;

/// The ferry home directory, `~/.ferry`.
///
/// Falls back to the current directory when no home can be resolved (which
/// in practice only happens in stripped-down containers).
pub fn ferry_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ferry")
}

pub fn config_path() -> PathBuf {
    ferry_home().join("config.json")
}

pub fn master_key_path() -> PathBuf {
    ferry_home().join(".master-key")
}

pub fn lock_path() -> PathBuf {
    ferry_home().join("daemon.json")
}

/// IPC endpoint: a socket path on POSIX, a pipe name on Windows.
#[cfg(unix)]
pub fn ipc_endpoint() -> PathBuf {
    ferry_home().join("daemon.sock")
}

#[cfg(windows)]
pub fn ipc_endpoint() -> PathBuf {
    PathBuf::from(r"\\.\pipe\ferry")
}

pub fn images_dir() -> PathBuf {
    ferry_home().join("images")
}

pub fn session_images_dir(session_id: &str) -> PathBuf {
    images_dir().join(session_id)
}
