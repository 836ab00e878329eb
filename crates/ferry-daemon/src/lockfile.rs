// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Daemon lock file and stale-endpoint cleanup.
//!
//! `~/.ferry/daemon.json` records `{pid, ipc, started_at}` so other
//! processes can discover the endpoint and tell a live daemon from debris
//! left by a crash. The lock is advisory: the real single-instance guard is
//! the endpoint bind itself (address-in-use). This module only decides
//! whether leftovers may be swept before binding.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use ferry_proto::LockFile;

/// Inspect a prior lock; remove it (plus the leftover socket file) when the
/// recorded process is gone. Errors out when a live daemon holds it.
pub fn check_and_clean(lock_path: &Path, endpoint: &Path) -> anyhow::Result<()> {
    let text = match std::fs::read_to_string(lock_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            remove_stale_endpoint(endpoint);
            return Ok(());
        }
        Err(e) => return Err(e).context("reading lock file"),
    };

    match serde_json::from_str::<LockFile>(&text) {
        Ok(lock) if process_is_alive(lock.pid) => {
            anyhow::bail!(
                "another ferry daemon is running (pid {}, since {})",
                lock.pid,
                lock.started_at
            );
        }
        Ok(lock) => {
            info!(pid = lock.pid, "removing stale lock file");
        }
        Err(e) => {
            warn!("lock file is corrupt ({e}); removing");
        }
    }

    std::fs::remove_file(lock_path).context("removing stale lock file")?;
    remove_stale_endpoint(endpoint);
    Ok(())
}

/// Write the lock for the current process.
pub fn write(lock_path: &Path, endpoint: &Path) -> anyhow::Result<()> {
    let lock = LockFile {
        pid: std::process::id(),
        ipc: endpoint.display().to_string(),
        started_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&lock).context("serializing lock file")?;
    std::fs::write(lock_path, json).context("writing lock file")
}

/// Delete the lock on clean shutdown. Best-effort.
pub fn remove(lock_path: &Path) {
    if let Err(e) = std::fs::remove_file(lock_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove lock file: {e}");
        }
    }
}

fn remove_stale_endpoint(endpoint: &Path) {
    #[cfg(unix)]
    if endpoint.exists() {
        if let Err(e) = std::fs::remove_file(endpoint) {
            warn!("could not remove stale socket file: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = endpoint; // named pipes vanish with their server
}

#[cfg(unix)]
fn process_is_alive(pid: u32) -> bool {
    // Signal 0 performs the permission/existence check without delivering
    // anything. EPERM still means the pid exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_is_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, rely on the endpoint bind failing
    // (address-in-use) when a daemon really is running.
    false
}

// ── Unit tests ────────────────────────────────────────────────────────────────
