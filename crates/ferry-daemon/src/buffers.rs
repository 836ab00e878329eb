// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Per-session output buffers.
//!
//! Three buffers with distinct flush semantics:
//!
//! - **Interactive** — armed when a user chat message goes to the PTY.
//!   Every appended chunk resets a silence timer; one reply is emitted when
//!   the terminal goes quiet. Arming while a collection is in flight does
//!   not restart it.
//! - **Push** — appended on every PTY chunk; a merge-window timer starts on
//!   the first chunk and fires exactly once. Rate-limit feedback doubles
//!   the window, capped at 30 s.
//! - **Summary** — rolling UTF-8 tail kept for the end-of-session card,
//!   fed regardless of bindings.
//!
//! Timers live outside this module: state transitions hand back a
//! generation number, the router spawns a sleep task carrying it, and a
//! fire with a stale generation is ignored. That keeps every timer callback
//! free of buffer locks.

use std::time::Duration;

/// Quiet period that finalizes an interactive reply.
pub const INTERACTIVE_SILENCE: Duration = Duration::from_secs(5);

/// Ceiling for the push merge window after rate-limit widening.
pub const MAX_MERGE_WINDOW: Duration = Duration::from_secs(30);

/// Rolling summary tail size.
pub const SUMMARY_TAIL_BYTES: usize = 8 * 1024;

const TRUNCATION_MARKER: &str = "...(truncated)\n";

// ── Interactive buffer ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InteractiveBuffer {
    collecting: bool,
    text: String,
    generation: u64,
}

impl InteractiveBuffer {
    /// Arm the buffer for a new reply collection.
    ///
    /// No timer starts yet — the silence window is measured from output,
    /// so a model that thinks for a while before its first byte does not
    /// lose the collection. Returns `false` when a collection is already
    /// in flight (never restarted).
    pub fn start_collecting(&mut self) -> bool {
        if self.collecting {
            return false;
        }
        self.collecting = true;
        self.text.clear();
        true
    }

    /// Append a PTY chunk. While collecting, the silence timer re-arms:
    /// the returned generation invalidates all previously scheduled fires.
    pub fn append(&mut self, chunk: &str) -> Option<u64> {
        if !self.collecting {
            return None;
        }
        self.text.push_str(chunk);
        self.generation += 1;
        Some(self.generation)
    }

    /// A silence timer fired. Emits only for the latest generation.
    pub fn flush(&mut self, generation: u64) -> Option<String> {
        if !self.collecting || generation != self.generation {
            return None;
        }
        self.collecting = false;
        let text = std::mem::take(&mut self.text);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Session is ending: emit whatever is pending.
    pub fn force_flush(&mut self) -> Option<String> {
        if !self.collecting {
            return None;
        }
        self.collecting = false;
        let text = std::mem::take(&mut self.text);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    pub fn is_collecting(&self) -> bool {
        self.collecting
    }
}

// ── Push buffer ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PushBuffer {
    text: String,
    window: Duration,
    armed: bool,
    generation: u64,
}

impl PushBuffer {
    pub fn new(merge_window: Duration) -> Self {
        Self {
            text: String::new(),
            window: merge_window,
            armed: false,
            generation: 0,
        }
    }

    /// Append a PTY chunk. The first chunk of a window arms the timer:
    /// returns `(generation, window)` to schedule. Later chunks ride the
    /// already-armed window.
    pub fn append(&mut self, chunk: &str) -> Option<(u64, Duration)> {
        self.text.push_str(chunk);
        if self.armed {
            return None;
        }
        self.armed = true;
        self.generation += 1;
        Some((self.generation, self.window))
    }

    /// The merge-window timer fired.
    pub fn flush(&mut self, generation: u64) -> Option<String> {
        if !self.armed || generation != self.generation {
            return None;
        }
        self.armed = false;
        let text = std::mem::take(&mut self.text);
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    /// Rate-limit feedback: double the window, capped at 30 s. Applies to
    /// subsequent windows; the in-flight one keeps its schedule.
    pub fn widen(&mut self) {
        self.window = (self.window * 2).min(MAX_MERGE_WINDOW);
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

// ── Summary buffer ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SummaryBuffer {
    text: String,
}

impl SummaryBuffer {
    pub fn append(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > SUMMARY_TAIL_BYTES {
            self.text = tail_on_char_boundary(&self.text, SUMMARY_TAIL_BYTES);
        }
    }

    pub fn tail(&self) -> &str {
        &self.text
    }
}

// ── Shared trimming helpers ───────────────────────────────────────────────────

/// Keep at most `max_bytes` of the tail, on a char boundary, with a leading
/// replacement character (from a bisected multi-byte sequence in lossily
/// decoded PTY data) stripped.
fn tail_on_char_boundary(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    let tail = &text[start..];
    tail.strip_prefix('\u{FFFD}').unwrap_or(tail).to_string()
}

/// Tail-truncate an outgoing message to `max_bytes` of UTF-8.
///
/// Oversized output keeps its suffix (the end of a long answer matters more
/// than its start), gains a visible marker, and never begins with a
/// replacement character left over from a broken code unit.
pub fn truncate_for_send(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let budget = max_bytes.saturating_sub(TRUNCATION_MARKER.len()).max(1);
    let tail = tail_on_char_boundary(text, budget);
    format!("{TRUNCATION_MARKER}{tail}")
}

// ── Unit tests ────────────────────────────────────────────────────────────────
