// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Terminal rendering: turn a raw PTY byte stream into the clean text a
//! user would see on screen.
//!
//! Three tools, increasingly lossy:
//!
//! - [`render`] drives a headless terminal emulator so cursor movement,
//!   carriage-return overwrites and screen clears resolve exactly as a real
//!   terminal would resolve them.
//! - [`strip_escapes`] is the cheap path for non-TUI output: delete escape
//!   sequences and control bytes, keep the text.
//! - [`extract_response`] filters rendered TUI output down to assistant
//!   prose by dropping chrome lines (borders, spinners, status rows). It is
//!   deliberately lossy and used only as the last-resort reply source.

pub mod extract;
pub mod render;
pub mod strip;

pub use extract::extract_response;
pub use render::{render, RenderOptions};
pub use strip::strip_escapes;
