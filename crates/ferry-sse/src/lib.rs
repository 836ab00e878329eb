// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Server-Sent-Events parsing for the reply-assembly proxy.
//!
//! Two layers:
//!
//! - [`SseFramer`] splits a byte-chunked stream into `{event, data}` records.
//!   It is provider-agnostic and tolerant of `\r\n` / lone-`\r` line endings,
//!   multi-line `data:` fields, and records split across TCP chunks.
//! - [`AnthropicAssembler`] and [`OpenAiAssembler`] fold framed events into
//!   one [`AssembledMessage`] per completed assistant turn. Both reset their
//!   state after every emission, so a message is delivered at most once per
//!   turn and nothing is buffered across `message_stop` / `[DONE]`.
//!
//! The assemblers are two concrete variants behind the same `feed` shape
//! rather than a trait object — the proxy picks one at startup from the
//! wrapped tool's identity and never switches.

pub mod anthropic;
pub mod framer;
pub mod openai;

pub use anthropic::AnthropicAssembler;
pub use framer::{SseEvent, SseFramer};
pub use openai::OpenAiAssembler;

use ferry_proto::AssembledMessage;

/// Provider-selected assembler, chosen once when the proxy starts.
pub enum Assembler {
    Anthropic(AnthropicAssembler),
    Openai(OpenAiAssembler),
}

impl Assembler {
    /// Feed one framed event; returns the assembled turn when complete.
    pub fn feed(&mut self, ev: &SseEvent) -> Option<AssembledMessage> {
        match self {
            Assembler::Anthropic(a) => a.feed(ev),
            Assembler::Openai(a) => a.feed(ev),
        }
    }

    /// Emit whatever text accumulated so far (upstream died mid-stream).
    pub fn finish_partial(&mut self) -> Option<AssembledMessage> {
        match self {
            Assembler::Anthropic(a) => a.finish_partial(),
            Assembler::Openai(a) => a.finish_partial(),
        }
    }

    /// Mark the in-flight turn as a suggestion-mode request.
    pub fn set_suggestion(&mut self, suggestion: bool) {
        match self {
            Assembler::Anthropic(a) => a.set_suggestion(suggestion),
            Assembler::Openai(a) => a.set_suggestion(suggestion),
        }
    }
}
