// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic-style stream assembly.
//!
//! The Messages API streams content as indexed blocks: `content_block_start`
//! opens a block of type `text`, `tool_use` or `thinking`; deltas accumulate
//! into it (`text_delta`, `input_json_delta`, `thinking_delta`);
//! `message_delta` carries the final `stop_reason`; `message_stop` closes
//! the turn. Thinking blocks are parsed so indices stay aligned but are
//! never exported.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use ferry_proto::{AssembledMessage, Provider, ToolUseBlock};

use crate::framer::SseEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse { name: String },
    Thinking,
}

#[derive(Debug)]
struct Block {
    kind: BlockKind,
    content: String,
}

#[derive(Debug, Default)]
pub struct AnthropicAssembler {
    model: String,
    stop_reason: Option<String>,
    blocks: BTreeMap<u64, Block>,
    suggestion: bool,
    started: bool,
}

impl AnthropicAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the in-flight turn as a suggestion-mode request.
    pub fn set_suggestion(&mut self, suggestion: bool) {
        self.suggestion = suggestion;
    }

    /// Feed one framed event; returns the turn on `message_stop`.
    pub fn feed(&mut self, ev: &SseEvent) -> Option<AssembledMessage> {
        let v: Value = serde_json::from_str(&ev.data).ok()?;
        let event_type = v["type"].as_str().unwrap_or("");

        match event_type {
            "message_start" => {
                self.started = true;
                if let Some(model) = v["message"]["model"].as_str() {
                    self.model = model.to_string();
                }
                None
            }
            "content_block_start" => {
                self.started = true;
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                let kind = match block["type"].as_str().unwrap_or("") {
                    "tool_use" => BlockKind::ToolUse {
                        name: block["name"].as_str().unwrap_or("").to_string(),
                    },
                    "thinking" => BlockKind::Thinking,
                    _ => BlockKind::Text,
                };
                // Some tool_use starts carry a complete `input` object
                // instead of streaming it; keep it as the initial content.
                let content = match &kind {
                    BlockKind::ToolUse { .. } => match block.get("input") {
                        Some(input) if !input.is_null() && input != &Value::Object(Default::default()) => {
                            input.to_string()
                        }
                        _ => String::new(),
                    },
                    _ => block["text"].as_str().unwrap_or("").to_string(),
                };
                self.blocks.insert(index, Block { kind, content });
                None
            }
            "content_block_delta" => {
                self.started = true;
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                let (kind, text) = match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => (BlockKind::Text, delta["text"].as_str().unwrap_or("")),
                    "input_json_delta" => (
                        BlockKind::ToolUse {
                            name: String::new(),
                        },
                        delta["partial_json"].as_str().unwrap_or(""),
                    ),
                    "thinking_delta" => {
                        (BlockKind::Thinking, delta["thinking"].as_str().unwrap_or(""))
                    }
                    // signature_delta and future types carry nothing we keep.
                    _ => return None,
                };
                self.blocks
                    .entry(index)
                    .or_insert_with(|| Block {
                        kind,
                        content: String::new(),
                    })
                    .content
                    .push_str(text);
                None
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                None
            }
            "message_stop" => self.emit(),
            // ping, content_block_stop, error — nothing to accumulate.
            _ => None,
        }
    }

    /// Emit whatever text accumulated so far (upstream died mid-stream).
    ///
    /// Returns `None` when no visible text was collected — a turn that died
    /// before producing anything is not worth a chat message.
    pub fn finish_partial(&mut self) -> Option<AssembledMessage> {
        let has_text = self
            .blocks
            .values()
            .any(|b| b.kind == BlockKind::Text && !b.content.is_empty());
        if !has_text {
            self.reset();
            return None;
        }
        self.emit()
    }

    fn emit(&mut self) -> Option<AssembledMessage> {
        if !self.started {
            return None;
        }

        let mut text = String::new();
        let mut tools = Vec::new();
        for block in self.blocks.values() {
            match &block.kind {
                BlockKind::Text => text.push_str(&block.content),
                BlockKind::ToolUse { name } => tools.push(ToolUseBlock {
                    name: name.clone(),
                    input: block.content.clone(),
                }),
                // Chain-of-thought stays internal.
                BlockKind::Thinking => {}
            }
        }

        let msg = AssembledMessage {
            provider: Provider::Anthropic,
            model: std::mem::take(&mut self.model),
            stop_reason: self.stop_reason.take().unwrap_or_default(),
            text_content: text,
            tool_use_blocks: if tools.is_empty() { None } else { Some(tools) },
            is_suggestion: self.suggestion,
            completed_at: Utc::now(),
        };
        self.reset();
        Some(msg)
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
