// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! OpenAI-style (chat completions) stream assembly.
//!
//! Deltas arrive as `choices[0].delta`; tool calls merge by their `index`
//! field (the first occurrence names the call, later ones append to its
//! argument string); `choices[0].finish_reason` carries the stop reason and
//! the `[DONE]` sentinel closes the turn.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value;

use ferry_proto::{AssembledMessage, Provider, ToolUseBlock};

use crate::framer::SseEvent;

#[derive(Debug, Default)]
struct ToolCallAcc {
    name: String,
    arguments: String,
}

#[derive(Debug, Default)]
pub struct OpenAiAssembler {
    model: String,
    text: String,
    tool_calls: BTreeMap<u64, ToolCallAcc>,
    finish_reason: Option<String>,
    suggestion: bool,
    started: bool,
}

impl OpenAiAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the in-flight turn as a suggestion-mode request.
    pub fn set_suggestion(&mut self, suggestion: bool) {
        self.suggestion = suggestion;
    }

    /// Feed one framed event; returns the turn on the `[DONE]` sentinel.
    pub fn feed(&mut self, ev: &SseEvent) -> Option<AssembledMessage> {
        if ev.data.trim() == "[DONE]" {
            return self.emit();
        }

        let v: Value = serde_json::from_str(&ev.data).ok()?;
        self.started = true;

        // Model name comes from whichever chunk first carries it.
        if self.model.is_empty() {
            if let Some(model) = v["model"].as_str() {
                if !model.is_empty() {
                    self.model = model.to_string();
                }
            }
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            self.text.push_str(text);
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for (pos, tc) in tool_calls.iter().enumerate() {
                let index = tc["index"].as_u64().unwrap_or(pos as u64);
                let acc = self.tool_calls.entry(index).or_default();
                if acc.name.is_empty() {
                    if let Some(name) = tc["function"]["name"].as_str() {
                        acc.name = name.to_string();
                    }
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    acc.arguments.push_str(args);
                }
            }
        }

        None
    }

    /// Emit whatever text accumulated so far (upstream died mid-stream).
    pub fn finish_partial(&mut self) -> Option<AssembledMessage> {
        if self.text.is_empty() {
            self.reset();
            return None;
        }
        self.emit()
    }

    fn emit(&mut self) -> Option<AssembledMessage> {
        if !self.started {
            return None;
        }

        let tools: Vec<ToolUseBlock> = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|acc| ToolUseBlock {
                name: acc.name,
                input: acc.arguments,
            })
            .collect();

        let msg = AssembledMessage {
            provider: Provider::Openai,
            model: std::mem::take(&mut self.model),
            stop_reason: self.finish_reason.take().unwrap_or_default(),
            text_content: std::mem::take(&mut self.text),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::SseFramer;

    fn ev(json: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: json.to_string(),
        }
    }

    #[test]
    fn text_turn_assembles_on_done() {
        let mut a = OpenAiAssembler::new();
        a.feed(&ev(
            r#"{"model":"gpt-4o","choices":[{"delta":{"content":"Hel"}}]}"#,
        ));
        a.feed(&ev(r#"{"choices":[{"delta":{"content":"lo"}}]}"#));
        a.feed(&ev(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#));

        let msg = a.feed(&ev("[DONE]")).unwrap();
        assert_eq!(msg.provider, Provider::Openai);
        assert_eq!(msg.model, "gpt-4o");
        assert_eq!(msg.stop_reason, "stop");
        assert_eq!(msg.text_content, "Hello");
    }

    /// The canonical tool-call merge: first chunk names the call, later
    /// chunks append to its arguments.
    #[test]
    fn tool_call_merges_by_index() {
        let mut a = OpenAiAssembler::new();
        a.feed(&ev(
            r#"{"model":"gpt-4o","choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"get_weather","arguments":""}}]}}]}"#,
        ));
        a.feed(&ev(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"city\":\"Tokyo\"}"}}]}}]}"#,
        ));
        a.feed(&ev(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#));

        let msg = a.feed(&ev("[DONE]")).unwrap();
        assert_eq!(msg.stop_reason, "tool_calls");
        assert_eq!(msg.text_content, "");
        let tools = msg.tool_use_blocks.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_weather");
        assert_eq!(tools[0].input, r#"{"city":"Tokyo"}"#);
    }

    #[test]
    fn parallel_tool_calls_keep_separate_accumulators() {
        let mut a = OpenAiAssembler::new();
        a.feed(&ev(
            r#"{"model":"m","choices":[{"delta":{"tool_calls":[
                {"index":0,"function":{"name":"read_file","arguments":"{\"a\""}},
                {"index":1,"function":{"name":"grep","arguments":"{\"b\""}}
            ]}}]}"#,
        ));
        a.feed(&ev(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":":2}"}}]}}]}"#,
        ));
        a.feed(&ev(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
        ));

        let msg = a.feed(&ev("[DONE]")).unwrap();
        let tools = msg.tool_use_blocks.unwrap();
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[0].input, r#"{"a":1}"#);
        assert_eq!(tools[1].name, "grep");
        assert_eq!(tools[1].input, r#"{"b":2}"#);
    }

    /// Regression: a CRLF-framed stream must still trigger assembly on
    /// `[DONE]` — the framer normalizes endings, the assembler must accept
    /// the sentinel exactly as framed.
    #[test]
    fn done_sentinel_with_crlf_endings_triggers_assembly() {
        let stream = "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\r\n\r\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let mut framer = SseFramer::new();
        let mut a = OpenAiAssembler::new();

        let mut out = None;
        for ev in framer.feed(stream) {
            if let Some(msg) = a.feed(&ev) {
                out = Some(msg);
            }
        }
        let msg = out.expect("[DONE] with CRLF endings must assemble");
        assert_eq!(msg.text_content, "hi");
        assert_eq!(msg.stop_reason, "stop");
    }

    #[test]
    fn stray_done_without_prior_chunks_emits_nothing() {
        let mut a = OpenAiAssembler::new();
        assert!(a.feed(&ev("[DONE]")).is_none());
    }

    #[test]
    fn state_resets_after_emission() {
        let mut a = OpenAiAssembler::new();
        a.feed(&ev(r#"{"model":"m1","choices":[{"delta":{"content":"one"}}]}"#));
        assert!(a.feed(&ev("[DONE]")).is_some());

        a.feed(&ev(r#"{"model":"m2","choices":[{"delta":{"content":"two"}}]}"#));
        let msg = a.feed(&ev("[DONE]")).unwrap();
        assert_eq!(msg.model, "m2");
        assert_eq!(msg.text_content, "two");
    }

    #[test]
    fn partial_finish_emits_accumulated_text() {
        let mut a = OpenAiAssembler::new();
        a.feed(&ev(r#"{"model":"m","choices":[{"delta":{"content":"cut off mid"}}]}"#));
        let msg = a.finish_partial().unwrap();
        assert_eq!(msg.text_content, "cut off mid");
    }
}
