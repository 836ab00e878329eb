// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Generic SSE framer.
//!
//! SSE records can be split across TCP chunks at any byte, so the framer
//! carries a remainder buffer forward and only parses complete records
//! (terminated by a blank line). Line endings are normalized first: `\r\n`
//! and lone `\r` both become `\n`. A chunk ending in `\r` is held back one
//! byte in case the matching `\n` arrives in the next chunk.

/// One framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Joined `data:` lines (`\n` between parts). The `[DONE]` sentinel is
    /// preserved verbatim.
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseFramer {
    /// Normalized, not-yet-complete record text.
    buf: String,
    /// True when the last consumed byte was `\r`; a `\n` that follows (even
    /// at the start of the next chunk) belongs to the same line ending.
    last_was_cr: bool,
}

impl SseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of stream text; returns every record completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.normalize_into_buf(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buf.find("\n\n") {
            let block: String = self.buf[..pos].to_string();
            self.buf.drain(..pos + 2);
            if let Some(ev) = parse_block(&block) {
                events.push(ev);
            }
        }
        events
    }

    fn normalize_into_buf(&mut self, chunk: &str) {
        for c in chunk.chars() {
            if self.last_was_cr {
                self.last_was_cr = false;
                if c == '\n' {
                    continue;
                }
            }
            if c == '\r' {
                // Converted eagerly so a record terminated by \r\r (or by a
                // \r\n\r\n pair split anywhere) completes without waiting
                // for the next chunk.
                self.buf.push('\n');
                self.last_was_cr = true;
            } else {
                self.buf.push(c);
            }
        }
    }
}

/// Parse one record block (lines already `\n`-separated, no blank line).
///
/// Returns `None` for comment-only or field-free blocks.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(strip_leading_space(rest).to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(strip_leading_space(rest));
        }
        // Other fields (id:, retry:) are irrelevant here and skipped.
    }

    if data_lines.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}

/// The SSE spec strips exactly one space after the colon.
fn strip_leading_space(s: &str) -> &str {
    s.strip_prefix(' ').unwrap_or(s)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_record_with_event_and_data() {
        let mut f = SseFramer::new();
        let evs = f.feed("event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].event.as_deref(), Some("message_start"));
        assert_eq!(evs[0].data, "{\"a\":1}");
    }

    #[test]
    fn data_without_space_after_colon() {
        let mut f = SseFramer::new();
        let evs = f.feed("data:{\"x\":2}\n\n");
        assert_eq!(evs[0].data, "{\"x\":2}");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut f = SseFramer::new();
        let evs = f.feed("data: first\ndata: second\n\n");
        assert_eq!(evs[0].data, "first\nsecond");
    }

    #[test]
    fn record_split_across_chunks() {
        let mut f = SseFramer::new();
        assert!(f.feed("data: {\"par").is_empty());
        assert!(f.feed("tial\":true}").is_empty());
        let evs = f.feed("\n\n");
        assert_eq!(evs[0].data, "{\"partial\":true}");
    }

    #[test]
    fn crlf_stream_is_equivalent_to_lf_stream() {
        let lf = "event: ping\ndata: {}\n\ndata: [DONE]\n\n";
        let crlf = lf.replace('\n', "\r\n");

        let mut f1 = SseFramer::new();
        let mut f2 = SseFramer::new();
        assert_eq!(f1.feed(lf), f2.feed(&crlf));
    }

    #[test]
    fn bare_cr_line_endings_are_normalized() {
        let mut f = SseFramer::new();
        let evs = f.feed("data: one\r\rdata: two\r\r");
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].data, "one");
        assert_eq!(evs[1].data, "two");
    }

    #[test]
    fn cr_split_across_chunk_boundary() {
        let mut f = SseFramer::new();
        // \r\n\r\n split right after the first \r.
        assert!(f.feed("data: x\r").is_empty());
        let evs = f.feed("\n\r\n");
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].data, "x");
    }

    #[test]
    fn done_sentinel_preserved_verbatim() {
        let mut f = SseFramer::new();
        let evs = f.feed("data: [DONE]\n\n");
        assert_eq!(evs[0].data, "[DONE]");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut f = SseFramer::new();
        let evs = f.feed(": keep-alive\n\ndata: real\n\n");
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].data, "real");
    }
}
