// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Markdown → Feishu "post" document conversion.
//!
//! A post is `{locale: {title, content: paragraph[]}}` where each paragraph
//! is an ordered list of inline nodes. Two variants share the walk:
//!
//! - **full** — `text` (bold/italic/code styles), `a` links and
//!   `code_block` paragraphs; headings become bold text paragraphs.
//! - **basic** — only `text` and `a`; inline styles are stripped and code
//!   blocks flatten to plain-text paragraphs. Used for webhook targets that
//!   render a reduced node set.
//!
//! Only the restricted dialect the assistant actually emits is interpreted:
//! fenced code, inline code, `**bold**`, `*italic*`, links, headings and
//! list items. Anything else falls through as plain text. Inputs beyond
//! [`MAX_INPUT_BYTES`] keep their tail, with a visible truncation marker.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Cap on converter input; chat posts beyond this keep the tail.
pub const MAX_INPUT_BYTES: usize = 28 * 1024;

const TRUNCATION_MARKER: &str = "...(truncated)\n";

/// Locale key used in the post body. The reference service renders the
/// first locale it finds; one is enough.
const LOCALE: &str = "zh_cn";

// ── Document model ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextStyle {
    Bold,
    Italic,
    Code,
}

/// One inline element of a post paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum PostNode {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        style: Vec<TextStyle>,
    },
    A {
        text: String,
        href: String,
    },
    CodeBlock {
        language: String,
        text: String,
    },
}

pub type Paragraph = Vec<PostNode>;

/// A converted post, ready to wrap into a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDocument {
    pub title: String,
    pub content: Vec<Paragraph>,
}

impl PostDocument {
    /// The `{locale: {title, content}}` body the chat API expects.
    pub fn into_body(self) -> serde_json::Value {
        json!({ LOCALE: { "title": self.title, "content": self.content } })
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Full-variant conversion: styles, links and code blocks survive.
pub fn to_post_full(markdown: &str, title: &str) -> PostDocument {
    convert(markdown, title, Variant::Full)
}

/// Basic-variant conversion: only `text` and `a` nodes are produced.
pub fn to_post_basic(markdown: &str, title: &str) -> PostDocument {
    convert(markdown, title, Variant::Basic)
}

// ── Converter ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq)]
enum Variant {
    Full,
    Basic,
}

struct Converter {
    variant: Variant,
    paragraphs: Vec<Paragraph>,
    current: Paragraph,
    bold_depth: u32,
    italic_depth: u32,
    // Link capture
    link_href: Option<String>,
    link_text: String,
    // Code-block capture
    code_lang: Option<String>,
    code_buf: String,
}

fn convert(markdown: &str, title: &str, variant: Variant) -> PostDocument {
    let input = truncate_head(markdown, MAX_INPUT_BYTES);

    let mut c = Converter {
        variant,
        paragraphs: Vec::new(),
        current: Vec::new(),
        bold_depth: 0,
        italic_depth: 0,
        link_href: None,
        link_text: String::new(),
        code_lang: None,
        code_buf: String::new(),
    };

    let parser = Parser::new_ext(&input, Options::empty());
    for event in parser {
        c.on_event(event);
    }
    c.flush_paragraph();

    PostDocument {
        title: title.to_string(),
        content: c.paragraphs,
    }
}

impl Converter {
    fn on_event(&mut self, event: Event<'_>) {
        // Inside a fenced block everything is literal text.
        if self.code_lang.is_some() {
            match event {
                Event::Text(t) => self.code_buf.push_str(&t),
                Event::End(TagEnd::CodeBlock) => self.end_code_block(),
                _ => {}
            }
            return;
        }

        match event {
            Event::Start(Tag::Paragraph) => self.flush_paragraph(),
            Event::End(TagEnd::Paragraph) => self.flush_paragraph(),

            // Headings and list items each become their own paragraph.
            Event::Start(Tag::Heading { .. }) => {
                self.flush_paragraph();
                if self.variant == Variant::Full {
                    self.bold_depth += 1;
                }
            }
            Event::End(TagEnd::Heading(_)) => {
                if self.variant == Variant::Full {
                    self.bold_depth = self.bold_depth.saturating_sub(1);
                }
                self.flush_paragraph();
            }
            Event::Start(Tag::Item) => self.flush_paragraph(),
            Event::End(TagEnd::Item) => self.flush_paragraph(),

            Event::Start(Tag::Strong) => self.bold_depth += 1,
            Event::End(TagEnd::Strong) => self.bold_depth = self.bold_depth.saturating_sub(1),
            Event::Start(Tag::Emphasis) => self.italic_depth += 1,
            Event::End(TagEnd::Emphasis) => {
                self.italic_depth = self.italic_depth.saturating_sub(1)
            }

            Event::Start(Tag::Link { dest_url, .. }) => {
                self.link_href = Some(dest_url.to_string());
                self.link_text.clear();
            }
            Event::End(TagEnd::Link) => {
                if let Some(href) = self.link_href.take() {
                    let text = std::mem::take(&mut self.link_text);
                    self.current.push(PostNode::A { text, href });
                }
            }

            Event::Start(Tag::CodeBlock(kind)) => {
                let lang = match kind {
                    CodeBlockKind::Fenced(l) => l.to_string(),
                    CodeBlockKind::Indented => String::new(),
                };
                self.code_lang = Some(lang);
                self.code_buf.clear();
            }

            Event::Code(code) => {
                // Inline code.
                if self.variant == Variant::Full {
                    self.push_text_styled(&code, Some(TextStyle::Code));
                } else {
                    self.push_text_styled(&code, None);
                }
            }

            Event::Text(t) => {
                if self.link_href.is_some() {
                    self.link_text.push_str(&t);
                } else {
                    self.push_text_styled(&t, None);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if self.link_href.is_some() {
                    self.link_text.push(' ');
                } else {
                    self.push_text_styled("\n", None);
                }
            }

            // Rules, tables, html, footnotes — outside the dialect; the
            // parser's literal text for them has already been handled above.
            _ => {}
        }
    }

    fn end_code_block(&mut self) {
        let language = self.code_lang.take().unwrap_or_default();
        let text = std::mem::take(&mut self.code_buf);
        let text = text.strip_suffix('\n').unwrap_or(&text).to_string();

        self.flush_paragraph();
        match self.variant {
            Variant::Full => {
                self.paragraphs.push(vec![PostNode::CodeBlock { language, text }]);
            }
            Variant::Basic => {
                self.paragraphs.push(vec![PostNode::Text {
                    text,
                    style: Vec::new(),
                }]);
            }
        }
    }

    fn push_text_styled(&mut self, text: &str, extra: Option<TextStyle>) {
        if text.is_empty() {
            return;
        }
        let style = self.current_style(extra);

        // Merge into the previous run when the style matches — keeps the
        // node list compact and makes paragraph assertions stable.
        if let Some(PostNode::Text {
            text: prev,
            style: prev_style,
        }) = self.current.last_mut()
        {
            if *prev_style == style {
                prev.push_str(text);
                return;
            }
        }
        self.current.push(PostNode::Text {
            text: text.to_string(),
            style,
        });
    }

    fn current_style(&self, extra: Option<TextStyle>) -> Vec<TextStyle> {
        if self.variant == Variant::Basic {
            return Vec::new();
        }
        let mut style = Vec::new();
        if self.bold_depth > 0 {
            style.push(TextStyle::Bold);
        }
        if self.italic_depth > 0 {
            style.push(TextStyle::Italic);
        }
        if let Some(s) = extra {
            if !style.contains(&s) {
                style.push(s);
            }
        }
        style
    }

    fn flush_paragraph(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let para = std::mem::take(&mut self.current);
        // A paragraph of pure whitespace renders as a stray empty line.
        let all_blank = para.iter().all(|n| match n {
            PostNode::Text { text, .. } => text.trim().is_empty(),
            _ => false,
        });
        if !all_blank {
            self.paragraphs.push(para);
        }
    }
}

/// Keep the tail of `input` within `max_bytes`, marking the cut.
fn truncate_head(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut start = input.len() - max_bytes + TRUNCATION_MARKER.len();
    while start < input.len() && !input.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATION_MARKER}{}", &input[start..])
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(paragraph: &Paragraph) -> String {
        paragraph
            .iter()
            .map(|n| match n {
                PostNode::Text { text, .. } => text.clone(),
                PostNode::A { text, .. } => text.clone(),
                PostNode::CodeBlock { text, .. } => text.clone(),
            })
            .collect()
    }

    #[test]
    fn plain_text_yields_one_paragraph_per_line_group() {
        let doc = to_post_full("first group\nsame group\n\nsecond group", "t");
        assert_eq!(doc.content.len(), 2);
        assert_eq!(text_of(&doc.content[0]), "first group\nsame group");
        assert_eq!(text_of(&doc.content[1]), "second group");
    }

    #[test]
    fn bold_italic_and_inline_code_carry_styles() {
        let doc = to_post_full("**bold** and *italic* and `code`", "t");
        let para = &doc.content[0];
        assert!(matches!(
            &para[0],
            PostNode::Text { text, style } if text == "bold" && style == &vec![TextStyle::Bold]
        ));
        assert!(matches!(
            &para[2],
            PostNode::Text { text, style } if text == "italic" && style == &vec![TextStyle::Italic]
        ));
        assert!(matches!(
            &para[4],
            PostNode::Text { text, style } if text == "code" && style == &vec![TextStyle::Code]
        ));
    }

    #[test]
    fn links_become_a_nodes() {
        let doc = to_post_full("see [the docs](https://example.com/d)", "t");
        let para = &doc.content[0];
        assert!(matches!(
            &para[1],
            PostNode::A { text, href }
                if text == "the docs" && href == "https://example.com/d"
        ));
    }

    #[test]
    fn fenced_code_block_is_its_own_paragraph() {
        let doc = to_post_full("before\n\n```rust\nfn main() {}\n```\n\nafter", "t");
        assert_eq!(doc.content.len(), 3);
        assert!(matches!(
            &doc.content[1][0],
            PostNode::CodeBlock { language, text }
                if language == "rust" && text == "fn main() {}"
        ));
    }

    #[test]
    fn heading_becomes_bold_paragraph() {
        let doc = to_post_full("# Title line\n\nbody", "t");
        assert!(matches!(
            &doc.content[0][0],
            PostNode::Text { text, style }
                if text == "Title line" && style.contains(&TextStyle::Bold)
        ));
        assert_eq!(text_of(&doc.content[1]), "body");
    }

    #[test]
    fn list_items_become_separate_paragraphs() {
        let doc = to_post_full("- one\n- two\n- three", "t");
        assert_eq!(doc.content.len(), 3);
        assert_eq!(text_of(&doc.content[1]), "two");
    }

    #[test]
    fn basic_variant_strips_styles_and_flattens_code() {
        let doc = to_post_basic("**bold** text\n\n```sh\nls -la\n```", "t");
        for para in &doc.content {
            for node in para {
                match node {
                    PostNode::Text { style, .. } => assert!(style.is_empty()),
                    PostNode::A { .. } => {}
                    PostNode::CodeBlock { .. } => panic!("basic variant must not emit code_block"),
                }
            }
        }
        assert_eq!(text_of(&doc.content[1]), "ls -la");
    }

    #[test]
    fn basic_variant_keeps_links() {
        let doc = to_post_basic("[home](https://example.com)", "t");
        assert!(matches!(&doc.content[0][0], PostNode::A { .. }));
    }

    #[test]
    fn long_input_is_truncated_from_the_head() {
        let long = "x".repeat(MAX_INPUT_BYTES + 1000);
        let doc = to_post_full(&long, "t");
        let flat = text_of(&doc.content[0]);
        assert!(flat.starts_with("...(truncated)"));
        assert!(flat.len() <= MAX_INPUT_BYTES);
    }

    #[test]
    fn wire_shape_uses_tag_discriminators() {
        let doc = to_post_full("hi **there**", "greeting");
        let body = doc.into_body();
        let para = &body["zh_cn"]["content"][0];
        assert_eq!(para[0]["tag"], "text");
        assert_eq!(para[1]["tag"], "text");
        assert_eq!(para[1]["style"][0], "bold");
        assert_eq!(body["zh_cn"]["title"], "greeting");
    }

    #[test]
    fn empty_input_produces_empty_content() {
        let doc = to_post_full("", "t");
        assert!(doc.content.is_empty());
    }
}
