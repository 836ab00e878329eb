// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Assistant-text extraction from rendered TUI output.
//!
//! AI CLIs draw borders, spinners, shortcut hints and status rows around
//! the actual reply. This filter drops the chrome and keeps the prose. It
//! can lose legitimate text that happens to look like chrome — which is why
//! the router only uses it when neither the API proxy nor a completion hook
//! can supply the reply.

use std::sync::OnceLock;

use regex::Regex;

/// Rows consisting only of box-drawing characters and whitespace.
fn border_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[\s─│┌┐└┘├┤╭╮╰╯═║━┃┏┓┗┛┣┫┠┨╌╍]+$").expect("border regex is valid")
    })
}

/// Spinner rows: a progress glyph followed by an activity phrase.
fn spinner_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*[⠁⠂⠄⡀⢀⠠⠐⠈⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏✢✳✶✻✽∗]+\s").expect("spinner regex is valid")
    })
}

/// Status rows: context meters, token counters, interrupt hints.
fn status_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\d+\s*%\s*context\s+left|esc\s+to\s+interrupt|\?\s+for\s+shortcuts|tokens\s+remaining|auto-accept\s+edits|plan\s+mode\s+on)",
        )
        .expect("status regex is valid")
    })
}

/// Menu rows (selection carets) and empty input-box sides.
fn menu_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(❯|│\s*>?\s*$)").expect("menu regex is valid"))
}

/// Leading reply-bullet glyphs some TUIs prefix assistant output with.
fn bullet_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*[⏺●•◦▪]\s?").expect("bullet regex is valid"))
}

/// Filter rendered terminal text down to assistant prose.
pub fn extract_response(rendered: &str) -> String {
    let mut kept: Vec<String> = Vec::new();

    for line in rendered.lines() {
        if border_re().is_match(line) && !line.trim().is_empty() {
            continue;
        }
        if spinner_re().is_match(line)
            || status_re().is_match(line)
            || menu_re().is_match(line)
        {
            continue;
        }

        let line = bullet_re().replace(line, "");
        // Content inside a bordered panel keeps its interior text.
        let line = line
            .trim_end()
            .trim_end_matches('│')
            .trim_end()
            .to_string();
        let line = line.strip_prefix("│ ").unwrap_or(&line).to_string();

        kept.push(line);
    }

    // Collapse runs of blank lines left behind by removed chrome.
    let mut out: Vec<String> = Vec::new();
    for line in kept {
        if line.trim().is_empty() {
            if matches!(out.last(), Some(prev) if prev.is_empty()) {
                continue;
            }
            out.push(String::new());
        } else {
            out.push(line);
        }
    }
    while matches!(out.first(), Some(l) if l.is_empty()) {
        out.remove(0);
    }
    while matches!(out.last(), Some(l) if l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_only_lines_are_dropped() {
        let input = "╭──────────╮\nThe answer is 42.\n╰──────────╯";
        assert_eq!(extract_response(input), "The answer is 42.");
    }

    #[test]
    fn spinner_lines_are_dropped() {
        let input = "✻ Thinking…\nHere is the plan.";
        assert_eq!(extract_response(input), "Here is the plan.");
    }

    #[test]
    fn status_rows_are_dropped() {
        let input = "Done refactoring.\n42% context left · esc to interrupt";
        assert_eq!(extract_response(input), "Done refactoring.");
    }

    #[test]
    fn menu_caret_rows_are_dropped() {
        let input = "❯ 1. Yes\n❯ 2. No\nPicked the safe option.";
        assert_eq!(extract_response(input), "Picked the safe option.");
    }

    #[test]
    fn leading_bullets_are_stripped_but_text_kept() {
        let input = "⏺ Updated the config file.";
        assert_eq!(extract_response(input), "Updated the config file.");
    }

    #[test]
    fn panel_interior_text_survives() {
        let input = "╭────────────╮\n│ inner text │\n╰────────────╯";
        assert_eq!(extract_response(input), "inner text");
    }

    #[test]
    fn empty_input_box_sides_are_dropped() {
        let input = "reply text\n│ >\n│";
        assert_eq!(extract_response(input), "reply text");
    }

    #[test]
    fn blank_runs_collapse_to_one() {
        let input = "first\n╭──╮\n╰──╯\n\n\nsecond";
        assert_eq!(extract_response(input), "first\n\nsecond");
    }

    #[test]
    fn plain_prose_passes_through() {
        let input = "Line one.\nLine two.";
        assert_eq!(extract_response(input), input);
    }
}
