// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cheap escape-sequence stripping for non-TUI output.

use std::sync::OnceLock;

use regex::Regex;

/// Known escape sequences: CSI, OSC (BEL- or ST-terminated), character-set
/// switches, and single-byte escapes.
fn escape_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?x)
            \x1b\[[0-9;?]*[\x20-\x2f]*[@-~]        # CSI ... final byte
          | \x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?     # OSC ... BEL or ST
          | \x1b[()][0-9A-Za-z]                    # charset designation
          | \x1b[@-_]                              # other C1 escapes
            ",
        )
        .expect("escape regex is valid")
    })
}

/// Remove escape sequences and control bytes, keeping `\n` and `\t`.
///
/// Lone carriage returns are dropped rather than interpreted — overwrite
/// semantics need the full emulator in [`crate::render`].
pub fn strip_escapes(input: &str) -> String {
    let without_escapes = escape_re().replace_all(input, "");
    without_escapes
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || (c != '\u{7f}' && !c.is_control()))
        .collect()
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sgr_sequences_are_removed() {
        assert_eq!(strip_escapes("\x1b[1;32mgreen\x1b[0m text"), "green text");
    }

    #[test]
    fn osc_title_sequences_are_removed() {
        assert_eq!(strip_escapes("\x1b]0;window title\x07visible"), "visible");
        assert_eq!(strip_escapes("\x1b]8;;http://x\x1b\\link\x1b]8;;\x1b\\"), "link");
    }

    #[test]
    fn charset_switches_are_removed() {
        assert_eq!(strip_escapes("\x1b(Bascii\x1b(0"), "ascii");
    }

    #[test]
    fn newlines_and_tabs_survive() {
        assert_eq!(strip_escapes("a\tb\nc"), "a\tb\nc");
    }

    #[test]
    fn carriage_returns_and_other_controls_are_dropped() {
        assert_eq!(strip_escapes("a\rb\x08c\x00d"), "abcd");
    }

    #[test]
    fn cursor_movement_csi_is_removed() {
        assert_eq!(strip_escapes("\x1b[2J\x1b[1;1Hfresh"), "fresh");
    }

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(strip_escapes("nothing special"), "nothing special");
    }
}
