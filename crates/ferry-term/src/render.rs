// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Headless terminal emulation over a fixed grid.

use alacritty_terminal::event::{Event, EventListener};
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::cell::Flags;
use alacritty_terminal::term::test::TermSize;
use alacritty_terminal::term::{Config, Term};
use alacritty_terminal::vte::ansi::Processor;

/// Grid geometry for the emulator.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub columns: usize,
    pub lines: usize,
    pub scrollback: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            columns: 120,
            lines: 50,
            scrollback: 200,
        }
    }
}

/// Terminal events carry nothing we need — rendering is one-shot.
struct VoidListener;

impl EventListener for VoidListener {
    fn send_event(&self, _event: Event) {}
}

/// Feed `bytes` through a terminal emulator and read back the visible text.
///
/// After all input is processed, every grid row (scrollback included) is
/// read top to bottom with trailing spaces trimmed; leading and trailing
/// empty rows are dropped and the rest joined with `\n`.
pub fn render(bytes: &[u8], options: RenderOptions) -> String {
    let size = TermSize::new(options.columns, options.lines);
    let config = Config {
        scrolling_history: options.scrollback,
        ..Config::default()
    };
    let mut term = Term::new(config, &size, VoidListener);
    let mut parser: Processor = Processor::new();
    for &byte in bytes {
        parser.advance(&mut term, byte);
    }

    let grid = term.grid();
    let mut rows: Vec<String> = Vec::new();
    for line in grid.topmost_line().0..=grid.bottommost_line().0 {
        let row = &grid[Line(line)];
        let mut text = String::with_capacity(grid.columns());
        for col in 0..grid.columns() {
            let cell = &row[Column(col)];
            if cell
                .flags
                .intersects(Flags::WIDE_CHAR_SPACER | Flags::LEADING_WIDE_CHAR_SPACER)
            {
                continue;
            }
            text.push(cell.c);
        }
        rows.push(text.trim_end().to_string());
    }

    // Drop leading and trailing blank rows (the grid is mostly empty).
    let first = rows.iter().position(|r| !r.is_empty());
    let last = rows.iter().rposition(|r| !r.is_empty());
    match (first, last) {
        (Some(first), Some(last)) => rows[first..=last].join("\n"),
        _ => String::new(),
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn render_default(bytes: &[u8]) -> String {
        render(bytes, RenderOptions::default())
    }

    #[test]
    fn plain_lines_come_back_verbatim() {
        assert_eq!(render_default(b"hello\r\nworld\r\n"), "hello\nworld");
    }

    #[test]
    fn carriage_return_overwrites_the_line() {
        // Progress-style output: only the final state is visible.
        assert_eq!(
            render_default(b"progress 10%\rprogress 99%"),
            "progress 99%"
        );
    }

    #[test]
    fn sgr_color_sequences_do_not_leak_into_text() {
        assert_eq!(render_default(b"\x1b[31mred\x1b[0m plain"), "red plain");
    }

    #[test]
    fn cursor_movement_is_resolved() {
        // Write "ab", move cursor to column 1, overwrite 'b' with 'c'.
        assert_eq!(render_default(b"ab\x1b[1;2Hc"), "ac");
    }

    #[test]
    fn erase_line_removes_text() {
        // Write, return to start of line, erase to end.
        assert_eq!(render_default(b"doomed\r\x1b[Kkept"), "kept");
    }

    #[test]
    fn blank_edges_are_trimmed() {
        assert_eq!(render_default(b"\r\n\r\nbody\r\n\r\n"), "body");
    }

    #[test]
    fn empty_input_renders_empty() {
        assert_eq!(render_default(b""), "");
    }

    #[test]
    fn output_beyond_screen_height_survives_in_scrollback() {
        let mut input = Vec::new();
        for i in 0..60 {
            input.extend_from_slice(format!("line {i}\r\n").as_bytes());
        }
        let out = render(input.as_slice(), RenderOptions::default());
        assert!(out.starts_with("line 0"), "first line must be kept: {out}");
        assert!(out.contains("line 59"));
    }
}
