// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand, ValueEnum};

/// Bridge terminal AI CLI sessions to Feishu/Lark chat.
#[derive(Parser, Debug)]
#[command(name = "ferry", version, about)]
pub struct Cli {
    /// Log to stderr (FERRY_LOG overrides the filter).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the ferry daemon in the foreground.
    ///
    /// Owns the chat connections, the session registry and the IPC
    /// endpoint under ~/.ferry. Exactly one daemon runs per user; a second
    /// start fails with "address in use".
    Daemon,

    /// Show daemon status: sessions, bindings and connection warnings.
    Status,

    /// Stop the running daemon gracefully.
    Stop,

    /// Run the reply-assembly proxy standalone and print the environment
    /// the wrapped tool needs.
    ///
    /// CLI hosts normally embed the proxy as a library; this command
    /// exists for wiring a tool up by hand:
    ///
    ///   eval "$(ferry proxy --tool claude --session dev1 --export)" && claude
    Proxy {
        /// Command name of the wrapped tool (claude, codex, ...).
        #[arg(long)]
        tool: String,
        /// Session id to attribute assembled replies to.
        #[arg(long)]
        session: String,
        /// Print shell `export` lines instead of KEY=VALUE pairs.
        #[arg(long)]
        export: bool,
    },

    /// Relay an AI tool's completion hook to the daemon.
    ///
    /// Installed into the tools' own config by the desktop controller
    /// (setup_codex_config / setup_claude_config); not meant to be typed
    /// by hand. Reads the hook payload from stdin or the trailing
    /// argument.
    Notify {
        /// Which tool fired the hook.
        #[arg(value_enum)]
        tool: NotifyTool,
        /// Hook payload (codex passes it as the final argument).
        payload: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum NotifyTool {
    Codex,
    Claude,
}
