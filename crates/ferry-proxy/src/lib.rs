// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The reply-assembly proxy.
//!
//! Runs *inside the CLI host process*, between the wrapped AI tool and its
//! upstream API: a loopback HTTP server that forwards every request
//! verbatim and tees `text/event-stream` response bodies into the
//! provider's SSE assembler. Each completed assistant turn becomes one
//! `api_proxy_event` on the daemon's IPC endpoint.
//!
//! ```text
//! AI tool ──http──► proxy ──https──► upstream API
//!                     │ tee (SSE only)
//!                     ▼
//!                  assembler ──► AssembledMessage ──► daemon (IPC)
//! ```
//!
//! The daemon deliberately does not host this: living in the CLI host
//! keeps the tool's request path one hop long and ties the proxy's
//! lifetime to the session it serves.

pub mod inject;
pub mod server;
pub mod upstream;

pub use inject::redirect_env;
pub use server::{start, ProxyHandle, ProxyOptions};
pub use upstream::{resolve_upstream, tool_kind, ToolKind};
