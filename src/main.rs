// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod notify;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use ferry_proto::{ClientMessage, DaemonMessage, IpcClient};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let result = runtime.block_on(async {
        match cli.command {
            Commands::Daemon => ferry_daemon::daemon::run().await,
            Commands::Status => status().await,
            Commands::Stop => stop().await,
            Commands::Proxy {
                tool,
                session,
                export,
            } => run_proxy(&tool, &session, export).await,
            Commands::Notify { tool, payload } => notify::run(tool, payload).await,
        }
    });

    if let Err(e) = result {
        // Fatal failures (key file, endpoint bind, daemon unreachable)
        // exit 1 with the cause chain on stderr.
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_env("FERRY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    match std::env::var("FERRY_LOG_FILE") {
        Ok(path) if !path.is_empty() => {
            match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .with_writer(std::sync::Arc::new(file))
                                .with_ansi(false),
                        )
                        .init();
                }
                Err(e) => {
                    eprintln!("cannot open FERRY_LOG_FILE {path}: {e}");
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── status / stop ─────────────────────────────────────────────────────────────

async fn connect() -> anyhow::Result<IpcClient> {
    IpcClient::connect(&ferry_config::paths::ipc_endpoint())
        .await
        .context("ferry daemon is not running (start it with `ferry daemon`)")
}

async fn status() -> anyhow::Result<()> {
    let mut client = connect().await?;
    let reply = client.request(&ClientMessage::StatusRequest {}).await?;
    let DaemonMessage::StatusResponse {
        pid,
        started_at,
        sessions,
        warnings,
    } = reply
    else {
        anyhow::bail!("unexpected response from daemon");
    };

    println!("ferry daemon: pid {pid}, up since {started_at}");
    if sessions.is_empty() {
        println!("no sessions");
    } else {
        println!("{} session(s):", sessions.len());
        for s in &sessions {
            let interactive = s.interactive_bot_id.as_deref().unwrap_or("-");
            let push = s.push_bot_id.as_deref().unwrap_or("-");
            println!(
                "  {}  {:?}  cli={}  cwd={}  interactive={}  push={}{}{}",
                s.session_id,
                s.status,
                s.cli,
                s.cwd,
                interactive,
                push,
                if s.push_enabled { "" } else { " (push off)" },
                if s.proxy_mode { "  [proxy]" } else { "" },
            );
        }
    }
    if !warnings.is_empty() {
        println!();
        println!("warnings:");
        for w in &warnings {
            println!("  {}: {}", w.bot_id, w.message);
        }
    }
    Ok(())
}

async fn stop() -> anyhow::Result<()> {
    let mut client = connect().await?;
    let reply = client.request(&ClientMessage::StopRequest {}).await?;
    match reply {
        DaemonMessage::StopResponse { ok: true } => {
            println!("daemon stopping");
            Ok(())
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

// ── standalone proxy ──────────────────────────────────────────────────────────

async fn run_proxy(tool: &str, session: &str, export: bool) -> anyhow::Result<()> {
    let handle = ferry_proxy::start(ferry_proxy::ProxyOptions {
        tool: tool.to_string(),
        session_id: session.to_string(),
        ipc_endpoint: ferry_config::paths::ipc_endpoint(),
    })
    .await?;

    let env = ferry_proxy::redirect_env(handle.kind, &handle.upstream, &handle.origin())?;
    eprintln!(
        "# proxy for {tool} on {} → {} (session {session})",
        handle.origin(),
        handle.upstream
    );
    for (key, value) in env {
        if export {
            println!("export {key}={}", shell_quote(&value));
        } else {
            println!("{key}={value}");
        }
    }
    eprintln!("# keep this process running while the tool is in use");

    // Serve until interrupted; the listener dies with the process.
    let _ = tokio::signal::ctrl_c().await;
    Ok(())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
