// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Daemon startup — assembles all subsystems and runs until shutdown.
//!
//! # Startup sequence
//!
//! [`run`] performs these steps in order:
//!
//! 1. Create `~/.ferry/` and sweep the stale image directory.
//! 2. Open the config store (the master key failing here is fatal).
//! 3. Validate/clean the lock file and any leftover socket.
//! 4. Build the chat connector over the production transport.
//! 5. Build the router and bind the IPC endpoint (bind failure is fatal —
//!    address-in-use means another daemon won the race).
//! 6. Write the lock file.
//! 7. Spawn the registry prune tick and signal watchers.
//! 8. Run the router loop until SIGINT/SIGTERM or `stop_request`.
//! 9. Drain, then delete the socket and lock files.
//!
//! Exit is 0 on a clean shutdown, and the caller maps a returned error to
//! exit code 1 (fatal startup failure).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use ferry_chat::feishu::FeishuTransport;
use ferry_chat::ChatConnector;
use ferry_config::{paths, ConfigStore};

use crate::lockfile;
use crate::router::{Router, RouterMsg};

/// How long the whole drain (flush + in-flight sends + cleanup) may take
/// before the process exits regardless.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Run the daemon in the foreground. Blocks until shutdown.
pub async fn run() -> anyhow::Result<()> {
    let home = paths::ferry_home();
    std::fs::create_dir_all(&home)
        .with_context(|| format!("creating {}", home.display()))?;

    // Inbound images do not survive a daemon restart by design.
    let _ = std::fs::remove_dir_all(paths::images_dir());

    let config = ConfigStore::open(&paths::config_path(), &paths::master_key_path())
        .context("opening configuration")?;

    let endpoint = paths::ipc_endpoint();
    lockfile::check_and_clean(&paths::lock_path(), &endpoint)?;

    let shutdown = CancellationToken::new();
    let transport = Arc::new(FeishuTransport::new());
    let reconnect = config.document().reconnect.clone();
    let (connector, chat_rx) = ChatConnector::new(transport, reconnect);
    let (router, router_tx) = Router::new(config, connector, chat_rx, shutdown.clone());

    // IPC endpoint: bind before claiming the lock, so a lost race surfaces
    // as a clean "address in use" startup failure.
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(crate::ipc::serve(
        endpoint.clone(),
        router_tx.clone(),
        shutdown.clone(),
        ready_tx,
    ));
    ready_rx.await.context("ipc server task died")??;

    lockfile::write(&paths::lock_path(), &endpoint)?;
    info!(pid = std::process::id(), "ferry daemon up");

    // Registry maintenance tick.
    {
        let tx = router_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PRUNE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if tx.send(RouterMsg::PruneTick).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // Signals → graceful shutdown.
    {
        let tx = router_tx.clone();
        tokio::spawn(async move {
            wait_for_termination_signal().await;
            info!("termination signal received");
            let _ = tx.send(RouterMsg::Shutdown).await;
        });
    }

    // The router loop owns all routing state; it returns once drained.
    // The drain is bounded so a wedged chat send cannot keep the process
    // alive past the deadline.
    run_router_with_deadline(router, shutdown.clone()).await;

    // Cleanup: socket file (POSIX) and lock file.
    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(&endpoint);
    }
    lockfile::remove(&paths::lock_path());
    info!("ferry daemon stopped");
    Ok(())
}

async fn run_router_with_deadline(
    router: Router<FeishuTransport>,
    shutdown: CancellationToken,
) {
    let run = router.run();
    tokio::pin!(run);

    tokio::select! {
        () = &mut run => {}
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(SHUTDOWN_DEADLINE).await;
        } => {
            warn!("hard shutdown deadline hit; abandoning drain");
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
