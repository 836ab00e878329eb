// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! IPC server: accept local clients, frame newline-delimited JSON, hand
//! decoded messages to the router.
//!
//! One endpoint serves every client kind — CLI hosts, the in-CLI proxy and
//! the desktop controller — because a message's meaning is carried entirely
//! by its `type` tag. Malformed lines and unknown tags are dropped with a
//! debug log; a protocol mistake in one client must never take the server
//! down.
//!
//! Each connection gets:
//! - a reader task: accumulate bytes, split on LF, decode, forward as
//!   [`RouterMsg::Client`];
//! - a writer task: drain an mpsc of pre-encoded lines into the stream, so
//!   the router never blocks on a slow client.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::RouterMsg;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Writer half of one IPC connection: pre-encoded lines go in, the writer
/// task flushes them out.
pub type ConnWriter = mpsc::Sender<String>;

#[cfg(unix)]
pub use unix::serve;

#[cfg(windows)]
pub use windows::serve;

/// Shared per-connection plumbing once a stream is split into halves.
async fn drive_connection<R, W>(
    read_half: R,
    write_half: W,
    router: mpsc::Sender<RouterMsg>,
    shutdown: CancellationToken,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (writer_tx, mut writer_rx) = mpsc::channel::<String>(256);

    if router
        .send(RouterMsg::ClientConnected {
            conn_id,
            writer: writer_tx,
        })
        .await
        .is_err()
    {
        return; // router already gone; daemon is shutting down
    }
    debug!(conn_id, "ipc client connected");

    // Writer task: owns the write half until the channel closes.
    let writer_task = tokio::spawn(async move {
        let mut write_half = write_half;
        while let Some(line) = writer_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    // Reader loop on this task.
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match ferry_proto::decode_client_line(line) {
                    Ok(msg) => {
                        if router
                            .send(RouterMsg::Client { conn_id, msg })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        // Silent discard per protocol contract; debug only.
                        debug!(conn_id, "discarding undecodable line: {e}");
                    }
                }
            }
        }
    }

    let _ = router.send(RouterMsg::ClientGone { conn_id }).await;
    writer_task.abort();
    debug!(conn_id, "ipc client disconnected");
}

// ── POSIX: Unix domain socket ─────────────────────────────────────────────────

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixListener;
    use tokio::sync::oneshot;

    /// Bind the socket and serve until `shutdown` fires.
    ///
    /// `ready` resolves once the endpoint is bound (or with the bind
    /// error), so the daemon can fail startup with a proper exit code
    /// instead of limping on without an endpoint.
    pub async fn serve(
        endpoint: PathBuf,
        router: mpsc::Sender<RouterMsg>,
        shutdown: CancellationToken,
        ready: oneshot::Sender<anyhow::Result<()>>,
    ) {
        let listener = match UnixListener::bind(&endpoint) {
            Ok(listener) => {
                let _ = ready.send(Ok(()));
                listener
            }
            Err(e) => {
                let _ = ready.send(Err(anyhow::anyhow!(
                    "cannot bind IPC socket {}: {e}",
                    endpoint.display()
                )));
                return;
            }
        };
        info!(endpoint = %endpoint.display(), "ipc server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let (read_half, write_half) = stream.into_split();
                            let router = router.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(drive_connection(
                                read_half, write_half, router, shutdown,
                            ));
                        }
                        Err(e) => warn!("ipc accept error: {e}"),
                    }
                }
            }
        }

        info!("ipc server stopped accepting");
    }
}

// ── Windows: named pipe ───────────────────────────────────────────────────────

#[cfg(windows)]
mod windows {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::windows::named_pipe::ServerOptions;
    use tokio::sync::oneshot;

    /// Serve on `\\.\pipe\ferry` until `shutdown` fires.
    ///
    /// Named pipes need a fresh server instance per client; the first
    /// instance is created eagerly (and exclusively) so a second daemon
    /// fails fast.
    pub async fn serve(
        endpoint: PathBuf,
        router: mpsc::Sender<RouterMsg>,
        shutdown: CancellationToken,
        ready: oneshot::Sender<anyhow::Result<()>>,
    ) {
        let pipe_name = endpoint.display().to_string();
        let mut server = match ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)
        {
            Ok(server) => {
                let _ = ready.send(Ok(()));
                server
            }
            Err(e) => {
                let _ = ready.send(Err(anyhow::anyhow!("cannot create pipe {pipe_name}: {e}")));
                return;
            }
        };
        info!(endpoint = %pipe_name, "ipc server listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = server.connect() => {
                    if let Err(e) = connected {
                        warn!("pipe connect error: {e}");
                        continue;
                    }
                    // Hand the connected instance to the handler and stand
                    // up the next one.
                    let client = server;
                    server = match ServerOptions::new().create(&pipe_name) {
                        Ok(next) => next,
                        Err(e) => {
                            warn!("cannot recreate pipe instance: {e}");
                            break;
                        }
                    };

                    let (read_half, write_half) = tokio::io::split(client);
                    let router = router.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(drive_connection(read_half, write_half, router, shutdown));
                }
            }
        }

        info!("ipc server stopped accepting");
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ferry_proto::ClientMessage;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    async fn start_server(
        dir: &tempfile::TempDir,
    ) -> (
        std::path::PathBuf,
        mpsc::Receiver<RouterMsg>,
        CancellationToken,
    ) {
        let endpoint = dir.path().join("daemon.sock");
        let (tx, rx) = mpsc::channel(64);
        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(serve(endpoint.clone(), tx, shutdown.clone(), ready_tx));
        ready_rx
            .await
            .expect("serve task died")
            .expect("bind failed");
        (endpoint, rx, shutdown)
    }

    #[tokio::test]
    async fn valid_lines_reach_the_router() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, mut rx, shutdown) = start_server(&dir).await;

        let mut client = UnixStream::connect(&endpoint).await.unwrap();
        client
            .write_all(
                b"{\"type\":\"register_session\",\"payload\":{\"sessionId\":\"s1\",\"cli\":\"claude\",\"cwd\":\"/w\"}}\n",
            )
            .await
            .unwrap();

        // First message is the connection announcement.
        let connected = rx.recv().await.unwrap();
        assert!(matches!(connected, RouterMsg::ClientConnected { .. }));

        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            RouterMsg::Client {
                msg: ClientMessage::RegisterSession { session_id, .. },
                ..
            } => assert_eq!(session_id, "s1"),
            other => panic!("expected RegisterSession, got {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, mut rx, shutdown) = start_server(&dir).await;

        let mut client = UnixStream::connect(&endpoint).await.unwrap();
        client.write_all(b"this is not json\n").await.unwrap();
        client
            .write_all(b"{\"type\":\"no_such_type\",\"payload\":{}}\n")
            .await
            .unwrap();
        client
            .write_all(b"{\"type\":\"status_request\",\"payload\":{}}\n")
            .await
            .unwrap();

        let _connected = rx.recv().await.unwrap();
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(
            matches!(
                msg,
                RouterMsg::Client {
                    msg: ClientMessage::StatusRequest {},
                    ..
                }
            ),
            "only the valid line may arrive: {msg:?}"
        );

        shutdown.cancel();
    }

    #[tokio::test]
    async fn disconnect_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, mut rx, shutdown) = start_server(&dir).await;

        let client = UnixStream::connect(&endpoint).await.unwrap();
        let connected = rx.recv().await.unwrap();
        let RouterMsg::ClientConnected { conn_id, .. } = connected else {
            panic!("expected ClientConnected");
        };

        drop(client);
        let msg = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, RouterMsg::ClientGone { conn_id: gone } if gone == conn_id));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn two_clients_are_served_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let (endpoint, mut rx, shutdown) = start_server(&dir).await;

        let mut a = UnixStream::connect(&endpoint).await.unwrap();
        let mut b = UnixStream::connect(&endpoint).await.unwrap();
        a.write_all(b"{\"type\":\"status_request\",\"payload\":{}}\n")
            .await
            .unwrap();
        b.write_all(b"{\"type\":\"status_request\",\"payload\":{}}\n")
            .await
            .unwrap();

        let mut clients = 0;
        let mut requests = 0;
        for _ in 0..4 {
            match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                RouterMsg::ClientConnected { .. } => clients += 1,
                RouterMsg::Client { .. } => requests += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(clients, 2);
        assert_eq!(requests, 2);

        shutdown.cancel();
    }
}
