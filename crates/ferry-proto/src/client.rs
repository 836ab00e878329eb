// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Minimal IPC client: connect to the daemon endpoint, send events, run
//! request/response round-trips.
//!
//! Used by the `ferry` CLI (status/stop), the notify relays, and the
//! in-CLI reply-assembly proxy. The daemon answers requests in order on
//! the same connection, so a round-trip is "write one line, read the next
//! decodable response line".

use std::path::Path;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{decode_daemon_line, encode_line, ClientMessage, DaemonMessage};

pub struct IpcClient {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

impl IpcClient {
    /// Connect to the daemon's endpoint (socket path or pipe name).
    pub async fn connect(endpoint: &Path) -> anyhow::Result<Self> {
        #[cfg(unix)]
        {
            let stream = tokio::net::UnixStream::connect(endpoint)
                .await
                .with_context(|| {
                    format!("connecting to ferry daemon at {}", endpoint.display())
                })?;
            let (read_half, write_half) = stream.into_split();
            Ok(Self {
                reader: BufReader::new(Box::new(read_half)),
                writer: Box::new(write_half),
            })
        }
        #[cfg(windows)]
        {
            use tokio::net::windows::named_pipe::ClientOptions;
            let pipe = ClientOptions::new()
                .open(endpoint.display().to_string())
                .with_context(|| {
                    format!("connecting to ferry daemon at {}", endpoint.display())
                })?;
            let (read_half, write_half) = tokio::io::split(pipe);
            Ok(Self {
                reader: BufReader::new(Box::new(read_half)),
                writer: Box::new(write_half),
            })
        }
    }

    /// Fire-and-forget event.
    pub async fn send(&mut self, msg: &ClientMessage) -> anyhow::Result<()> {
        let line = encode_line(msg)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send a request and wait for the next decodable daemon message.
    pub async fn request(&mut self, msg: &ClientMessage) -> anyhow::Result<DaemonMessage> {
        self.send(msg).await?;
        match self.next_message().await? {
            Some(reply) => Ok(reply),
            None => anyhow::bail!("daemon closed the connection before replying"),
        }
    }

    /// Read daemon messages until one decodes or the stream ends.
    pub async fn next_message(&mut self) -> anyhow::Result<Option<DaemonMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match decode_daemon_line(trimmed) {
                Ok(msg) => return Ok(Some(msg)),
                // Unknown message types from a newer daemon are skipped.
                Err(_) => continue,
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn request_reads_the_matching_response() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&endpoint).unwrap();

        // A daemon stand-in answering status with a stop_response line
        // preceded by junk the client must skip.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let _request = lines.next_line().await.unwrap();
            write_half.write_all(b"garbage line\n").await.unwrap();
            write_half
                .write_all(b"{\"type\":\"stop_response\",\"payload\":{\"ok\":true}}\n")
                .await
                .unwrap();
        });

        let mut client = IpcClient::connect(&endpoint).await.unwrap();
        let reply = client.request(&ClientMessage::StopRequest {}).await.unwrap();
        assert!(matches!(reply, DaemonMessage::StopResponse { ok: true }));
    }

    #[tokio::test]
    async fn connect_to_missing_endpoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IpcClient::connect(&dir.path().join("nope.sock")).await.is_err());
    }
}
