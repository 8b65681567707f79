//! Bidirectional bridge between an inbound client channel and the upstream
//! channel running the same git command.
//!
//! Two tasks run per exchange:
//!
//! * **upload** drains client data into the remote's stdin.  It ends on client
//!   EOF/close or when cancelled, and then tells the download side to send EOF
//!   upstream.
//! * **download** relays remote stdout/stderr to the client and records the
//!   remote exit status.  It ends when the remote channel closes; a failed
//!   client write or remote close cancels the upload side.
//!
//! The exchange completes only when both tasks are done.  The exit status is
//! read after that, so every byte of remote output reaches the client before
//! the status does.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use bytes::Bytes;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::metrics::{Direction, Metrics};

/// Extended-data type code for stderr (RFC 4254 §5.2).
pub const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Client data packets queued per exchange before the client is made to wait.
pub const CLIENT_INPUT_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Something the remote side of an exchange produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    /// The remote will send no more output.
    Eof,
    Exit(u32),
    /// The remote command was killed by a signal.
    Signal(String),
    /// The remote channel is closed.
    Closed,
}

/// The upstream end of an exchange.
#[async_trait::async_trait]
pub trait RemoteChannel: Send + 'static {
    /// A writer for the remote command's stdin.
    fn stdin(&self) -> Pin<Box<dyn AsyncWrite + Send>>;

    /// The next event, or `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<RemoteEvent>;

    /// Signal end of input to the remote command.
    async fn close_stdin(&mut self) -> Result<()>;
}

/// The inbound client end of an exchange.
#[async_trait::async_trait]
pub trait ClientSink: Send + Sync + 'static {
    async fn stdout(&self, data: Bytes) -> Result<()>;
    async fn stderr(&self, data: Bytes) -> Result<()>;
}

/// A client channel reached through the server session handle.
pub struct ChannelSink {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelSink {
    pub fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait::async_trait]
impl ClientSink for ChannelSink {
    async fn stdout(&self, data: Bytes) -> Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| anyhow!("client channel closed"))
    }

    async fn stderr(&self, data: Bytes) -> Result<()> {
        self.handle
            .extended_data(
                self.channel,
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(&data),
            )
            .await
            .map_err(|_| anyhow!("client channel closed"))
    }
}

// ---------------------------------------------------------------------------
// Exit status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteExit {
    Status(u32),
    /// The remote never reported a status (dropped connection or signal).
    Unavailable,
}

impl RemoteExit {
    /// Exit code reported to the client: the remote status, or `-1`.
    pub fn code(self) -> i32 {
        match self {
            RemoteExit::Status(n) => n as i32,
            RemoteExit::Unavailable => -1,
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Bridge `client_rx` ↔ `remote` ↔ `sink` until both directions finish.
pub async fn bridge<R, S>(
    remote: R,
    client_rx: mpsc::Receiver<Bytes>,
    sink: S,
    metrics: Arc<Metrics>,
) -> Result<RemoteExit>
where
    R: RemoteChannel,
    S: ClientSink,
{
    let cancel = CancellationToken::new();
    let (stdin_done_tx, stdin_done_rx) = oneshot::channel();

    let upload = tokio::spawn(upload(
        client_rx,
        remote.stdin(),
        stdin_done_tx,
        cancel.clone(),
        Arc::clone(&metrics),
    ));
    let download = tokio::spawn(download(remote, sink, stdin_done_rx, cancel, metrics));

    let (upload, download) = tokio::join!(upload, download);

    match upload.context("upload task failed")? {
        Ok(bytes) => debug!(bytes, "client to remote copy finished"),
        Err(e) => debug!(error = %format!("{e:#}"), "client to remote copy ended early"),
    }
    let exit = download.context("download task failed")??;
    Ok(exit)
}

async fn upload(
    mut client_rx: mpsc::Receiver<Bytes>,
    mut stdin: Pin<Box<dyn AsyncWrite + Send>>,
    _stdin_done: oneshot::Sender<()>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Ok(total),
            chunk = client_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else { break };
        // A remote that stopped reading must not pin this task.
        tokio::select! {
            _ = cancel.cancelled() => return Ok(total),
            res = stdin.write_all(&chunk) => res.context("failed to write to remote stdin")?,
        }
        total += chunk.len() as u64;
        metrics.record_bytes(Direction::Upload, chunk.len() as u64);
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        res = stdin.flush() => res.context("failed to flush remote stdin")?,
    }
    Ok(total)
}

async fn download<R, S>(
    mut remote: R,
    sink: S,
    mut stdin_done: oneshot::Receiver<()>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<RemoteExit>
where
    R: RemoteChannel,
    S: ClientSink,
{
    // Whatever happens here, the upload side must not outlive us.
    let _cancel_upload = cancel.drop_guard();

    let mut exit = RemoteExit::Unavailable;
    let mut stdin_open = true;
    loop {
        let event = tokio::select! {
            _ = &mut stdin_done, if stdin_open => {
                stdin_open = false;
                if let Err(e) = remote.close_stdin().await {
                    debug!(error = %e, "failed to send EOF upstream");
                }
                continue;
            }
            event = remote.next_event() => event,
        };

        match event {
            Some(RemoteEvent::Stdout(data)) => {
                let n = data.len() as u64;
                sink.stdout(data).await?;
                metrics.record_bytes(Direction::Download, n);
            }
            Some(RemoteEvent::Stderr(data)) => {
                let n = data.len() as u64;
                sink.stderr(data).await?;
                metrics.record_bytes(Direction::Download, n);
            }
            Some(RemoteEvent::Exit(status)) => exit = RemoteExit::Status(status),
            Some(RemoteEvent::Signal(name)) => {
                debug!(signal = %name, "remote command killed by signal");
                exit = RemoteExit::Unavailable;
            }
            Some(RemoteEvent::Eof) => debug!("remote output finished"),
            Some(RemoteEvent::Closed) | None => break,
        }
    }
    Ok(exit)
}
