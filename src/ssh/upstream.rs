//! Outbound SSH connection to the upstream Git host.
//!
//! The upstream host key is pinned: the connection is refused unless the
//! presented key exactly matches the configured one.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use super::exchange::{RemoteChannel, RemoteEvent, SSH_EXTENDED_DATA_STDERR};
use crate::auth::keys::{fingerprint, same_key};
use crate::credentials::SshAccount;

// ---------------------------------------------------------------------------
// Host key pinning
// ---------------------------------------------------------------------------

/// Client-side handler that accepts only the pinned upstream host key.
pub struct PinnedHostKey {
    expected: Arc<PublicKey>,
}

#[async_trait::async_trait]
impl client::Handler for PinnedHostKey {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        if same_key(server_public_key, &self.expected) {
            return Ok(true);
        }
        warn!(
            presented = %fingerprint(server_public_key),
            expected = %fingerprint(&self.expected),
            "upstream host key does not match the pinned key"
        );
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// Where and how to reach the upstream SSH server.
#[derive(Clone)]
pub struct UpstreamTarget {
    address: String,
    host_key: Arc<PublicKey>,
    connect_timeout: Duration,
    config: Arc<client::Config>,
}

impl UpstreamTarget {
    pub fn new(address: String, host_key: PublicKey, connect_timeout: Duration) -> Self {
        Self {
            address,
            host_key: Arc::new(host_key),
            connect_timeout,
            config: Arc::new(client::Config::default()),
        }
    }

    /// Connect and authenticate as `account`, bounded by the connect timeout.
    pub async fn connect(&self, account: &SshAccount) -> Result<UpstreamSession> {
        let handler = PinnedHostKey {
            expected: Arc::clone(&self.host_key),
        };
        let handshake = async {
            let mut handle = client::connect(Arc::clone(&self.config), self.address.as_str(), handler)
                .await
                .with_context(|| format!("failed to connect to upstream {}", self.address))?;
            let authenticated = handle
                .authenticate_publickey(account.user.clone(), Arc::clone(&account.key))
                .await
                .context("upstream public-key authentication failed")?;
            anyhow::ensure!(
                authenticated,
                "upstream rejected the key for account {:?}",
                account.user
            );
            Ok(handle)
        };

        let handle = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                anyhow!(
                    "timed out connecting to upstream {} after {:?}",
                    self.address,
                    self.connect_timeout
                )
            })??;
        debug!(upstream = %self.address, account = %account.user, "upstream session established");
        Ok(UpstreamSession { handle })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An authenticated upstream connection.  Call [`UpstreamSession::close`] when
/// done; dropping it also tears the connection down.
pub struct UpstreamSession {
    handle: Handle<PinnedHostKey>,
}

impl UpstreamSession {
    /// Open a session channel and start `command` on it.
    pub async fn exec(&mut self, command: &str, git_protocol: Option<&str>) -> Result<UpstreamChannel> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .context("failed to open upstream session channel")?;
        if let Some(value) = git_protocol {
            channel
                .set_env(false, "GIT_PROTOCOL", value)
                .await
                .context("failed to forward GIT_PROTOCOL upstream")?;
        }
        channel
            .exec(true, command)
            .await
            .context("failed to start command upstream")?;
        Ok(UpstreamChannel { channel })
    }

    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "upstream disconnect failed");
        }
    }
}

/// The upstream channel running the client's git command.
pub struct UpstreamChannel {
    channel: russh::Channel<client::Msg>,
}

#[async_trait::async_trait]
impl RemoteChannel for UpstreamChannel {
    fn stdin(&self) -> Pin<Box<dyn AsyncWrite + Send>> {
        Box::pin(self.channel.make_writer())
    }

    async fn next_event(&mut self) -> Option<RemoteEvent> {
        loop {
            let event = match self.channel.wait().await? {
                ChannelMsg::Data { data } => RemoteEvent::Stdout(Bytes::copy_from_slice(&data)),
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    RemoteEvent::Stderr(Bytes::copy_from_slice(&data))
                }
                ChannelMsg::Eof => RemoteEvent::Eof,
                ChannelMsg::Close => RemoteEvent::Closed,
                ChannelMsg::ExitStatus { exit_status } => RemoteEvent::Exit(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    RemoteEvent::Signal(format!("{signal_name:?}"))
                }
                ChannelMsg::Failure => {
                    warn!("upstream refused the exec request");
                    continue;
                }
                _ => continue,
            };
            return Some(event);
        }
    }

    async fn close_stdin(&mut self) -> Result<()> {
        self.channel
            .eof()
            .await
            .context("failed to send EOF upstream")
    }
}
