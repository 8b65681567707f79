//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler authenticates the client by public key, validates the git shell
//! command, and hands each accepted exec request to a supervised exchange
//! task that proxies it to the upstream host.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use super::exchange::{
    self, ChannelSink, ClientSink, CLIENT_INPUT_QUEUE, SSH_EXTENDED_DATA_STDERR,
};
use super::upstream::UpstreamTarget;
use crate::auth::keys::fingerprint;
use crate::auth::{AuthorizationGate, Subject};
use crate::credentials::{AccountPool, SshAccount};
use crate::git::GitShellCommand;
use crate::metrics::{Metrics, SessionGuard, Transport};

/// Exit code for denied or failed exchanges.
const EXIT_FAILURE: i32 = 1;

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Everything a session needs, shared by all connections of one listener.
pub struct SshContext {
    pub gate: AuthorizationGate,
    pub pool: AccountPool<SshAccount>,
    pub upstream: UpstreamTarget,
    pub metrics: Arc<Metrics>,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// State kept per open channel of one connection.
struct Channels<K = ChannelId> {
    /// `GIT_PROTOCOL` values sent by the client via SSH env requests.
    git_protocol: HashMap<K, String>,
    /// Client data for channels with a running exchange.
    inputs: HashMap<K, mpsc::Sender<Bytes>>,
}

impl<K: Eq + Hash> Channels<K> {
    fn new() -> Self {
        Self {
            git_protocol: HashMap::new(),
            inputs: HashMap::new(),
        }
    }

    fn set_git_protocol(&mut self, channel: K, value: String) {
        self.git_protocol.insert(channel, value);
    }

    fn take_git_protocol(&mut self, channel: &K) -> Option<String> {
        self.git_protocol.remove(channel)
    }

    /// Start accepting client data for `channel`.
    fn open_input(&mut self, channel: K) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(CLIENT_INPUT_QUEUE);
        self.inputs.insert(channel, tx);
        rx
    }

    /// Queue client data, waiting while the exchange is behind.
    async fn queue_input(&mut self, channel: &K, data: &[u8]) {
        if let Some(tx) = self.inputs.get(channel) {
            if tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                // The exchange has finished with its input.
                self.inputs.remove(channel);
            }
        }
    }

    fn end_input(&mut self, channel: &K) {
        self.inputs.remove(channel);
    }

    fn close(&mut self, channel: &K) {
        self.inputs.remove(channel);
        self.git_protocol.remove(channel);
    }
}

/// Per-connection SSH session state.
pub struct SshSession {
    ctx: Arc<SshContext>,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    channels: Channels,
}

impl SshSession {
    pub fn new(ctx: Arc<SshContext>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer_addr,
            username: None,
            channels: Channels::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel close helper
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: i32) {
    session.exit_status_request(channel_id, exit_status as u32);
    session.eof(channel_id);
    session.close(channel_id);
}

/// [`finish_channel`] for use outside handler callbacks.
async fn finish_channel_async(handle: &Handle, channel_id: ChannelId, exit_status: i32) {
    let _ = handle
        .exit_status_request(channel_id, exit_status as u32)
        .await;
    let _ = handle.eof(channel_id).await;
    let _ = handle.close(channel_id).await;
}

// ---------------------------------------------------------------------------
// Exchange pipeline
// ---------------------------------------------------------------------------

/// One accepted exec request.
struct ExchangeRequest<S> {
    ctx: Arc<SshContext>,
    user: String,
    command: GitShellCommand,
    git_protocol: Option<String>,
    client_rx: mpsc::Receiver<Bytes>,
    sink: S,
}

/// Authorize, connect upstream and bridge.  Returns the exit code for the
/// client.
#[instrument(skip_all, fields(user = %req.user, repo = %req.command.repository(), service = %req.command.service()))]
async fn run_exchange<S: ClientSink>(req: ExchangeRequest<S>) -> Result<i32> {
    let ExchangeRequest {
        ctx,
        user,
        command,
        git_protocol,
        client_rx,
        sink,
    } = req;
    let operation = command.operation();

    let subject = Subject::user(user);
    let allowed = ctx
        .gate
        .is_authorized(&subject, command.repository(), operation)
        .await;
    ctx.metrics.record_decision(Transport::Ssh, operation, allowed);
    if !allowed {
        let msg = format!("ERROR: access denied to {}\n", command.repository());
        let _ = sink.stderr(Bytes::from(msg)).await;
        return Ok(EXIT_FAILURE);
    }

    let _session = SessionGuard::start(&ctx.metrics, Transport::Ssh);
    let account = ctx.pool.next();
    ctx.metrics.record_draw(Transport::Ssh);
    debug!(account = %account.user, "drew upstream account");

    let mut upstream = match ctx.upstream.connect(account).await {
        Ok(upstream) => upstream,
        Err(e) => {
            ctx.metrics.record_upstream_failure(Transport::Ssh);
            return Err(e);
        }
    };

    // The upstream connection is released on every path from here on.
    let result = async {
        let remote = upstream
            .exec(command.line(), git_protocol.as_deref())
            .await?;
        exchange::bridge(remote, client_rx, sink, Arc::clone(&ctx.metrics)).await
    }
    .await;
    upstream.close().await;

    let exit = result?;
    info!(exit_code = exit.code(), "exchange finished");
    Ok(exit.code())
}

/// Run the exchange on its own task so that errors and panics become exit
/// code 1 instead of reaching the connection.
async fn supervise<F>(exchange: F) -> i32
where
    F: std::future::Future<Output = Result<i32>> + Send + 'static,
{
    match tokio::spawn(exchange).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "SSH exchange failed");
            EXIT_FAILURE
        }
        Err(e) => {
            error!(error = %e, "SSH exchange task panicked");
            EXIT_FAILURE
        }
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Accept the key if the authorization service associates it with `user`.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = fingerprint(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fp,
            "SSH public-key auth attempt"
        );

        if self.ctx.gate.validate_public_key(user, key).await {
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            warn!(user = %user, fingerprint = %fp, "SSH key rejected");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.channels
                .set_git_protocol(channel, variable_value.to_string());
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.queue_input(&channel, data).await;
        Ok(())
    }

    /// Client EOF ends the client-to-remote direction.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.end_input(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.close(&channel);
        Ok(())
    }

    /// Validate the git shell command and start the proxied exchange.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(
            peer = ?self.peer_addr,
            username = ?self.username,
            command = %raw_cmd,
            "SSH exec request"
        );

        let Some(command) = GitShellCommand::parse(&raw_cmd) else {
            warn!(command = %raw_cmd, "rejected non-git SSH command");
            session.extended_data(
                channel_id,
                SSH_EXTENDED_DATA_STDERR,
                CryptoVec::from_slice(
                    b"ERROR: only git-upload-pack and git-receive-pack are supported.\n",
                ),
            );
            finish_channel(session, channel_id, EXIT_FAILURE);
            return Ok(());
        };

        let user = self
            .username
            .clone()
            .context("exec request before authentication")?;
        let git_protocol = self.channels.take_git_protocol(&channel_id);
        let client_rx = self.channels.open_input(channel_id);
        session.channel_success(channel_id);

        let handle = session.handle();
        let request = ExchangeRequest {
            ctx: Arc::clone(&self.ctx),
            user,
            command,
            git_protocol,
            client_rx,
            sink: ChannelSink::new(handle.clone(), channel_id),
        };

        tokio::spawn(async move {
            let code = supervise(run_exchange(request)).await;
            finish_channel_async(&handle, channel_id, code).await;
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn supervise_passes_exit_codes_through() {
        assert_eq!(supervise(async { Ok(0) }).await, 0);
        assert_eq!(supervise(async { Ok(17) }).await, 17);
        assert_eq!(supervise(async { Ok(-1) }).await, -1);
    }

    #[tokio::test]
    async fn supervise_maps_errors_to_one() {
        assert_eq!(
            supervise(async { Err(anyhow::anyhow!("upstream unreachable")) }).await,
            1
        );
    }

    #[tokio::test]
    async fn supervise_contains_panics() {
        let code = supervise(async {
            if true {
                panic!("boom");
            }
            Ok(0)
        })
        .await;
        assert_eq!(code, 1);
    }

    // ── Exchange pipeline ──────────────────────────────────────────────

    use std::sync::Mutex;
    use std::time::Duration;

    use russh_keys::key::KeyPair;

    use crate::auth::{AuthError, Provider, UserProfile};
    use crate::git::GitOperation;
    use crate::metrics::MetricsRegistry;

    /// Authorizes reads only.
    struct ReadOnly;

    #[async_trait::async_trait]
    impl Provider for ReadOnly {
        async fn login(&self, _user: &str, _password: &str) -> Result<String, AuthError> {
            Err(AuthError::InvalidCredentials)
        }

        async fn is_authorized(
            &self,
            _subject: &Subject,
            _repository: &str,
            operation: GitOperation,
        ) -> Result<bool, AuthError> {
            Ok(operation == GitOperation::Read)
        }

        async fn fetch_user_profile(&self, _token: &str) -> Result<UserProfile, AuthError> {
            Err(AuthError::InvalidCredentials)
        }

        async fn fetch_public_keys(&self, _user: &str) -> Result<Vec<PublicKey>, AuthError> {
            Ok(Vec::new())
        }

        fn kind(&self) -> &'static str {
            "read-only"
        }
    }

    #[derive(Clone, Default)]
    struct StderrSink(Arc<Mutex<Vec<u8>>>);

    #[async_trait::async_trait]
    impl ClientSink for StderrSink {
        async fn stdout(&self, _data: Bytes) -> Result<()> {
            Ok(())
        }

        async fn stderr(&self, data: Bytes) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(&data);
            Ok(())
        }
    }

    fn context() -> Arc<SshContext> {
        let upstream_key = KeyPair::generate_ed25519().clone_public_key().unwrap();
        Arc::new(SshContext {
            gate: AuthorizationGate::new(Arc::new(ReadOnly), Duration::from_secs(2)),
            pool: AccountPool::new(vec![SshAccount {
                user: "git".into(),
                key: Arc::new(KeyPair::generate_ed25519()),
            }])
            .unwrap(),
            // Nothing listens on the discard port.
            upstream: UpstreamTarget::new("127.0.0.1:9".into(), upstream_key, Duration::from_secs(2)),
            metrics: MetricsRegistry::new().metrics,
        })
    }

    fn request(ctx: &Arc<SshContext>, line: &str, sink: StderrSink) -> ExchangeRequest<StderrSink> {
        let (_tx, client_rx) = mpsc::channel(CLIENT_INPUT_QUEUE);
        ExchangeRequest {
            ctx: Arc::clone(ctx),
            user: "alice".into(),
            command: GitShellCommand::parse(line).unwrap(),
            git_protocol: None,
            client_rx,
            sink,
        }
    }

    #[tokio::test]
    async fn denied_command_exits_one_without_drawing() {
        let ctx = context();
        let sink = StderrSink::default();
        let code = supervise(run_exchange(request(
            &ctx,
            "git-receive-pack '/org/repo.git'",
            sink.clone(),
        )))
        .await;

        assert_eq!(code, 1);
        assert_eq!(ctx.pool.position(), 0);
        let stderr = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(stderr.contains("access denied to /org/repo.git"));
    }

    #[tokio::test]
    async fn unreachable_upstream_exits_one_after_drawing() {
        let ctx = context();
        let code = supervise(run_exchange(request(
            &ctx,
            "git-upload-pack '/org/repo.git'",
            StderrSink::default(),
        )))
        .await;

        assert_eq!(code, 1);
        assert_eq!(ctx.pool.position(), 1);
    }

    #[test]
    fn minus_one_is_sent_as_all_ones() {
        assert_eq!(-1i32 as u32, 0xffff_ffff);
    }

    // ── Per-channel state ──────────────────────────────────────────────

    #[test]
    fn git_protocol_is_kept_per_channel() {
        let mut channels = Channels::<u32>::new();
        channels.set_git_protocol(1, "version=2".into());

        assert_eq!(channels.take_git_protocol(&2), None);
        assert_eq!(channels.take_git_protocol(&1).as_deref(), Some("version=2"));
        assert_eq!(channels.take_git_protocol(&1), None);

        channels.set_git_protocol(3, "version=1".into());
        channels.close(&3);
        assert_eq!(channels.take_git_protocol(&3), None);
    }

    #[tokio::test]
    async fn full_input_queue_makes_the_client_wait() {
        let mut channels = Channels::<u32>::new();
        let mut rx = channels.open_input(7);
        for _ in 0..CLIENT_INPUT_QUEUE {
            channels.queue_input(&7, b"pack").await;
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            channels.queue_input(&7, b"more"),
        )
        .await;
        assert!(blocked.is_err(), "queue accepted data past its capacity");

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"pack"));
        tokio::time::timeout(Duration::from_secs(1), channels.queue_input(&7, b"more"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn input_for_a_finished_exchange_is_dropped() {
        let mut channels = Channels::<u32>::new();
        drop(channels.open_input(7));
        channels.queue_input(&7, b"late").await;
        assert!(channels.inputs.is_empty());

        // Unknown channels are ignored.
        channels.queue_input(&8, b"stray").await;
    }
}
