//! # SSH Front End
//!
//! Accepts SSH connections, authenticates public keys through the
//! [`IdentityResolver`], and hands each session channel to the
//! [`ExecBridge`].
//!
//! ## Connection Model
//!
//! ```text
//!   TcpListener ──accept──► run_stream(ConnectionHandler)      (one task per connection)
//!                                 │
//!                 auth_publickey ─┤  Resolution → container identity
//!                                 │
//!         channel_open_session ───┤  ChannelState (pty, env, stdin pipe, cancel token)
//!                                 │
//!         shell / exec request ───┴──► spawn serve_channel            (one task per channel)
//!                                           ensure_running
//!                                           ExecBridge::run ── stdout/stderr pipes ──► pumps ──► channel
//!                                           exit-status, EOF, close
//! ```
//!
//! ## Security
//!
//! - Only public-key authentication is offered. Every rejection is delayed
//!   by [`AUTH_REJECTION_DELAY`].
//! - Connections beyond the configured cap are closed right after accept.
//! - Only `session` channels are served; subsystems (sftp) are refused.
//!
//! ## Disconnects
//!
//! Each channel has a [`CancellationToken`]. It fires when the client closes
//! the channel or the connection drops, which unwinds the bridge without
//! reporting an error.
//!
//! ## Handler Callbacks
//!
//! russh runs every callback of a connection on one loop, so callbacks never
//! wait on a command. Client input goes into a per-channel queue drained by
//! its own task, and window changes are dropped when the resize relay is
//! behind.

use crate::bridge::{ExecBridge, ExitStatus, PtyRequest, Session, SessionIo, WindowChanges};
use crate::config::Config;
use crate::constants::{
    AUTH_REJECTION_DELAY, CHANNEL_CHUNK_SIZE, RESIZE_CHANNEL_CAPACITY, SESSION_PIPE_CAPACITY,
    STDIN_BACKLOG_LIMIT,
};
use crate::error::{Error, Result};
use crate::identity::{ContainerIdentity, Credential, IdentityResolver, Resolution};
use crate::lifecycle::ensure_running;
use crate::runtime::{ContainerRuntime, WindowSize};
use async_trait::async_trait;
use russh::server::{self as ssh, Auth, Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SSH extended-data type code for stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// Message shown to the client when its container cannot be brought up.
const CONTAINER_UNAVAILABLE: &[u8] = b"sshbox: container unavailable\r\n";

// =============================================================================
// Server
// =============================================================================

/// State shared by every connection.
struct ServerContext {
    image: String,
    resolver: IdentityResolver,
    runtime: Arc<dyn ContainerRuntime>,
    bridge: ExecBridge,
}

/// SSH server bridging sessions into per-identity containers.
pub struct Server {
    ctx: Arc<ServerContext>,
    ssh_config: Arc<ssh::Config>,
    listen_addr: String,
    max_connections: usize,
}

impl Server {
    /// Builds a server from configuration, loading the host key and the
    /// authorized keys file.
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;
        let host_key = load_host_key(&config.host_key_path)?;
        let resolver = config.identity_resolver()?;
        Ok(Self::with_host_key(config, runtime, resolver, host_key))
    }

    /// Builds a server from already loaded key material.
    pub fn with_host_key(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        resolver: IdentityResolver,
        host_key: KeyPair,
    ) -> Self {
        let ssh_config = ssh::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            auth_rejection_time: AUTH_REJECTION_DELAY,
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: config.inactivity_timeout,
            ..Default::default()
        };
        let bridge = ExecBridge::new(Arc::clone(&runtime), config.shell.clone());
        Self {
            ctx: Arc::new(ServerContext {
                image: config.image.clone(),
                resolver,
                runtime,
                bridge,
            }),
            ssh_config: Arc::new(ssh_config),
            listen_addr: config.listen_addr.clone(),
            max_connections: config.max_connections,
        }
    }

    /// Binds the configured address and serves until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            wildcard = self.ctx.resolver.is_wildcard(),
            runtime = self.ctx.runtime.name(),
            "ssh server listening"
        );

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            match shutdown_signal().await {
                Ok(()) => trigger.cancel(),
                Err(e) => error!(error = %e, "failed to install signal handlers"),
            }
        });

        self.serve(listener, shutdown).await
    }

    /// Serves connections from `listener` until `shutdown` fires.
    ///
    /// Shutdown stops accepting; sessions already running are left to
    /// finish on their own tasks.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(active = active.load(Ordering::Relaxed), "shutting down, no longer accepting connections");
                    return Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let current = active.load(Ordering::Relaxed);
                            if current >= self.max_connections {
                                warn!(remote = %addr, max = self.max_connections, "connection rejected: limit reached");
                                continue;
                            }
                            let _ = stream.set_nodelay(true);

                            info!(remote = %addr, "connection accepted");
                            let handler = ConnectionHandler::new(Arc::clone(&self.ctx), Some(addr));
                            let ssh_config = Arc::clone(&self.ssh_config);
                            let counter = Arc::clone(&active);
                            counter.fetch_add(1, Ordering::Relaxed);

                            tokio::spawn(async move {
                                match ssh::run_stream(ssh_config, stream, handler).await {
                                    Ok(session) => {
                                        if let Err(e) = session.await {
                                            debug!(remote = %addr, error = %e, "connection ended with error");
                                        }
                                    }
                                    Err(e) => debug!(remote = %addr, error = %e, "ssh handshake failed"),
                                }
                                counter.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                        }
                    }
                }
            }
        }
    }
}

/// Loads the server's private host key.
pub fn load_host_key(path: &Path) -> Result<KeyPair> {
    russh_keys::load_secret_key(path, None).map_err(|e| Error::KeyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Resolves on SIGINT or SIGTERM (Ctrl-C elsewhere).
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("received Ctrl-C, initiating shutdown");
    }

    Ok(())
}

/// Splits an exec request into argv with POSIX shell quoting rules.
pub fn parse_command(raw: &[u8]) -> std::result::Result<Vec<String>, String> {
    let text = String::from_utf8_lossy(raw);
    shell_words::split(&text).map_err(|e| e.to_string())
}

// =============================================================================
// Connection Handler
// =============================================================================

/// Client input waiting to be written to a channel's stdin pipe.
struct StdinQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
}

impl StdinQueue {
    /// Spawns the task that drains the queue into `pipe`.
    fn spawn(pipe: DuplexStream, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        tokio::spawn(feed_stdin(rx, Arc::clone(&backlog), pipe, cancel));
        Self { tx, backlog }
    }

    /// Queues `data` without waiting. Returns false once the queue must be
    /// closed: the backlog limit is exceeded or the stdin pipe is gone.
    fn push(&self, data: &[u8]) -> bool {
        let queued = self.backlog.fetch_add(data.len(), Ordering::AcqRel) + data.len();
        if queued > STDIN_BACKLOG_LIMIT {
            warn!(queued, limit = STDIN_BACKLOG_LIMIT, "stdin backlog over limit, closing input");
            return false;
        }
        self.tx.send(data.to_vec()).is_ok()
    }
}

/// Writes queued input to the stdin pipe, then closes the pipe once the
/// queue ends (client EOF).
async fn feed_stdin(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
    mut pipe: DuplexStream,
    cancel: CancellationToken,
) {
    let forward = async {
        while let Some(chunk) = rx.recv().await {
            let written = pipe.write_all(&chunk).await;
            backlog.fetch_sub(chunk.len(), Ordering::AcqRel);
            if written.is_err() {
                return;
            }
        }
        let _ = pipe.shutdown().await;
    };
    tokio::select! {
        _ = forward => {}
        _ = cancel.cancelled() => {}
    }
}

/// Per-channel session state collected before the shell or exec request.
struct ChannelState {
    pty: Option<PtyRequest>,
    env: Vec<String>,
    stdin: Option<StdinQueue>,
    stdin_reader: Option<DuplexStream>,
    window_tx: Option<mpsc::Sender<WindowSize>>,
    cancel: CancellationToken,
    started: bool,
}

impl ChannelState {
    fn new() -> Self {
        let (stdin_writer, stdin_reader) = tokio::io::duplex(SESSION_PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        Self {
            pty: None,
            env: Vec::new(),
            stdin: Some(StdinQueue::spawn(stdin_writer, cancel.clone())),
            stdin_reader: Some(stdin_reader),
            window_tx: None,
            cancel,
            started: false,
        }
    }
}

/// russh handler for one client connection.
pub struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    remote_addr: Option<SocketAddr>,
    identity: Option<ContainerIdentity>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
    fn new(ctx: Arc<ServerContext>, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            remote_addr,
            identity: None,
            channels: HashMap::new(),
        }
    }

    /// Starts the command for `channel`. Returns false if the request must
    /// be refused.
    fn start(&mut self, channel: ChannelId, command: Vec<String>, session: &ssh::Session) -> bool {
        let Some(identity) = self.identity.clone() else {
            return false;
        };
        let Some(state) = self.channels.get_mut(&channel) else {
            return false;
        };
        if state.started {
            debug!(channel = ?channel, "second shell/exec request on channel refused");
            return false;
        }
        let Some(stdin) = state.stdin_reader.take() else {
            return false;
        };
        state.started = true;

        // The initial pty size is the first resize the exec sees.
        let window_changes: Option<WindowChanges> = match &state.pty {
            Some(pty) => {
                let (tx, rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
                let _ = tx.try_send(pty.size);
                state.window_tx = Some(tx);
                Some(rx)
            }
            None => None,
        };

        let bridge_session = Session {
            remote_addr: self.remote_addr,
            command,
            env: state.env.clone(),
            pty: state.pty.clone(),
            identity,
        };

        tokio::spawn(serve_channel(
            Arc::clone(&self.ctx),
            session.handle(),
            channel,
            bridge_session,
            stdin,
            window_changes,
            state.cancel.clone(),
        ));
        true
    }

    fn cancel_channel(&mut self, channel: ChannelId) {
        if let Some(state) = self.channels.remove(&channel) {
            state.cancel.cancel();
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for state in self.channels.values() {
            state.cancel.cancel();
        }
        info!(
            remote = ?self.remote_addr,
            container = ?self.identity.as_ref().map(ContainerIdentity::as_str),
            "connection closed"
        );
    }
}

#[async_trait]
impl ssh::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        let credential = Credential::new(public_key.clone());
        match self.ctx.resolver.resolve(&credential, self.remote_addr) {
            Resolution::Accepted(identity) => {
                info!(
                    remote = ?self.remote_addr,
                    user = %user,
                    container = %identity,
                    "public key accepted"
                );
                self.identity = Some(identity);
                Ok(Auth::Accept)
            }
            Resolution::Rejected => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut ssh::Session,
    ) -> Result<bool> {
        if self.identity.is_none() {
            return Ok(false);
        }
        debug!(remote = ?self.remote_addr, channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), ChannelState::new());
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut ssh::Session,
    ) -> Result<()> {
        match self.channels.get_mut(&channel) {
            Some(state) if !state.started => {
                state.pty = Some(PtyRequest {
                    term: term.to_string(),
                    size: WindowSize::from_ssh(col_width, row_height),
                });
                let _ = session.channel_success(channel);
            }
            _ => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut ssh::Session,
    ) -> Result<()> {
        match self.channels.get_mut(&channel) {
            Some(state) if !state.started => {
                state.env.push(format!("{variable_name}={variable_value}"));
                let _ = session.channel_success(channel);
            }
            _ => {
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut ssh::Session) -> Result<()> {
        if self.start(channel, Vec::new(), session) {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut ssh::Session,
    ) -> Result<()> {
        let command = match parse_command(data) {
            Ok(command) => command,
            Err(reason) => {
                warn!(remote = ?self.remote_addr, reason = %reason, "unparsable exec request refused");
                let _ = session.channel_failure(channel);
                return Ok(());
            }
        };
        if self.start(channel, command, session) {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut ssh::Session,
    ) -> Result<()> {
        debug!(remote = ?self.remote_addr, subsystem = %name, "subsystem refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut ssh::Session,
    ) -> Result<()> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        let size = WindowSize::from_ssh(col_width, row_height);
        if let Some(pty) = state.pty.as_mut() {
            pty.size = size;
        }
        if let Some(tx) = &state.window_tx {
            match tx.try_send(size) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(channel = ?channel, size = %size, "resize relay behind, window change dropped");
                }
                Err(TrySendError::Closed(_)) => state.window_tx = None,
            }
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut ssh::Session) -> Result<()> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if state.stdin.as_ref().is_some_and(|queue| !queue.push(data)) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut ssh::Session) -> Result<()> {
        // Dropping the queue lets the feeder close the pipe after the backlog.
        if let Some(state) = self.channels.get_mut(&channel) {
            state.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut ssh::Session) -> Result<()> {
        debug!(remote = ?self.remote_addr, channel = ?channel, "session channel closed");
        self.cancel_channel(channel);
        Ok(())
    }
}

// =============================================================================
// Channel Worker
// =============================================================================

async fn serve_channel(
    ctx: Arc<ServerContext>,
    handle: Handle,
    channel: ChannelId,
    session: Session,
    stdin: DuplexStream,
    window_changes: Option<WindowChanges>,
    cancel: CancellationToken,
) {
    info!(
        remote = ?session.remote_addr,
        container = %session.identity,
        command = ?session.command,
        tty = session.is_interactive(),
        "session started"
    );

    let ready = tokio::select! {
        result = ensure_running(ctx.runtime.as_ref(), &ctx.image, &session.identity) => result,
        _ = cancel.cancelled() => return,
    };
    if let Err(e) = ready {
        error!(container = %session.identity, error = %e, "failed to bring up container");
        let _ = handle
            .extended_data(channel, EXTENDED_DATA_STDERR, CryptoVec::from_slice(CONTAINER_UNAVAILABLE))
            .await;
        finish(&handle, channel, ExitStatus::UNKNOWN).await;
        return;
    }

    let (stdout, stdout_pipe) = tokio::io::duplex(SESSION_PIPE_CAPACITY);
    let (stderr, stderr_pipe) = tokio::io::duplex(SESSION_PIPE_CAPACITY);
    let pumps = [
        tokio::spawn(pump_to_channel(stdout_pipe, handle.clone(), channel, None)),
        tokio::spawn(pump_to_channel(
            stderr_pipe,
            handle.clone(),
            channel,
            Some(EXTENDED_DATA_STDERR),
        )),
    ];

    let io = SessionIo {
        stdin: Box::pin(stdin),
        stdout: Box::pin(stdout),
        stderr: Box::pin(stderr),
        window_changes,
        cancel,
    };
    let outcome = ctx.bridge.run(&session, io).await;

    for pump in pumps {
        let _ = pump.await;
    }

    if outcome.cancelled {
        info!(container = %session.identity, "client disconnected");
        return;
    }
    if let Some(e) = &outcome.error {
        error!(container = %session.identity, error = %e, "session failed");
    }
    info!(container = %session.identity, status = %outcome.status, "session finished");
    finish(&handle, channel, outcome.status).await;
}

/// Copies one output pipe to the channel until the pipe closes.
async fn pump_to_channel(
    mut pipe: DuplexStream,
    handle: Handle,
    channel: ChannelId,
    extended: Option<u32>,
) -> u64 {
    let mut buf = vec![0u8; CHANNEL_CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let delivered = match extended {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if delivered.is_err() {
            break;
        }
        sent += n as u64;
    }
    sent
}

async fn finish(handle: &Handle, channel: ChannelId, status: ExitStatus) {
    let _ = handle.exit_status_request(channel, status.wire_code()).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
