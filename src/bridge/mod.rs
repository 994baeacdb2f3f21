//! # Exec Bridge
//!
//! Runs one SSH session's command inside its container and relays I/O
//! between the two until the command exits.
//!
//! ## Flow
//!
//! ```text
//!  exec_create ──► subscribe(exec_die) ──► exec_attach ──► exec_start
//!                                              │               │
//!          ┌───────────────────────────────────┤               ├── resize relay (TTY only)
//!          ▼                                   ▼               ▼
//!    input relay                         output relay     exit resolver
//!  session ─► exec stdin              exec ─► session     (event race)
//!  (EOF ⇒ close write side)          (publishes result)        │
//!                                              │               │
//!                                              └──── join ◄────┘
//!                                                     │
//!                                            BridgeOutcome{status, error}
//! ```
//!
//! The event subscription is opened before the exec is attached: with
//! runtimes where attaching starts the process (Docker), a fast command
//! could otherwise exit before anyone listens for its completion.
//!
//! ## Ordering
//!
//! Once the exit status is resolved, the bridge returns only after the
//! output relay has finished, so every byte the command produced is handed
//! to the session before the session learns the exit status. A failed event
//! stream ends the bridge at once with an unknown status. Input relay
//! completion is not ordered against command exit.
//!
//! ## Cancellation
//!
//! The session's [`CancellationToken`] fires when the client disconnects.
//! Every wait in the bridge observes it, and the resulting
//! [`Error::Cancelled`] is swallowed: the outcome carries no error and an
//! unknown status.

pub mod exit;
pub mod relay;
pub mod resize;

pub use exit::{ExitOutcome, ExitResolver, ExitStatus};
pub use relay::{RelayMode, relay_input, relay_output};
pub use resize::{WindowChanges, relay_resizes};

use crate::error::{Error, RelayDirection, Result};
use crate::identity::ContainerIdentity;
use crate::runtime::{ContainerRuntime, EventFilter, ExecSpec, ExecStream, WindowSize};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// Session
// =============================================================================

/// Terminal requested by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// `TERM` value sent by the client.
    pub term: String,
    /// Initial size.
    pub size: WindowSize,
}

/// What the client asked for on one SSH session channel.
#[derive(Debug, Clone)]
pub struct Session {
    /// Client address.
    pub remote_addr: Option<SocketAddr>,
    /// Requested command; empty means the default shell.
    pub command: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Terminal, if the client requested one.
    pub pty: Option<PtyRequest>,
    /// Container the session runs in.
    pub identity: ContainerIdentity,
}

impl Session {
    /// Creates a session with no command, environment or terminal.
    pub fn new(identity: ContainerIdentity) -> Self {
        Self {
            remote_addr: None,
            command: Vec::new(),
            env: Vec::new(),
            pty: None,
            identity,
        }
    }

    /// True if the client requested a terminal.
    pub fn is_interactive(&self) -> bool {
        self.pty.is_some()
    }
}

/// Session input.
pub type SessionReader = Pin<Box<dyn AsyncRead + Send>>;

/// Session output channel.
pub type SessionWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// The session's byte streams and control signals, owned by the bridge.
pub struct SessionIo {
    /// Client input.
    pub stdin: SessionReader,
    /// Client stdout.
    pub stdout: SessionWriter,
    /// Client stderr.
    pub stderr: SessionWriter,
    /// Window-size notifications; only consumed for TTY sessions.
    pub window_changes: Option<WindowChanges>,
    /// Fires on client disconnect.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo")
            .field("window_changes", &self.window_changes.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Result of bridging one session.
#[derive(Debug)]
pub struct BridgeOutcome {
    /// Resolved exit status, unknown if never resolved.
    pub status: ExitStatus,
    /// Failure to report; never set for client disconnects.
    pub error: Option<Error>,
    /// True if the client disconnected before completion.
    pub cancelled: bool,
}

impl BridgeOutcome {
    fn finish(status: ExitStatus, error: Option<Error>, cancel: &CancellationToken) -> Self {
        let cancelled = cancel.is_cancelled() || error.as_ref().is_some_and(Error::is_cancellation);
        Self {
            status,
            error: if cancelled { None } else { error },
            cancelled,
        }
    }

    /// Converts into a `Result`, dropping the status on failure.
    pub fn into_result(self) -> Result<ExitStatus> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.status),
        }
    }
}

/// Aborts the relay tasks of a session when dropped.
#[derive(Default)]
struct RelayTasks(Vec<JoinHandle<()>>);

impl RelayTasks {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }
}

impl Drop for RelayTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

// =============================================================================
// Exec Bridge
// =============================================================================

/// Bridges SSH sessions to execs in their containers.
#[derive(Clone)]
pub struct ExecBridge {
    runtime: Arc<dyn ContainerRuntime>,
    shell: String,
}

impl ExecBridge {
    /// Creates a bridge running `shell` for sessions without a command.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, shell: impl Into<String>) -> Self {
        Self {
            runtime,
            shell: shell.into(),
        }
    }

    /// The session's command, or the default shell.
    pub fn command_for(&self, session: &Session) -> Vec<String> {
        if session.command.is_empty() {
            vec![self.shell.clone()]
        } else {
            session.command.clone()
        }
    }

    /// Exec parameters for a session.
    ///
    /// A TTY session gets `TERM` from its pty request unless the client
    /// already set one.
    pub fn exec_spec(&self, session: &Session) -> ExecSpec {
        let mut env = session.env.clone();
        if let Some(pty) = &session.pty {
            let has_term = env.iter().any(|kv| kv.starts_with("TERM="));
            if !has_term && !pty.term.is_empty() {
                env.push(format!("TERM={}", pty.term));
            }
        }
        ExecSpec {
            command: self.command_for(session),
            env,
            tty: session.is_interactive(),
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
        }
    }

    /// Runs the session's command to completion.
    pub async fn run(&self, session: &Session, io: SessionIo) -> BridgeOutcome {
        let cancel = io.cancel.clone();
        let (status, error) = match self.bridge(session, io).await {
            Ok(status) => (status, None),
            Err((status, error)) => (status, Some(error)),
        };
        let outcome = BridgeOutcome::finish(status, error, &cancel);
        debug!(
            container = %session.identity,
            status = %outcome.status,
            cancelled = outcome.cancelled,
            "bridge finished"
        );
        outcome
    }

    async fn bridge(
        &self,
        session: &Session,
        io: SessionIo,
    ) -> std::result::Result<ExitStatus, (ExitStatus, Error)> {
        let unknown = |e: Error| (ExitStatus::UNKNOWN, e);
        let container = session.identity.as_str();
        let tty = session.is_interactive();
        let spec = self.exec_spec(session);

        let exec = self.runtime.exec_create(container, &spec).await.map_err(unknown)?;
        info!(
            container = %session.identity,
            exec = %exec,
            command = ?spec.command,
            tty,
            "exec created"
        );

        let mut subscription = self
            .runtime
            .subscribe_events(&EventFilter::exec_die(container))
            .await
            .map_err(unknown)?;

        let ExecStream { output, input } = self.runtime.exec_attach(&exec, tty).await.map_err(unknown)?;
        let SessionIo {
            stdin,
            stdout,
            stderr,
            window_changes,
            cancel,
        } = io;

        let mut tasks = RelayTasks::default();
        tasks.push(tokio::spawn(async move {
            match relay_input(stdin, input).await {
                Ok(bytes) => debug!(bytes, "input relay finished"),
                Err(e) => debug!(error = %e, "input relay failed"),
            }
        }));

        let (output_done, output_result) = oneshot::channel::<Result<u64>>();
        tasks.push(tokio::spawn(async move {
            let result = relay_output(RelayMode::for_tty(tty), output, stdout, stderr).await;
            let _ = output_done.send(result);
        }));

        self.runtime.exec_start(&exec, tty).await.map_err(unknown)?;

        if tty {
            if let Some(changes) = window_changes {
                let runtime = Arc::clone(&self.runtime);
                let exec = exec.clone();
                tasks.push(tokio::spawn(async move {
                    relay_resizes(runtime, exec, changes).await;
                }));
            }
        }

        let resolver = ExitResolver::new(session.identity.clone(), exec);
        let status = match resolver.resolve(&mut subscription, &cancel).await {
            ExitOutcome::Resolved(status) => status,
            // Relays are aborted when `tasks` drops.
            ExitOutcome::Failed(error) => return Err((ExitStatus::UNKNOWN, error)),
        };
        drop(subscription);

        // Output must be fully delivered before the session hears the status.
        let output = tokio::select! {
            result = output_result => result.unwrap_or_else(|_| {
                Err(Error::Relay {
                    direction: RelayDirection::Output,
                    source: std::io::Error::other("output relay stopped without a result"),
                })
            }),
            _ = cancel.cancelled() => Err(Error::Cancelled),
        };

        match output {
            Ok(bytes) => {
                debug!(container = %session.identity, bytes, "output drained");
                Ok(status)
            }
            Err(error) => Err((status, error)),
        }
    }
}

impl std::fmt::Debug for ExecBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBridge")
            .field("runtime", &self.runtime.name())
            .field("shell", &self.shell)
            .finish()
    }
}
