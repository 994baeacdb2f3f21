//! Container runtime trait - the compute-unit interface the bridge consumes.
//!
//! This trait covers exactly the operations the session bridge needs:
//! - `inspect` / `create` / `start`: idempotent lifecycle assurance
//! - `exec_create` / `exec_attach` / `exec_start`: one command invocation
//! - `exec_resize`: terminal dimension changes
//! - `subscribe_events`: exec completion notifications
//!
//! Nothing here removes, stops or kills a container. Lifecycle handling in
//! sshbox is additive only.

use crate::constants::{EXEC_DIE_EVENT, KEEPALIVE_COMMAND};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

// =============================================================================
// Container Types
// =============================================================================

/// Outcome of looking a container up by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerPresence {
    /// A container with that name exists (in any state).
    Present,
    /// No container with that name exists.
    Absent,
}

/// Creation parameters for a long-lived session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference (must already be present on the host).
    pub image: String,
    /// Foreground command keeping the container alive.
    pub command: Vec<String>,
    /// Keep stdin open and allow attaching to it.
    pub open_stdin: bool,
    /// Close stdin after the first attached client detaches.
    pub stdin_once: bool,
    /// Attach stdin.
    pub attach_stdin: bool,
    /// Attach stdout.
    pub attach_stdout: bool,
    /// Attach stderr.
    pub attach_stderr: bool,
}

impl ContainerSpec {
    /// Spec for a container that idles on [`KEEPALIVE_COMMAND`].
    pub fn keepalive(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: KEEPALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
            open_stdin: true,
            stdin_once: true,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
        }
    }
}

// =============================================================================
// Exec Types
// =============================================================================

/// Parameters for one command invocation inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Allocate a TTY.
    pub tty: bool,
    /// Attach stdin.
    pub attach_stdin: bool,
    /// Attach stdout.
    pub attach_stdout: bool,
    /// Attach stderr.
    pub attach_stderr: bool,
}

/// Runtime-assigned identifier of an exec instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecId(String);

impl ExecId {
    /// Wraps a runtime-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One decoded frame of exec output.
///
/// Non-TTY execs interleave stdout and stderr over one connection; the
/// runtime decodes that framing into tagged chunks. TTY execs produce raw
/// console bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Standard output frame.
    Stdout(Vec<u8>),
    /// Standard error frame.
    Stderr(Vec<u8>),
    /// Raw terminal bytes (TTY mode, stdout and stderr merged).
    Console(Vec<u8>),
}

impl OutputChunk {
    /// Returns the payload regardless of channel.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Stdout(b) | Self::Stderr(b) | Self::Console(b) => b,
        }
    }
}

/// Decoded exec output.
pub type OutputStream = Pin<Box<dyn Stream<Item = io::Result<OutputChunk>> + Send>>;

/// Exec stdin. `shutdown()` closes the write side only.
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Duplex stream attached to an exec.
pub struct ExecStream {
    /// Output read side.
    pub output: OutputStream,
    /// Input write side.
    pub input: InputSink,
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream").finish_non_exhaustive()
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Columns.
    pub width: u16,
    /// Rows.
    pub height: u16,
}

impl WindowSize {
    /// Builds a size from SSH's 32-bit dimensions, saturating at `u16::MAX`.
    pub fn from_ssh(width: u32, height: u32) -> Self {
        Self {
            width: u16::try_from(width).unwrap_or(u16::MAX),
            height: u16::try_from(height).unwrap_or(u16::MAX),
        }
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Container name or id.
    pub container: String,
    /// Event action, e.g. `exec_die`.
    pub action: String,
}

impl EventFilter {
    /// Filter for exec completions in one container.
    pub fn exec_die(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            action: EXEC_DIE_EVENT.to_string(),
        }
    }
}

/// A runtime event delivered to a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Container the event concerns.
    pub container: String,
    /// Event action.
    pub action: String,
    /// Actor attributes (`exitCode`, `execID`, ...).
    pub attributes: HashMap<String, String>,
}

/// Live event subscription: one channel of events and one of errors.
///
/// Dropping the subscription ends it.
#[derive(Debug)]
pub struct EventSubscription {
    /// Matching events.
    pub events: mpsc::Receiver<RuntimeEvent>,
    /// Stream failures. At most one error is delivered.
    pub errors: mpsc::Receiver<Error>,
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Compute-unit runtime interface.
///
/// # Lifecycle
///
/// ```text
/// inspect(id) → [create(id, spec)] → start(id)
///     → exec_create → subscribe_events → exec_attach → exec_start
///     → [exec_resize ...] → exec_die event
/// ```
///
/// # Implementations
///
/// - `DockerRuntime`: Docker Engine API via bollard
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Looks a container up by name.
    async fn inspect(&self, id: &str) -> Result<ContainerPresence>;

    /// Creates a container named `id`. Does not start it.
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<()>;

    /// Starts a container. Starting a running container succeeds.
    async fn start(&self, id: &str) -> Result<()>;

    /// Creates an exec instance inside a running container.
    async fn exec_create(&self, id: &str, spec: &ExecSpec) -> Result<ExecId>;

    /// Attaches a duplex stream to an exec.
    ///
    /// A backend may start the exec's process here (Docker's hijacked
    /// exec start does), so callers subscribe to events before attaching.
    async fn exec_attach(&self, exec: &ExecId, tty: bool) -> Result<ExecStream>;

    /// Makes sure the exec's process is running.
    ///
    /// Starts it for backends that separate attach from start. Backends
    /// that started it at attach only confirm the exec exists.
    async fn exec_start(&self, exec: &ExecId, tty: bool) -> Result<()>;

    /// Resizes the exec's terminal.
    async fn exec_resize(&self, exec: &ExecId, size: WindowSize) -> Result<()>;

    /// Subscribes to events matching `filter`.
    ///
    /// The subscription must be live when this returns: events emitted
    /// after the call returns are delivered.
    async fn subscribe_events(&self, filter: &EventFilter) -> Result<EventSubscription>;
}
