//! Error types for the session bridge.

use std::path::PathBuf;

/// Result type alias for sshbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Container Lifecycle Errors
    // =========================================================================
    /// Container inspection failed for a reason other than absence.
    #[error("failed to inspect container '{id}': {reason}")]
    InspectFailed { id: String, reason: String },

    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    // =========================================================================
    // Exec Errors
    // =========================================================================
    /// Exec creation failed.
    #[error("failed to create exec in container '{container}': {reason}")]
    ExecCreateFailed { container: String, reason: String },

    /// Attaching to the exec stream failed.
    #[error("failed to attach to exec {exec}: {reason}")]
    ExecAttachFailed { exec: String, reason: String },

    /// Starting the exec failed.
    #[error("failed to start exec {exec}: {reason}")]
    ExecStartFailed { exec: String, reason: String },

    /// Resizing the exec terminal failed.
    #[error("failed to resize exec {exec}: {reason}")]
    ExecResizeFailed { exec: String, reason: String },

    // =========================================================================
    // Stream Errors
    // =========================================================================
    /// A relay between the session and the exec stream failed.
    #[error("{direction} relay failed: {source}")]
    Relay {
        direction: RelayDirection,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Event Errors
    // =========================================================================
    /// The event stream reported an error before the exec completed.
    #[error("event stream failed: {0}")]
    EventStream(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration value rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Authorized-keys line could not be parsed.
    #[error("{path}:{line}: invalid authorized key: {reason}")]
    InvalidAuthorizedKey {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Key file could not be loaded.
    #[error("failed to load key file {path}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// SSH protocol error.
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// The client disconnected before the session finished.
    #[error("session cancelled by client disconnect")]
    Cancelled,
}

impl Error {
    /// Returns true for client-initiated termination.
    ///
    /// Cancellation ends a session normally and is never reported as a
    /// failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Which way a relay copies bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// Session to exec stdin.
    Input,
    /// Exec stdout/stderr to session.
    Output,
}

impl std::fmt::Display for RelayDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}
