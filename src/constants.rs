//! # sshbox Constants
//!
//! Defaults, wire names and bounds shared by the session bridge, the
//! lifecycle assurer and the SSH front end. These constants are the
//! **single source of truth** for values that must agree across modules
//! (event names the resolver filters on, the sentinel status the server
//! reports, the identity prefix wildcard mode derives names from).
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Uses the `DEFAULT_*` values for CLI defaults
//! - [`crate::identity`]: Uses [`WILDCARD_PREFIX`] and [`MAX_AUTHORIZED_KEYS`]
//! - [`crate::lifecycle`]: Uses [`KEEPALIVE_COMMAND`]
//! - [`crate::bridge`]: Uses event names, attribute keys and relay sizes
//! - [`crate::server`]: Uses connection limits and [`UNKNOWN_EXIT_WIRE_CODE`]

use std::time::Duration;

// =============================================================================
// Process Defaults
// =============================================================================

/// Image used for new containers when `--image` is not given.
///
/// The image must already be present on the Docker host; pulling is out of
/// scope.
pub const DEFAULT_IMAGE: &str = "ubuntu";

/// Shell started when the client connects without a command.
pub const DEFAULT_SHELL: &str = "/bin/bash";

/// Address the SSH listener binds to by default.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2222";

/// Default cap on concurrently served connections.
///
/// **Security**: Each connection holds a container exec, two relay tasks and
/// an event subscription against the Docker daemon. Bounding connections
/// bounds the load a single client can put on the daemon.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

// =============================================================================
// Identity
// =============================================================================

/// Prefix of container names derived from key fingerprints in wildcard mode.
pub const WILDCARD_PREFIX: &str = "wildcard";

/// Maximum number of entries accepted from an authorized-keys file.
///
/// **Security**: The allow-list is scanned in full on every authentication
/// attempt, so its size bounds per-attempt CPU cost.
pub const MAX_AUTHORIZED_KEYS: usize = 4096;

/// Maximum container name length accepted from an authorized-keys comment.
///
/// Matches the practical limit of Docker container names.
pub const MAX_CONTAINER_NAME_LEN: usize = 128;

// =============================================================================
// Container Lifecycle
// =============================================================================

/// Foreground command of every container created by sshbox.
///
/// Keeps the container alive independently of any exec session.
pub const KEEPALIVE_COMMAND: &[&str] = &["/usr/bin/tail", "-f", "/dev/null"];

// =============================================================================
// Exec Events
// =============================================================================

/// Docker event type filter key.
pub const EVENT_FILTER_CONTAINER: &str = "container";

/// Docker event action filter key.
pub const EVENT_FILTER_EVENT: &str = "event";

/// Event action emitted when an exec process exits.
pub const EXEC_DIE_EVENT: &str = "exec_die";

/// Event attribute carrying the exit code of the exec process.
pub const EXIT_CODE_ATTRIBUTE: &str = "exitCode";

/// Event attribute carrying the exec identifier.
pub const EXEC_ID_ATTRIBUTE: &str = "execID";

/// Capacity of the per-subscription event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

// =============================================================================
// Exit Status
// =============================================================================

/// Exit status value before (or without) authoritative resolution.
pub const EXIT_STATUS_UNKNOWN: i32 = -1;

/// Exit status sent to the SSH client when the real status is unknown.
///
/// Matches what OpenSSH reports when the remote side vanishes.
pub const UNKNOWN_EXIT_WIRE_CODE: u32 = 255;

// =============================================================================
// Relay Sizing
// =============================================================================

/// Buffer size of the in-process pipes between the SSH channel and relays.
pub const SESSION_PIPE_CAPACITY: usize = 64 * 1024;

/// Chunk size used when pumping output pipes to the SSH channel.
pub const CHANNEL_CHUNK_SIZE: usize = 32 * 1024;

/// Capacity of the per-session window-change channel.
pub const RESIZE_CHANNEL_CAPACITY: usize = 8;

/// Client input a channel may queue ahead of its command.
///
/// Input is handed off without waiting on the command, so a command that
/// never reads stdin cannot stall the connection. Past this many unread
/// bytes the command's stdin is closed instead.
pub const STDIN_BACKLOG_LIMIT: usize = 4 * 1024 * 1024;

// =============================================================================
// Timeouts
// =============================================================================

/// Delay after a rejected authentication attempt.
///
/// **Security**: Slows down key-scanning clients. Applied identically to
/// every rejection so timing does not reveal why a key was refused.
pub const AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);
