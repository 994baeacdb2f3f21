//! # sshbox
//!
//! **SSH Sessions Bridged into Per-Key Containers**
//!
//! sshbox is an SSH server that gives every authenticated public key its own
//! long-lived container. A plain login drops the client into a shell inside
//! that container; `ssh host cmd` runs `cmd` there. The container outlives
//! the session, so the next login finds everything where it was left.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              sshbox                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  server          russh handler, accept loop, per-channel workers    │
//! │     │                                                               │
//! │     ├─► identity   public key → container name (allow-list or       │
//! │     │              wildcard fingerprint)                            │
//! │     ├─► lifecycle  inspect → [create] → start  (additive only)      │
//! │     └─► bridge     exec create/attach/start, I/O relays,            │
//! │                    resize relay, exit resolution via exec_die       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                    ContainerRuntime trait                           │
//! │  ┌──────────────────────────┐                                       │
//! │  │ DockerRuntime (bollard)  │                                       │
//! │  └──────────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Session Lifecycle
//!
//! ```text
//!   connect ─► auth_publickey ─► resolve identity ─► ensure_running
//!           ─► exec_create ─► subscribe(exec_die) ─► attach ─► start
//!           ─► relay until exec_die ─► drain output ─► exit-status ─► close
//! ```
//!
//! # Security Model
//!
//! - **Public keys only**: no password or keyboard-interactive auth.
//! - **Uniform rejection**: the allow-list is scanned in full and rejected
//!   keys are logged by fingerprint only.
//! - **Additive lifecycle**: containers are created and started, never
//!   stopped or removed.
//! - **Bounded load**: connection cap (`--max-connections`) and a fixed
//!   delay on rejected authentication.
//!
//! # Example
//!
//! ```rust,ignore
//! use sshbox::{Config, DockerRuntime, Server};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config: Config = /* from sshbox::config::Cli */;
//!     let runtime = Arc::new(DockerRuntime::connect()?);
//!     Server::new(&config, runtime)?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod constants;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod runtime;
pub mod server;

pub mod runtimes;

// Re-exports
pub use bridge::{BridgeOutcome, ExecBridge, ExitStatus, PtyRequest, Session, SessionIo};
pub use config::{Cli, Config, LogFormat};
pub use constants::*;
pub use error::{Error, Result};
pub use identity::{ContainerIdentity, Credential, IdentityMap, IdentityResolver, Resolution};
pub use lifecycle::ensure_running;
pub use runtime::{
    ContainerPresence, ContainerRuntime, ContainerSpec, EventFilter, EventSubscription, ExecId,
    ExecSpec, ExecStream, OutputChunk, RuntimeEvent, WindowSize,
};
pub use runtimes::DockerRuntime;
pub use server::Server;
