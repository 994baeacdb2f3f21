//! Process configuration.
//!
//! Everything the server needs is resolved once at startup into a
//! [`Config`] value and shared read-only with every session worker. The
//! bridge never reads flags, environment or files itself.

use crate::constants::{DEFAULT_IMAGE, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_CONNECTIONS, DEFAULT_SHELL};
use crate::error::{Error, Result};
use crate::identity::{IdentityMap, IdentityResolver};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

/// Command line of the `sshbox` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "sshbox", version, about = "SSH into your own persistent container")]
pub struct Cli {
    /// Image to use for new containers (must already be pulled).
    #[arg(short = 'i', long, env = "SSHBOX_IMAGE", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Shell to run when the client does not send a command.
    #[arg(short = 's', long, env = "SSHBOX_SHELL", default_value = DEFAULT_SHELL)]
    pub shell: String,

    /// Address and port to listen on.
    #[arg(short = 'a', long, env = "SSHBOX_ADDRESS", default_value = DEFAULT_LISTEN_ADDR)]
    pub address: String,

    /// Path to the SSH host private key.
    #[arg(short = 'k', long, env = "SSHBOX_HOST_KEY")]
    pub host_key_path: PathBuf,

    /// Path to the authorized keys file; each key's comment names its container.
    #[arg(short = 'u', long, env = "SSHBOX_AUTHORIZED_KEYS")]
    pub authorized_keys_path: Option<PathBuf>,

    /// Allow ANY public key to connect, each to its own container. Be careful.
    #[arg(long, env = "SSHBOX_WILDCARD")]
    pub wildcard: bool,

    /// Maximum number of concurrent connections.
    #[arg(long, env = "SSHBOX_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Disconnect clients idle for this many seconds.
    #[arg(long, env = "SSHBOX_INACTIVITY_TIMEOUT_SECS")]
    pub inactivity_timeout_secs: Option<u64>,

    /// Log output format.
    #[arg(long, value_enum, env = "SSHBOX_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

/// Immutable server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Image for newly created containers.
    pub image: String,
    /// Default shell for sessions without a command.
    pub shell: String,
    /// Listen address (`host:port`).
    pub listen_addr: String,
    /// Host key file.
    pub host_key_path: PathBuf,
    /// Authorized keys file (allow-list mode).
    pub authorized_keys_path: Option<PathBuf>,
    /// Accept any key.
    pub wildcard: bool,
    /// Connection cap.
    pub max_connections: usize,
    /// Idle disconnect.
    pub inactivity_timeout: Option<Duration>,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Checks invariants that flag parsing cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::InvalidConfig("image must not be empty".to_string()));
        }
        if !self.shell.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "shell must be an absolute path, got '{}'",
                self.shell
            )));
        }
        if !self.wildcard && self.authorized_keys_path.is_none() {
            return Err(Error::InvalidConfig(
                "--authorized-keys-path is required unless --wildcard is set".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the identity resolver for this configuration.
    ///
    /// Wildcard mode ignores any authorized keys file.
    pub fn identity_resolver(&self) -> Result<IdentityResolver> {
        if self.wildcard {
            return Ok(IdentityResolver::Wildcard);
        }
        let path = self.authorized_keys_path.as_deref().ok_or_else(|| {
            Error::InvalidConfig("no authorized keys file configured".to_string())
        })?;
        Ok(IdentityResolver::AllowList(IdentityMap::load(path)?))
    }
}

impl TryFrom<Cli> for Config {
    type Error = Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let config = Self {
            image: cli.image,
            shell: cli.shell,
            listen_addr: cli.address,
            host_key_path: cli.host_key_path,
            authorized_keys_path: cli.authorized_keys_path,
            wildcard: cli.wildcard,
            max_connections: cli.max_connections,
            inactivity_timeout: cli.inactivity_timeout_secs.map(Duration::from_secs),
            log_format: cli.log_format,
        };
        config.validate()?;
        Ok(config)
    }
}
