//! sshbox - SSH into your own persistent container
//!
//! ## Usage
//!
//! ```sh
//! sshbox -k /etc/sshbox/host_ed25519 -u /etc/sshbox/authorized_keys
//! sshbox -k host_key --wildcard -i alpine -s /bin/sh -a 127.0.0.1:2022
//! ```
//!
//! Each line of the authorized keys file names its container in the comment
//! field. With `--wildcard` any key is accepted and gets a container named
//! after its fingerprint.
//!
//! ## Logging
//!
//! Filtered by `RUST_LOG` (default `info`). `--log-format json` switches to
//! one JSON object per line.

use anyhow::Context;
use clap::Parser;
use sshbox::{Cli, Config, DockerRuntime, LogFormat, Server};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to set tracing subscriber: {e}"))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let runtime = DockerRuntime::connect().context("docker client")?;
    let server = Server::new(&config, Arc::new(runtime)).context("server setup")?;
    server.run().await.context("ssh server")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_format = cli.log_format;

    if let Err(e) = init_tracing(log_format) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    let config = match Config::try_from(cli) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        image = %config.image,
        shell = %config.shell,
        "sshbox starting"
    );

    match run(config).await {
        Ok(()) => {
            info!("sshbox stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "sshbox failed");
            ExitCode::FAILURE
        }
    }
}
