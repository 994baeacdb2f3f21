//! Lifecycle assurance - make sure a session's container exists and runs.
//!
//! ```text
//!   absent  ──create──► created ──start──► running
//!   stopped ─────────────────────start──► running
//!   running ─────────────────────start──► running   (no-op)
//! ```
//!
//! Assurance is additive only: an existing container is reused as-is, even
//! if it was created from a different image, and nothing is ever stopped
//! or removed.

use crate::error::Result;
use crate::identity::ContainerIdentity;
use crate::runtime::{ContainerPresence, ContainerRuntime, ContainerSpec};
use tracing::{debug, info};

/// Ensures the container named `identity` exists and is running.
///
/// Creates it from `image` with the keep-alive command if absent, then
/// always issues a start. Creation and start failures are returned as-is;
/// nothing is retried.
pub async fn ensure_running(
    runtime: &dyn ContainerRuntime,
    image: &str,
    identity: &ContainerIdentity,
) -> Result<()> {
    let id = identity.as_str();

    if runtime.inspect(id).await? == ContainerPresence::Absent {
        info!(container = %identity, image = %image, "creating container");
        runtime.create(id, &ContainerSpec::keepalive(image)).await?;
    }

    runtime.start(id).await?;
    debug!(container = %identity, runtime = runtime.name(), "container running");
    Ok(())
}
