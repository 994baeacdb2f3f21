//! Terminal resize relay.

use crate::runtime::{ContainerRuntime, ExecId, WindowSize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Live sequence of window-size notifications for one session.
///
/// The SSH side pushes the initial pty size first, then every
/// `window-change` request. The sequence ends when the session closes.
pub type WindowChanges = mpsc::Receiver<WindowSize>;

/// Forwards each notification to the exec, in order.
///
/// Stops at the end of the sequence or at the first failed resize. A failed
/// resize only degrades the display, so it is logged and not returned.
/// Returns the number of resizes forwarded.
pub async fn relay_resizes(
    runtime: Arc<dyn ContainerRuntime>,
    exec: ExecId,
    mut changes: WindowChanges,
) -> usize {
    let mut forwarded = 0;
    while let Some(size) = changes.recv().await {
        if let Err(e) = runtime.exec_resize(&exec, size).await {
            warn!(exec = %exec, size = %size, error = %e, "resize failed, no longer forwarding");
            break;
        }
        forwarded += 1;
    }
    debug!(exec = %exec, forwarded, "resize relay finished");
    forwarded
}
