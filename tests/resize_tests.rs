//! Tests for the terminal resize relay.

mod common;

use common::{Behavior, FakeRuntime};
use sshbox::bridge::relay_resizes;
use sshbox::runtime::{ContainerRuntime, ExecId, WindowSize};
use std::sync::Arc;
use tokio::sync::mpsc;

fn size(width: u16, height: u16) -> WindowSize {
    WindowSize { width, height }
}

fn as_dyn(runtime: &FakeRuntime) -> Arc<dyn ContainerRuntime> {
    Arc::new(runtime.clone())
}

// =============================================================================
// Forwarding
// =============================================================================

#[tokio::test]
async fn test_forwards_every_size_in_order() {
    let runtime = FakeRuntime::new();
    let (tx, rx) = mpsc::channel(8);
    for s in [size(80, 24), size(100, 30), size(132, 43)] {
        tx.send(s).await.unwrap();
    }
    drop(tx);

    let forwarded = relay_resizes(as_dyn(&runtime), ExecId::new("exec-1"), rx).await;

    assert_eq!(forwarded, 3);
    assert_eq!(runtime.resizes(), vec![size(80, 24), size(100, 30), size(132, 43)]);
    assert_eq!(runtime.calls()[0], "exec_resize:exec-1:80x24");
}

#[tokio::test]
async fn test_ends_with_notification_sequence() {
    let runtime = FakeRuntime::new();
    let (tx, rx) = mpsc::channel::<WindowSize>(8);
    drop(tx);

    let forwarded = relay_resizes(as_dyn(&runtime), ExecId::new("exec-1"), rx).await;
    assert_eq!(forwarded, 0);
    assert!(runtime.calls().is_empty());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_stops_at_first_failed_resize() {
    let runtime = FakeRuntime::with_behavior(Behavior {
        fail_resize_after: Some(1),
        ..Default::default()
    });
    let (tx, rx) = mpsc::channel(8);
    for s in [size(80, 24), size(100, 30), size(132, 43)] {
        tx.send(s).await.unwrap();
    }

    // The sender stays open: the relay must stop on the failure alone.
    let forwarded = relay_resizes(as_dyn(&runtime), ExecId::new("exec-1"), rx).await;

    assert_eq!(forwarded, 1);
    assert_eq!(runtime.count_calls("exec_resize:"), 2);
    assert!(tx.is_closed());
}

#[test]
fn test_ssh_dimensions_saturate() {
    assert_eq!(WindowSize::from_ssh(200, 50), size(200, 50));
    assert_eq!(WindowSize::from_ssh(u32::MAX, 1), size(u16::MAX, 1));
}
