//! Exit status resolution.
//!
//! The exit code of an exec is learned from the runtime's `exec_die` event,
//! raced against failures of the event stream itself:
//!
//! ```text
//!                ┌── error on error channel ──► Failed(error), status unknown
//!   Waiting ─────┤
//!                └── matching exec_die event ──► Resolved(exitCode attribute)
//! ```
//!
//! Whichever arrives first wins. The status is never guessed: a missing or
//! unparsable `exitCode` attribute resolves to [`ExitStatus::UNKNOWN`].
//!
//! # Event Matching
//!
//! Events are filtered by container on subscription. When an event also
//! carries an `execID` attribute, it must name this exec; completions of
//! other execs in the same container are skipped. Events without `execID`
//! cannot be told apart and are accepted for any exec in the container.

use crate::constants::{EXEC_ID_ATTRIBUTE, EXIT_CODE_ATTRIBUTE, EXIT_STATUS_UNKNOWN, UNKNOWN_EXIT_WIRE_CODE};
use crate::error::Error;
use crate::identity::ContainerIdentity;
use crate::runtime::{EventSubscription, ExecId, RuntimeEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Exit Status
// =============================================================================

/// Numeric completion status of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus(i32);

impl ExitStatus {
    /// Status before or without authoritative resolution.
    pub const UNKNOWN: Self = Self(EXIT_STATUS_UNKNOWN);

    /// Wraps an exit code.
    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    /// Parses an event's `exitCode` attribute. Garbage yields unknown.
    pub fn from_attribute(value: &str) -> Self {
        match value.trim().parse::<i32>() {
            Ok(code) if code >= 0 => Self(code),
            _ => Self::UNKNOWN,
        }
    }

    /// Returns true once resolved.
    pub fn is_known(&self) -> bool {
        self.0 != EXIT_STATUS_UNKNOWN
    }

    /// Exit code, if known.
    pub fn code(&self) -> Option<i32> {
        self.is_known().then_some(self.0)
    }

    /// Value for an SSH `exit-status` message. Unknown maps to 255.
    pub fn wire_code(&self) -> u32 {
        self.code()
            .and_then(|code| u32::try_from(code).ok())
            .unwrap_or(UNKNOWN_EXIT_WIRE_CODE)
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code() {
            Some(code) => write!(f, "{}", code),
            None => write!(f, "unknown"),
        }
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Terminal state of an exit resolution.
#[derive(Debug)]
pub enum ExitOutcome {
    /// A completion event arrived.
    Resolved(ExitStatus),
    /// The event stream failed, ended, or the session was cancelled first.
    Failed(Error),
}

impl ExitOutcome {
    /// Status carried by the outcome (unknown on failure).
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::Resolved(status) => *status,
            Self::Failed(_) => ExitStatus::UNKNOWN,
        }
    }
}

/// Waits for the completion of one exec.
#[derive(Debug, Clone)]
pub struct ExitResolver {
    container: ContainerIdentity,
    exec: ExecId,
}

impl ExitResolver {
    /// Creates a resolver for `exec` running in `container`.
    pub fn new(container: ContainerIdentity, exec: ExecId) -> Self {
        Self { container, exec }
    }

    /// True if `event` reports this exec's completion.
    pub fn matches(&self, event: &RuntimeEvent) -> bool {
        if event.container != self.container.as_str() {
            return false;
        }
        match event.attributes.get(EXEC_ID_ATTRIBUTE) {
            Some(exec_id) => exec_id == self.exec.as_str(),
            None => true,
        }
    }

    /// Races the subscription's event and error channels.
    ///
    /// Cancellation of `cancel` fails the resolution with
    /// [`Error::Cancelled`].
    pub async fn resolve(
        &self,
        subscription: &mut EventSubscription,
        cancel: &CancellationToken,
    ) -> ExitOutcome {
        let mut errors_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return ExitOutcome::Failed(Error::Cancelled),

                error = subscription.errors.recv(), if errors_open => match error {
                    Some(error) => return ExitOutcome::Failed(error),
                    None => errors_open = false,
                },

                event = subscription.events.recv() => match event {
                    Some(event) if self.matches(&event) => {
                        let status = event
                            .attributes
                            .get(EXIT_CODE_ATTRIBUTE)
                            .map(|v| ExitStatus::from_attribute(v))
                            .unwrap_or(ExitStatus::UNKNOWN);
                        debug!(container = %self.container, exec = %self.exec, status = %status, "exec exited");
                        return ExitOutcome::Resolved(status);
                    }
                    Some(event) => {
                        debug!(
                            container = %self.container,
                            exec = %self.exec,
                            action = %event.action,
                            "ignoring event for another exec"
                        );
                    }
                    None => {
                        return ExitOutcome::Failed(Error::EventStream(
                            "event stream ended before exec completed".to_string(),
                        ));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn die_event(container: &str, attrs: &[(&str, &str)]) -> RuntimeEvent {
        RuntimeEvent {
            container: container.to_string(),
            action: "exec_die".to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    fn resolver() -> ExitResolver {
        ExitResolver::new(ContainerIdentity::new("alice"), ExecId::new("exec-1"))
    }

    #[test]
    fn test_attribute_parsing() {
        assert_eq!(ExitStatus::from_attribute("0"), ExitStatus::new(0));
        assert_eq!(ExitStatus::from_attribute("137"), ExitStatus::new(137));
        assert_eq!(ExitStatus::from_attribute(" 2 "), ExitStatus::new(2));
        assert_eq!(ExitStatus::from_attribute("abc"), ExitStatus::UNKNOWN);
        assert_eq!(ExitStatus::from_attribute(""), ExitStatus::UNKNOWN);
        assert_eq!(ExitStatus::from_attribute("-5"), ExitStatus::UNKNOWN);
    }

    #[test]
    fn test_wire_code() {
        assert_eq!(ExitStatus::new(0).wire_code(), 0);
        assert_eq!(ExitStatus::new(42).wire_code(), 42);
        assert_eq!(ExitStatus::UNKNOWN.wire_code(), 255);
        assert_eq!(ExitStatus::default(), ExitStatus::UNKNOWN);
    }

    #[test]
    fn test_matches_by_exec_id_when_present() {
        let r = resolver();
        assert!(r.matches(&die_event("alice", &[("execID", "exec-1")])));
        assert!(!r.matches(&die_event("alice", &[("execID", "exec-2")])));
        assert!(!r.matches(&die_event("bob", &[("execID", "exec-1")])));
    }

    #[test]
    fn test_matches_container_only_without_exec_id() {
        // No execID attribute: completions of any exec in the container match.
        assert!(resolver().matches(&die_event("alice", &[("exitCode", "3")])));
    }

    #[tokio::test]
    async fn test_skips_foreign_exec_then_resolves() {
        let (event_tx, events) = mpsc::channel(4);
        let (_error_tx, errors) = mpsc::channel(1);
        let mut sub = EventSubscription { events, errors };

        event_tx
            .send(die_event("alice", &[("execID", "other"), ("exitCode", "9")]))
            .await
            .unwrap();
        event_tx
            .send(die_event("alice", &[("execID", "exec-1"), ("exitCode", "4")]))
            .await
            .unwrap();

        let outcome = resolver().resolve(&mut sub, &CancellationToken::new()).await;
        assert_eq!(outcome.status(), ExitStatus::new(4));
    }

    #[tokio::test]
    async fn test_closed_error_channel_does_not_fail() {
        let (event_tx, events) = mpsc::channel(1);
        let (error_tx, errors) = mpsc::channel(1);
        drop(error_tx);
        let mut sub = EventSubscription { events, errors };

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = event_tx.send(die_event("alice", &[("exitCode", "0")])).await;
        });

        let outcome = resolver().resolve(&mut sub, &CancellationToken::new()).await;
        assert!(matches!(outcome, ExitOutcome::Resolved(s) if s == ExitStatus::new(0)));
    }

    #[tokio::test]
    async fn test_cancellation_fails_with_cancelled() {
        let (_event_tx, events) = mpsc::channel::<RuntimeEvent>(1);
        let (_error_tx, errors) = mpsc::channel(1);
        let mut sub = EventSubscription { events, errors };
        let cancel = CancellationToken::new();
        cancel.cancel();

        match resolver().resolve(&mut sub, &cancel).await {
            ExitOutcome::Failed(err) => assert!(err.is_cancellation()),
            other => panic!("expected cancellation, got {:?}", other),
        }
    }
}
