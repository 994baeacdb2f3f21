//! # Docker Runtime - Containers via the Docker Engine API
//!
//! Implements [`ContainerRuntime`] on top of `bollard`.
//!
//! ## Operation Mapping
//!
//! | Trait operation    | Engine API                          | Notes                              |
//! |--------------------|-------------------------------------|------------------------------------|
//! | `inspect`          | `GET /containers/{id}/json`         | 404 ⇒ absent                       |
//! | `create`           | `POST /containers/create?name=`     |                                    |
//! | `start`            | `POST /containers/{id}/start`       | 304 (already running) ⇒ success    |
//! | `exec_create`      | `POST /containers/{id}/exec`        |                                    |
//! | `exec_attach`      | `POST /exec/{id}/start` (hijacked)  | Starts the process                 |
//! | `exec_start`       | `GET /exec/{id}/json`               | Confirms the exec exists           |
//! | `exec_resize`      | `POST /exec/{id}/resize`            |                                    |
//! | `subscribe_events` | `GET /events?filters=&since=now`    |                                    |
//!
//! ## Exec Start Semantics
//!
//! The Engine API has no separate attach step for execs: the hijacked
//! `start` call both attaches the stream and starts the process. The bridge
//! subscribes to events before attaching, so completion is never missed.
//!
//! ## Event Replay
//!
//! The event request carries `since=<subscription time>`. The daemon
//! replays matching events emitted between that instant and the moment the
//! HTTP stream connects, which closes the window in which a fast exec could
//! finish unobserved.
//!
//! ## Connection
//!
//! [`DockerRuntime::connect`] uses the local defaults: `DOCKER_HOST` when
//! set, otherwise `/var/run/docker.sock` (Unix) or the named pipe (Windows).

use crate::constants::{EVENT_CHANNEL_CAPACITY, EVENT_FILTER_CONTAINER, EVENT_FILTER_EVENT};
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerPresence, ContainerRuntime, ContainerSpec, EventFilter, EventSubscription, ExecId,
    ExecSpec, ExecStream, OutputChunk, RuntimeEvent, WindowSize,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use futures_util::{StreamExt, future};
use std::collections::HashMap;
use std::io;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// HTTP status the daemon returns for missing objects.
const STATUS_NOT_FOUND: u16 = 404;

/// HTTP status the daemon returns when starting a running container.
const STATUS_NOT_MODIFIED: u16 = 304;

/// Event attribute holding the container name.
const NAME_ATTRIBUTE: &str = "name";

fn has_status(err: &BollardError, code: u16) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

/// Docker Engine runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects with the local defaults (honours `DOCKER_HOST`).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            Error::InvalidConfig(format!("failed to connect to docker: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// Wraps an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn output_chunk(item: std::result::Result<LogOutput, BollardError>) -> Option<io::Result<OutputChunk>> {
    match item {
        Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message.to_vec()))),
        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
        Ok(LogOutput::Console { message }) => Some(Ok(OutputChunk::Console(message.to_vec()))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(io::Error::other(e))),
    }
}

fn runtime_event(message: EventMessage, container: &str) -> RuntimeEvent {
    let attributes: HashMap<String, String> = message
        .actor
        .and_then(|actor| actor.attributes)
        .unwrap_or_default();
    RuntimeEvent {
        container: attributes
            .get(NAME_ATTRIBUTE)
            .cloned()
            .unwrap_or_else(|| container.to_string()),
        action: message.action.unwrap_or_default(),
        attributes,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn inspect(&self, id: &str) -> Result<ContainerPresence> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(ContainerPresence::Present),
            Err(e) if has_status(&e, STATUS_NOT_FOUND) => Ok(ContainerPresence::Absent),
            Err(e) => Err(Error::InspectFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<()> {
        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            tty: Some(false),
            open_stdin: Some(spec.open_stdin),
            stdin_once: Some(spec.stdin_once),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: id.to_string(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::CreateFailed {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        for warning in created.warnings {
            warn!(container = %id, warning = %warning, "docker create warning");
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if has_status(&e, STATUS_NOT_MODIFIED) => {
                debug!(container = %id, "container already running");
                Ok(())
            }
            Err(e) => Err(Error::StartFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn exec_create(&self, id: &str, spec: &ExecSpec) -> Result<ExecId> {
        let options = CreateExecOptions {
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| Error::ExecCreateFailed {
                container: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ExecId::new(created.id))
    }

    async fn exec_attach(&self, exec: &ExecId, tty: bool) -> Result<ExecStream> {
        let options = StartExecOptions {
            detach: false,
            tty,
            ..Default::default()
        };
        let attach_failed = |reason: String| Error::ExecAttachFailed {
            exec: exec.to_string(),
            reason,
        };
        match self
            .docker
            .start_exec(exec.as_str(), Some(options))
            .await
            .map_err(|e| attach_failed(e.to_string()))?
        {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                output: Box::pin(output.filter_map(|item| future::ready(output_chunk(item)))),
                input,
            }),
            StartExecResults::Detached => {
                Err(attach_failed("daemon started the exec detached".to_string()))
            }
        }
    }

    async fn exec_start(&self, exec: &ExecId, _tty: bool) -> Result<()> {
        let inspected = self
            .docker
            .inspect_exec(exec.as_str())
            .await
            .map_err(|e| Error::ExecStartFailed {
                exec: exec.to_string(),
                reason: e.to_string(),
            })?;
        debug!(exec = %exec, running = ?inspected.running, pid = ?inspected.pid, "exec started");
        Ok(())
    }

    async fn exec_resize(&self, exec: &ExecId, size: WindowSize) -> Result<()> {
        let options = ResizeExecOptions {
            height: size.height,
            width: size.width,
        };
        self.docker
            .resize_exec(exec.as_str(), options)
            .await
            .map_err(|e| Error::ExecResizeFailed {
                exec: exec.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe_events(&self, filter: &EventFilter) -> Result<EventSubscription> {
        let filters = HashMap::from([
            (
                EVENT_FILTER_CONTAINER.to_string(),
                vec![filter.container.clone()],
            ),
            (EVENT_FILTER_EVENT.to_string(), vec![filter.action.clone()]),
        ]);
        let options = EventsOptions::<String> {
            since: Some(chrono::Utc::now()),
            filters,
            ..Default::default()
        };
        let mut stream = Box::pin(self.docker.events(Some(options)));

        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (error_tx, errors) = mpsc::channel(1);
        let container = filter.container.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = event_tx.closed() => break,
                    item = stream.next() => match item {
                        Some(Ok(message)) => {
                            if event_tx.send(runtime_event(message, &container)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = error_tx.send(Error::EventStream(e.to_string())).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!(container = %container, "event subscription closed");
        });

        Ok(EventSubscription { events, errors })
    }
}
