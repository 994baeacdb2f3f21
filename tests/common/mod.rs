//! Shared test fixtures: an in-memory container runtime with a scripted
//! shell, plus session I/O helpers.
//!
//! The fake runtime understands a handful of commands:
//!
//! | Command           | Behaviour                                         |
//! |-------------------|---------------------------------------------------|
//! | `echo ARGS..`     | prints ARGS joined by spaces, status 0            |
//! | `fail MSG..`      | prints MSG to stderr, status 2                    |
//! | `true` / `false`  | status 0 / 1                                      |
//! | `exit [N]`        | ends the shell with status N (default 0)          |
//! | `sleep SECS`      | waits SECS seconds (fractions allowed)            |
//! | `cat`             | copies stdin to stdout until EOF (top level only) |
//! | `/bin/bash`, `/bin/sh` | reads commands from stdin, one per line      |
//!
//! Anything else prints `NAME: command not found` and exits 127.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream;
use sshbox::bridge::{Session, SessionIo, WindowChanges};
use sshbox::error::{Error, Result};
use sshbox::runtime::{
    ContainerPresence, ContainerRuntime, ContainerSpec, EventFilter, EventSubscription, ExecId,
    ExecSpec, ExecStream, OutputChunk, RuntimeEvent, WindowSize,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Fake Runtime
// =============================================================================

/// Knobs for failure injection.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub fail_inspect: bool,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_exec_create: bool,
    /// Number of resizes that succeed before every further one fails.
    pub fail_resize_after: Option<usize>,
    /// Leave the `execID` attribute off completion events.
    pub omit_exec_id: bool,
    /// Publish the completion event before the output stream is drained.
    pub exit_event_before_output: bool,
    /// Fail the event stream as soon as the exec starts.
    pub event_stream_error: bool,
    /// Never publish completion events.
    pub suppress_exit_event: bool,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub spec: Option<ContainerSpec>,
    pub running: bool,
}

struct PendingExec {
    container: String,
    spec: ExecSpec,
    stdin: Option<DuplexStream>,
    output: Option<mpsc::UnboundedSender<OutputChunk>>,
}

struct Subscriber {
    filter: EventFilter,
    events: mpsc::Sender<RuntimeEvent>,
    errors: mpsc::Sender<Error>,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    execs: HashMap<String, PendingExec>,
    subscribers: Vec<Subscriber>,
    calls: Vec<String>,
    resizes: Vec<(String, WindowSize)>,
    exec_specs: Vec<ExecSpec>,
    next_exec: u64,
}

/// In-memory [`ContainerRuntime`].
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
    behavior: Behavior,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: Behavior) -> Self {
        Self {
            state: Arc::default(),
            behavior,
        }
    }

    /// Seeds a container that already exists.
    pub fn with_container(self, name: &str, running: bool) -> Self {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            FakeContainer {
                spec: None,
                running,
            },
        );
        self
    }

    /// Operations in call order, e.g. `create:alice`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn resizes(&self) -> Vec<WindowSize> {
        self.state
            .lock()
            .unwrap()
            .resizes
            .iter()
            .map(|(_, size)| *size)
            .collect()
    }

    pub fn exec_specs(&self) -> Vec<ExecSpec> {
        self.state.lock().unwrap().exec_specs.clone()
    }

    /// Event subscriptions whose receiver is still held, i.e. bridges that
    /// have not returned yet.
    pub fn live_subscriptions(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .filter(|s| !s.events.is_closed())
            .count()
    }

    /// Publishes an event to matching subscribers.
    pub fn emit(&self, event: RuntimeEvent) {
        let mut state = self.state.lock().unwrap();
        state
            .subscribers
            .retain(|s| !s.events.is_closed() && !s.errors.is_closed());
        for sub in &state.subscribers {
            if sub.filter.container == event.container && sub.filter.action == event.action {
                let _ = sub.events.try_send(event.clone());
            }
        }
    }

    /// Fails every live subscription.
    pub fn fail_event_streams(&self, reason: &str) {
        let state = self.state.lock().unwrap();
        for sub in &state.subscribers {
            let _ = sub.errors.try_send(Error::EventStream(reason.to_string()));
        }
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn exit_event(&self, container: &str, exec: &str, status: i32) -> RuntimeEvent {
        let mut attributes = HashMap::from([("exitCode".to_string(), status.to_string())]);
        if !self.behavior.omit_exec_id {
            attributes.insert("execID".to_string(), exec.to_string());
        }
        RuntimeEvent {
            container: container.to_string(),
            action: "exec_die".to_string(),
            attributes,
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn inspect(&self, id: &str) -> Result<ContainerPresence> {
        self.record(format!("inspect:{id}"));
        if self.behavior.fail_inspect {
            return Err(Error::InspectFailed {
                id: id.to_string(),
                reason: "daemon unreachable".to_string(),
            });
        }
        let present = self.state.lock().unwrap().containers.contains_key(id);
        Ok(if present {
            ContainerPresence::Present
        } else {
            ContainerPresence::Absent
        })
    }

    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<()> {
        self.record(format!("create:{id}"));
        if self.behavior.fail_create {
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: "No such image".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(id) {
            return Err(Error::CreateFailed {
                id: id.to_string(),
                reason: "Conflict. The container name is already in use".to_string(),
            });
        }
        state.containers.insert(
            id.to_string(),
            FakeContainer {
                spec: Some(spec.clone()),
                running: false,
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.record(format!("start:{id}"));
        if self.behavior.fail_start {
            return Err(Error::StartFailed {
                id: id.to_string(),
                reason: "cannot start".to_string(),
            });
        }
        match self.state.lock().unwrap().containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(Error::StartFailed {
                id: id.to_string(),
                reason: "No such container".to_string(),
            }),
        }
    }

    async fn exec_create(&self, id: &str, spec: &ExecSpec) -> Result<ExecId> {
        self.record(format!("exec_create:{id}"));
        let mut state = self.state.lock().unwrap();
        let running = state.containers.get(id).is_some_and(|c| c.running);
        if self.behavior.fail_exec_create || !running {
            return Err(Error::ExecCreateFailed {
                container: id.to_string(),
                reason: format!("container {id} is not running"),
            });
        }
        state.next_exec += 1;
        let exec = format!("exec-{}", state.next_exec);
        state.exec_specs.push(spec.clone());
        state.execs.insert(
            exec.clone(),
            PendingExec {
                container: id.to_string(),
                spec: spec.clone(),
                stdin: None,
                output: None,
            },
        );
        Ok(ExecId::new(exec))
    }

    async fn exec_attach(&self, exec: &ExecId, _tty: bool) -> Result<ExecStream> {
        self.record(format!("exec_attach:{exec}"));
        let mut state = self.state.lock().unwrap();
        let pending = state
            .execs
            .get_mut(exec.as_str())
            .ok_or_else(|| Error::ExecAttachFailed {
                exec: exec.to_string(),
                reason: "no such exec".to_string(),
            })?;

        let (input, stdin) = tokio::io::duplex(4096);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        pending.stdin = Some(stdin);
        pending.output = Some(output_tx);

        let output = stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        Ok(ExecStream {
            output: Box::pin(output),
            input: Box::pin(input),
        })
    }

    async fn exec_start(&self, exec: &ExecId, _tty: bool) -> Result<()> {
        self.record(format!("exec_start:{exec}"));
        let pending = self
            .state
            .lock()
            .unwrap()
            .execs
            .remove(exec.as_str())
            .ok_or_else(|| Error::ExecStartFailed {
                exec: exec.to_string(),
                reason: "no such exec".to_string(),
            })?;
        let PendingExec {
            container,
            spec,
            stdin,
            output,
        } = pending;
        let (Some(stdin), Some(output)) = (stdin, output) else {
            return Err(Error::ExecStartFailed {
                exec: exec.to_string(),
                reason: "exec not attached".to_string(),
            });
        };

        if self.behavior.event_stream_error {
            self.fail_event_streams("connection to daemon lost");
        }

        let runtime = self.clone();
        let exec = exec.to_string();
        tokio::spawn(async move {
            let mut out = Output {
                tx: output,
                tty: spec.tty,
            };
            let status = run_script(&spec.command, stdin, &mut out).await;
            if runtime.behavior.suppress_exit_event {
                return;
            }
            let event = runtime.exit_event(&container, &exec, status);
            if runtime.behavior.exit_event_before_output {
                // Report the exit first, then let the tail of the output trickle out.
                runtime.emit(event);
                tokio::time::sleep(Duration::from_millis(20)).await;
                out.stdout("trailing output\n");
                drop(out);
            } else {
                drop(out);
                runtime.emit(event);
            }
        });
        Ok(())
    }

    async fn exec_resize(&self, exec: &ExecId, size: WindowSize) -> Result<()> {
        self.record(format!("exec_resize:{exec}:{size}"));
        let mut state = self.state.lock().unwrap();
        if let Some(limit) = self.behavior.fail_resize_after {
            if state.resizes.len() >= limit {
                return Err(Error::ExecResizeFailed {
                    exec: exec.to_string(),
                    reason: "exec is not running".to_string(),
                });
            }
        }
        state.resizes.push((exec.to_string(), size));
        Ok(())
    }

    async fn subscribe_events(&self, filter: &EventFilter) -> Result<EventSubscription> {
        self.record(format!("subscribe:{}", filter.container));
        let (event_tx, events) = mpsc::channel(16);
        let (error_tx, errors) = mpsc::channel(1);
        self.state.lock().unwrap().subscribers.push(Subscriber {
            filter: filter.clone(),
            events: event_tx,
            errors: error_tx,
        });
        Ok(EventSubscription { events, errors })
    }
}

// =============================================================================
// Scripted Shell
// =============================================================================

struct Output {
    tx: mpsc::UnboundedSender<OutputChunk>,
    tty: bool,
}

impl Output {
    fn stdout(&self, text: &str) {
        let bytes = text.as_bytes().to_vec();
        let chunk = if self.tty {
            OutputChunk::Console(bytes)
        } else {
            OutputChunk::Stdout(bytes)
        };
        let _ = self.tx.send(chunk);
    }

    fn stderr(&self, text: &str) {
        let bytes = text.as_bytes().to_vec();
        let chunk = if self.tty {
            OutputChunk::Console(bytes)
        } else {
            OutputChunk::Stderr(bytes)
        };
        let _ = self.tx.send(chunk);
    }

    fn raw(&self, bytes: Vec<u8>) {
        let chunk = if self.tty {
            OutputChunk::Console(bytes)
        } else {
            OutputChunk::Stdout(bytes)
        };
        let _ = self.tx.send(chunk);
    }
}

enum Step {
    Continue(i32),
    Exit(i32),
}

fn is_shell(program: &str) -> bool {
    matches!(program, "/bin/bash" | "/bin/sh" | "bash" | "sh")
}

async fn run_script(command: &[String], mut stdin: DuplexStream, out: &mut Output) -> i32 {
    let Some(program) = command.first() else {
        return 127;
    };

    if is_shell(program) {
        let mut lines = BufReader::new(stdin).lines();
        let mut status = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            let argv: Vec<String> = line.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                continue;
            }
            match builtin(&argv, out).await {
                Step::Continue(code) => status = code,
                Step::Exit(code) => return code,
            }
        }
        return status;
    }

    if program == "cat" {
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => return 0,
                Ok(n) => out.raw(buf[..n].to_vec()),
            }
        }
    }

    match builtin(command, out).await {
        Step::Continue(code) | Step::Exit(code) => code,
    }
}

async fn builtin(argv: &[String], out: &Output) -> Step {
    let args = &argv[1..];
    match argv[0].as_str() {
        "echo" => {
            out.stdout(&format!("{}\n", args.join(" ")));
            Step::Continue(0)
        }
        "fail" => {
            out.stderr(&format!("{}\n", args.join(" ")));
            Step::Continue(2)
        }
        "true" => Step::Continue(0),
        "false" => Step::Continue(1),
        "exit" => Step::Exit(args.first().and_then(|a| a.parse().ok()).unwrap_or(0)),
        "sleep" => {
            let secs: f64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Step::Continue(0)
        }
        other => {
            out.stderr(&format!("{other}: command not found\n"));
            Step::Continue(127)
        }
    }
}

// =============================================================================
// Session Helpers
// =============================================================================

/// `AsyncWrite` that appends into a shared buffer.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for Capture {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Session side of a bridge run.
pub struct Harness {
    pub io: SessionIo,
    pub stdin: DuplexStream,
    pub stdout: Capture,
    pub stderr: Capture,
    pub cancel: CancellationToken,
}

/// Builds session I/O. `window_changes` is handed to the bridge as-is.
pub fn harness(window_changes: Option<WindowChanges>) -> Harness {
    let (stdin, session_input) = tokio::io::duplex(4096);
    let stdout = Capture::default();
    let stderr = Capture::default();
    let cancel = CancellationToken::new();
    let io = SessionIo {
        stdin: Box::pin(session_input),
        stdout: Box::pin(stdout.clone()),
        stderr: Box::pin(stderr.clone()),
        window_changes,
        cancel: cancel.clone(),
    };
    Harness {
        io,
        stdin,
        stdout,
        stderr,
        cancel,
    }
}

/// A session for `alice` running `command` (empty for the default shell).
pub fn session(command: &[&str]) -> Session {
    let mut session = Session::new(sshbox::ContainerIdentity::new("alice"));
    session.command = command.iter().map(|s| s.to_string()).collect();
    session
}

/// A runtime with `alice` already running.
pub fn running_alice(behavior: Behavior) -> FakeRuntime {
    FakeRuntime::with_behavior(behavior).with_container("alice", true)
}
