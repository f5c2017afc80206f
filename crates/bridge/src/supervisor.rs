//! Child-process supervision and lifecycle management.
//!
//! Each handle owns one stdio MCP server process: spawn with piped stdio,
//! confirm it survives the start window, frame its stdout/stderr into lines,
//! restart it on abnormal exit while the restart budget lasts, and terminate
//! it on demand. Everything observable flows out as [`ProcessEvent`]s over a
//! single channel; the proxy core is the consumer.

use crate::config::ServerConfig;
use crate::error::{BridgeError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Grace period between SIGTERM and a hard kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Crashed,
}

/// Observable supervisor events, tagged with the handle id.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started { id: String },
    Stopped { id: String, code: Option<i32> },
    /// Abnormal exit. `fatal` is set once the restart budget is exhausted,
    /// after which the handle is removed.
    Crashed { id: String, error: String, fatal: bool },
    Restarted { id: String, attempt: u32 },
    Stdout { id: String, line: String },
    Stderr { id: String, line: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// The child must survive this window after spawn.
    pub spawn_wait: Duration,
    pub restart_delay: Duration,
    pub max_restart_attempts: u32,
}

struct ProcessHandle {
    id: String,
    config: ServerConfig,
    state: RwLock<ProcessState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    restart_count: AtomicU32,
    started_at: RwLock<Option<Instant>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    handles: Arc<RwLock<HashMap<String, Arc<ProcessHandle>>>>,
    events: UnboundedSender<ProcessEvent>,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(settings: SupervisorSettings) -> (Self, UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                handles: Arc::new(RwLock::new(HashMap::new())),
                events,
                settings,
            },
            rx,
        )
    }

    /// Spawn a supervised child under a fresh handle id.
    ///
    /// Reusing a live handle id is a usage error. The command and argument
    /// vector are passed as-is (no shell); the config env is overlaid on the
    /// parent environment.
    pub async fn spawn(&self, id: &str, config: ServerConfig) -> Result<()> {
        let handle = Arc::new(ProcessHandle {
            id: id.to_string(),
            config,
            state: RwLock::new(ProcessState::Stopped),
            stdin: tokio::sync::Mutex::new(None),
            restart_count: AtomicU32::new(0),
            started_at: RwLock::new(None),
            shutdown: CancellationToken::new(),
        });

        {
            let mut handles = self.handles.write();
            if handles.contains_key(id) {
                return Err(BridgeError::Runtime(format!(
                    "process handle '{id}' already exists"
                )));
            }
            handles.insert(id.to_string(), handle.clone());
        }

        if let Err(e) = self.start_child(&handle).await {
            self.handles.write().remove(id);
            return Err(e);
        }

        let _ = self.events.send(ProcessEvent::Started {
            id: id.to_string(),
        });
        Ok(())
    }

    /// Write one JSON-encoded message to the child's stdin, appending the
    /// line terminator when missing. Fails immediately on a non-running
    /// handle.
    pub async fn write_line(&self, id: &str, payload: &str) -> Result<()> {
        let handle = self
            .handles
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::Runtime(format!("unknown process handle '{id}'")))?;

        if *handle.state.read() != ProcessState::Running {
            return Err(BridgeError::Runtime(format!(
                "process handle '{id}' is not running"
            )));
        }

        let mut stdin = handle.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or_else(|| {
            BridgeError::Runtime(format!("process handle '{id}' has no stdin"))
        })?;
        stdin.write_all(payload.as_bytes()).await?;
        if !payload.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.handles
            .read()
            .get(id)
            .is_some_and(|h| *h.state.read() == ProcessState::Running)
    }

    /// Terminate a handle. Unknown ids are a warning-level no-op.
    pub async fn kill(&self, id: &str) {
        let handle = self.handles.write().remove(id);
        match handle {
            Some(handle) => {
                tracing::info!(handle = %id, "terminating process");
                handle.shutdown.cancel();
            }
            None => tracing::warn!(handle = %id, "kill requested for unknown handle"),
        }
    }

    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.handles.read().keys().cloned().collect();
        for id in ids {
            self.kill(&id).await;
        }
    }

    /// Spawn one child generation for the handle: pipe stdio, enforce the
    /// start window, wire up line readers and the exit monitor.
    async fn start_child(&self, handle: &Arc<ProcessHandle>) -> Result<()> {
        let config = &handle.config;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Startup(format!(
                "failed to spawn '{}' for handle '{}': {e}",
                config.command, handle.id
            ))
        })?;

        // Take the pipes before waiting: tokio's `wait` closes stdin if it is
        // still attached to the child.
        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::Startup(format!("handle '{}': failed to capture stdin", handle.id))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::Startup(format!("handle '{}': failed to capture stdout", handle.id))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            BridgeError::Startup(format!("handle '{}': failed to capture stderr", handle.id))
        })?;

        // Start confirmation: an exit inside the window fails the start.
        match tokio::time::timeout(self.settings.spawn_wait, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(BridgeError::Startup(format!(
                    "handle '{}' exited during start window: {status}",
                    handle.id
                )));
            }
            Ok(Err(e)) => {
                return Err(BridgeError::Startup(format!(
                    "handle '{}' failed during start window: {e}",
                    handle.id
                )));
            }
            Err(_) => {} // still alive
        }

        *handle.stdin.lock().await = Some(stdin);
        *handle.state.write() = ProcessState::Running;
        *handle.started_at.write() = Some(Instant::now());

        self.spawn_line_reader(handle.id.clone(), stdout, false);
        self.spawn_line_reader(handle.id.clone(), stderr, true);
        self.spawn_exit_monitor(handle.clone(), child);

        tracing::debug!(handle = %handle.id, command = %config.command, "process started");
        Ok(())
    }

    /// Frame a byte stream into non-empty `\n`-terminated lines. Trailing
    /// partial lines stay buffered inside the reader across polls.
    fn spawn_line_reader<R>(&self, id: String, stream: R, stderr: bool)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let event = if stderr {
                            ProcessEvent::Stderr {
                                id: id.clone(),
                                line,
                            }
                        } else {
                            ProcessEvent::Stdout {
                                id: id.clone(),
                                line,
                            }
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(handle = %id, error = %e, "pipe read error");
                        break;
                    }
                }
            }
        });
    }

    fn spawn_exit_monitor(&self, handle: Arc<ProcessHandle>, mut child: Child) {
        let supervisor = self.clone();
        let shutdown = handle.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    supervisor.on_exit(handle, status).await;
                }
                () = shutdown.cancelled() => {
                    let code = terminate_child(&mut child).await;
                    *handle.state.write() = ProcessState::Stopped;
                    let _ = supervisor.events.send(ProcessEvent::Stopped {
                        id: handle.id.clone(),
                        code,
                    });
                }
            }
        });
    }

    async fn on_exit(
        self,
        handle: Arc<ProcessHandle>,
        status: std::io::Result<std::process::ExitStatus>,
    ) {
        if handle.shutdown.is_cancelled() {
            // Lost the race against an explicit kill.
            *handle.state.write() = ProcessState::Stopped;
            let _ = self.events.send(ProcessEvent::Stopped {
                id: handle.id.clone(),
                code: status.ok().and_then(|s| s.code()),
            });
            return;
        }

        match status {
            Ok(status) if status.success() => {
                *handle.state.write() = ProcessState::Stopped;
                tracing::info!(handle = %handle.id, "process exited cleanly");
                let _ = self.events.send(ProcessEvent::Stopped {
                    id: handle.id.clone(),
                    code: Some(0),
                });
            }
            Ok(status) => {
                let error = format!("process exited with {status}");
                self.crash_and_restart(handle, error).await;
            }
            Err(e) => {
                let error = format!("wait failed: {e}");
                self.crash_and_restart(handle, error).await;
            }
        }
    }

    /// Crash handling: emit `crashed`, then start a fresh child while the
    /// restart budget lasts. A failed respawn consumes budget like a crash.
    async fn crash_and_restart(self, handle: Arc<ProcessHandle>, mut error: String) {
        let max = self.settings.max_restart_attempts;
        loop {
            *handle.state.write() = ProcessState::Crashed;
            let attempts = handle.restart_count.load(Ordering::SeqCst);
            let fatal = attempts >= max;

            let uptime = handle.started_at.read().map(|t| t.elapsed());
            tracing::warn!(
                handle = %handle.id,
                attempts,
                fatal,
                ?uptime,
                error = %error,
                "process crashed"
            );
            let _ = self.events.send(ProcessEvent::Crashed {
                id: handle.id.clone(),
                error: error.clone(),
                fatal,
            });

            if fatal {
                self.handles.write().remove(&handle.id);
                return;
            }

            tokio::time::sleep(self.settings.restart_delay).await;
            if handle.shutdown.is_cancelled() {
                return;
            }

            let attempt = handle.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
            match self.start_child(&handle).await {
                Ok(()) => {
                    tracing::info!(handle = %handle.id, attempt, "process restarted");
                    let _ = self.events.send(ProcessEvent::Restarted {
                        id: handle.id.clone(),
                        attempt,
                    });
                    return;
                }
                Err(e) => {
                    error = e.to_string();
                }
            }
        }
    }
}

/// SIGTERM first, hard kill after the grace period.
async fn terminate_child(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            return status.ok().and_then(|s| s.code());
        }
    }

    let _ = child.start_kill();
    child.wait().await.ok().and_then(|s| s.code())
}
