//! Stdio transport implementation for process-based MCP servers

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use toolbridge_core::{BridgeError, Result};
use tracing::{debug, error, info, warn};

use super::Transport;
use crate::connection::{spawn_reader, RpcConnection};
use crate::framing::Framing;
use crate::spec::ServerSpec;

/// How long a dead process's stdout reader may keep delivering buffered
/// responses before pending requests are failed.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Stdio transport for process-based MCP servers
pub struct StdioTransport {
    name: String,
    command: String,
    pid: Option<u32>,
    connection: Arc<RpcConnection>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
    terminating: AtomicBool,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("framing", &self.connection.framing())
            .finish()
    }
}

impl StdioTransport {
    /// Spawn the server process described by `spec` and start reading its
    /// output with the given framing.
    pub fn spawn(spec: &ServerSpec, working_dir: &Path, framing: Framing) -> Result<Self> {
        info!(
            "Starting MCP server '{}' via stdio ({} framing): {} {:?}",
            spec.name, framing, spec.command, spec.args
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Inherited environment, overridden by the server's own entries
        if let Some(env) = &spec.env {
            cmd.envs(env);
        }

        let spawn_failure = |message: String| BridgeError::SpawnFailure {
            server: spec.name.clone(),
            message,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failure(format!("{}: {}", spec.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failure("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failure("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failure("failed to capture stderr".into()))?;

        let pid = child.id();
        let connection = Arc::new(RpcConnection::new(spec.name.clone(), framing, stdin));
        let reader = spawn_reader(connection.clone(), stdout);
        spawn_stderr_logger(spec.name.clone(), stderr);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::channel(1);
        spawn_exit_watcher(
            spec.name.clone(),
            child,
            reader,
            connection.clone(),
            exit_tx,
            kill_rx,
        );

        Ok(Self {
            name: spec.name.clone(),
            command: spec.command.clone(),
            pid,
            connection,
            exit_rx,
            kill_tx,
            terminating: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn connection(&self) -> &Arc<RpcConnection> {
        &self.connection
    }

    /// Exit status, once the process is gone.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait up to `grace` for the process to exit.
    pub async fn wait_for_exit(&self, grace: Duration) -> Option<ExitInfo> {
        let mut exit_rx = self.exit_rx.clone();
        let exited = match timeout(grace, exit_rx.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => *status,
            _ => None,
        };
        exited
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        debug!("Sending SIGTERM to MCP server '{}' (pid {})", self.name, pid);
        // SAFETY: kill(2) has no memory-safety preconditions; the pid is our
        // own child, which has not been reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(
                "SIGTERM to MCP server '{}' failed: {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.connection.request(method, params, timeout, cancel).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.connection.notify(method, params).await
    }

    async fn terminate(&self, grace: Duration) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }

        self.connection.close_writer();

        if let Some(exit) = self.wait_for_exit(grace).await {
            info!("MCP server '{}' exited with {}", self.name, exit);
            return;
        }

        #[cfg(unix)]
        {
            self.send_sigterm();
            if let Some(exit) = self.wait_for_exit(grace).await {
                info!("MCP server '{}' exited after SIGTERM with {}", self.name, exit);
                return;
            }
        }

        warn!("MCP server '{}' still running, killing it", self.name);
        if self.kill_tx.try_send(()).is_err() {
            debug!("Kill request for MCP server '{}' not delivered", self.name);
        }
        match self.wait_for_exit(grace).await {
            Some(exit) => info!("MCP server '{}' killed ({})", self.name, exit),
            None => error!("MCP server '{}' did not exit after kill", self.name),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.is_terminated() || self.exit_rx.borrow().is_some()
    }

    fn framing(&self) -> Framing {
        self.connection.framing()
    }
}

/// Forward the server's stderr to debug logs. Lines need not be UTF-8; the
/// pipe is drained until EOF so the server never writes into a closed pipe.
fn spawn_stderr_logger(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        debug!("MCP server '{}' stderr: {}", name, trimmed);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Error reading MCP server '{}' stderr: {}", name, e);
                    break;
                }
            }
        }
    });
}

/// Own the child until it exits. Kills it on request, or when the transport
/// is dropped; once it is gone, fails whatever is still pending.
fn spawn_exit_watcher(
    name: String,
    mut child: Child,
    mut reader: JoinHandle<()>,
    connection: Arc<RpcConnection>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    mut kill_rx: mpsc::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut kill_requested = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                request = kill_rx.recv(), if !kill_requested => {
                    kill_requested = true;
                    if request.is_none() {
                        debug!("Transport for MCP server '{}' dropped, killing process", name);
                    }
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill MCP server '{}': {}", name, e);
                    }
                }
            }
        };

        let exit = match status {
            Ok(status) => ExitInfo::from(status),
            Err(e) => {
                warn!("Failed to wait on MCP server '{}': {}", name, e);
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        debug!("MCP server '{}' process ended: {}", name, exit);

        // Responses written right before exit are still in the pipe.
        if timeout(READER_DRAIN_TIMEOUT, &mut reader).await.is_err() {
            debug!("MCP server '{}' output still open after exit", name);
            reader.abort();
        }

        connection.fail_all(&format!("MCP server '{}' exited ({})", name, exit));
        let _ = exit_tx.send(Some(exit));
    });
}
