//! Stdio transport for MCP child-process servers
//!
//! This module implements [`StdioTransport`], which spawns a child process
//! and communicates with it over its stdin/stdout pipes using
//! newline-delimited JSON framing. This is the standard transport for
//! locally-installed MCP servers.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by a newline (`\n`).
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line (newline stripped before delivery).
//! - The child's stderr is forwarded to a diagnostic stream, logged via
//!   `tracing::debug!`, and retained in a bounded tail ring that the manager
//!   attaches to `lastError` when the child dies unexpectedly. Per the MCP
//!   specification, stderr output MUST NOT be treated as an error condition.
//!
//! # Lifecycle
//!
//! The transport is created via [`StdioTransport::spawn`]. Two background
//! Tokio tasks are started immediately: one drains stdout, one drains
//! stderr. [`Transport::close`] (and, as a fallback, `Drop`) sends a
//! best-effort SIGTERM (Unix) or `start_kill` (non-Unix) so the child is
//! reaped and never left as a zombie.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use futures::Stream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{McpLensError, Result};
use crate::mcp::transport::Transport;

/// Number of stderr lines retained for diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Stdio-based MCP transport that drives a child process.
///
/// Communication happens over the child's stdin (outbound) and stdout
/// (inbound) using newline-delimited JSON. The child's stderr is captured
/// and forwarded through [`Transport::receive_err`] as diagnostic-only
/// output.
#[derive(Debug)]
pub struct StdioTransport {
    /// Sender side of the stdin channel; `send()` writes here.
    stdin_tx: mpsc::UnboundedSender<String>,
    /// Shared receiver for stdout lines (one JSON message per line).
    stdout_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Shared receiver for stderr lines (diagnostics only).
    stderr_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Bounded ring of the most recent stderr lines.
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    /// Handle to the spawned child process; used by `close()` and `Drop`.
    child: Arc<Mutex<Child>>,
}

impl StdioTransport {
    /// Spawn a child process and wire up stdio pipes.
    ///
    /// The environment of the child is built by first clearing all inherited
    /// variables (`env_clear`) and then applying the caller-supplied `env`
    /// map. If `working_dir` is `Some`, the child's working directory is set
    /// accordingly.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the process cannot be spawned
    /// or the stdio pipes are unavailable.
    pub fn spawn(
        executable: PathBuf,
        args: Vec<String>,
        env: HashMap<String, String>,
        working_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&executable);
        cmd.args(&args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env_clear().envs(&env);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpLensError::Transport(format!(
                "failed to spawn MCP server `{}`: {}",
                executable.display(),
                e
            ))
        })?;

        // Each handle is guaranteed Some because of Stdio::piped() above.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpLensError::Transport("child stdin unavailable after spawn".into()))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpLensError::Transport("child stdout unavailable after spawn".into())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            McpLensError::Transport("child stderr unavailable after spawn".into())
        })?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel::<String>();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<String>();
        let stderr_tail = Arc::new(StdMutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        // Background task: forward stdin_rx -> child stdin.
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(msg) = stdin_rx.recv().await {
                let line = format!("{}\n", msg);
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stdout -> stdout_tx. The channel
        // closing is how transport death reaches the read loop.
        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx.send(line).is_err() {
                    break;
                }
            }
        });

        // Background task: drain child stderr -> stderr_tx + tail ring.
        let tail = Arc::clone(&stderr_tail);
        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "mcplens::mcp::transport::stdio",
                    "mcp server stderr: {}",
                    line
                );
                {
                    let mut ring = tail.lock().unwrap_or_else(|p| p.into_inner());
                    if ring.len() == STDERR_TAIL_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(line.clone());
                }
                if stderr_tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            stdin_tx,
            stdout_rx: Arc::new(Mutex::new(stdout_rx)),
            stderr_rx: Arc::new(Mutex::new(stderr_rx)),
            stderr_tail,
            child: Arc::new(Mutex::new(child)),
        })
    }

    /// Best-effort termination of the child process.
    fn terminate_child(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    /// Send a JSON-RPC message to the child process via its stdin.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the internal channel is closed
    /// (i.e. the background writer task has exited).
    async fn send(&self, message: String) -> Result<()> {
        self.stdin_tx
            .send(message)
            .map_err(|e| McpLensError::Transport(format!("stdin channel closed: {}", e)).into())
    }

    /// Returns a stream of JSON-RPC messages received from the child's
    /// stdout (one complete JSON object per item, newline stripped).
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.stdout_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Returns a stream of diagnostic lines from the child's stderr.
    ///
    /// Per the MCP specification, these MUST NOT be treated as errors.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.stderr_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Reap the child process. Idempotent: terminating an already-dead child
    /// is a no-op, and `wait()` collects the exit status so no zombie
    /// remains.
    async fn close(&self) {
        let mut child = self.child.lock().await;
        Self::terminate_child(&mut child);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), child.wait()).await;
    }

    /// The most recent stderr lines, newest last.
    fn diagnostics(&self) -> Option<String> {
        let ring = self.stderr_tail.lock().unwrap_or_else(|p| p.into_inner());
        if ring.is_empty() {
            None
        } else {
            Some(ring.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

impl Drop for StdioTransport {
    /// Fallback termination for transports dropped without `close()`.
    ///
    /// This method MUST NOT block; it is fire-and-forget. If the lock is
    /// already held by another task we skip the kill -- the `close()` path
    /// holding it performs the same termination.
    fn drop(&mut self) {
        if let Ok(mut child) = self.child.try_lock() {
            Self::terminate_child(&mut child);
        }
    }
}
