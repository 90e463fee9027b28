//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy, the [`ServerConfig`] shapes that describe
//! how to reach a server, and the [`open_transport`] factory that enforces
//! the process-wide scheme policy. Concrete implementations live in
//! submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and communicates
//!   over its stdin/stdout pipes (newline-delimited JSON).
//! - [`http::HttpTransport`] -- Streamable HTTP/SSE transport.
//! - [`fake::FakeTransport`] -- in-process fake used in tests (cfg(test)
//!   only).
//!
//! # Design
//!
//! The [`Transport`] trait is intentionally minimal: callers `send` a
//! serialized JSON-RPC string and `receive` a stream of serialized JSON-RPC
//! strings (one per logical message). Framing and session management are the
//! responsibility of each concrete implementation; reconnection belongs to
//! the manager.
//!
//! The `receive_err` stream carries transport-level diagnostics (e.g. stderr
//! output from a child process). Per the MCP spec, diagnostic output MUST
//! NOT be treated as an error condition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{McpLensError, Result};

/// Abstraction over MCP transport implementations.
///
/// All methods are `async` or return pinned [`Stream`]s so that transport
/// implementations can drive I/O without blocking the Tokio executor.
/// Used polymorphically through `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a complete JSON-RPC message string to the remote peer.
    ///
    /// The string MUST be a single, complete JSON object. The transport is
    /// responsible for any framing required by the underlying medium (e.g.
    /// appending a newline for stdio, or issuing an HTTP POST).
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Transport`] if the transport has been closed
    /// or the underlying I/O operation fails.
    async fn send(&self, message: String) -> Result<()>;

    /// Returns a stream of inbound JSON-RPC message strings.
    ///
    /// Each item is a single, complete JSON object with leading/trailing
    /// whitespace stripped. The stream is finite: it ends when the transport
    /// is closed or the remote peer disconnects.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Returns a stream of transport-level diagnostic strings.
    ///
    /// For stdio transports this carries lines written to the child
    /// process's stderr. For HTTP transports this stream may be empty.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Close the transport, releasing its resources.
    ///
    /// Idempotent. For stdio this reaps the child process; for HTTP it
    /// terminates the server-side session.
    async fn close(&self);

    /// A snapshot of recent diagnostics (the stderr tail for stdio), used to
    /// annotate `lastError` when the transport dies unexpectedly.
    fn diagnostics(&self) -> Option<String> {
        None
    }

    /// For transports with a server-push channel, establish it after the
    /// handshake. Default no-op; the HTTP transport opens its long-lived SSE
    /// GET stream here.
    async fn open_push_stream(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server configuration shapes
// ---------------------------------------------------------------------------

/// How an HTTP server expects to be authenticated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    /// No authentication.
    #[default]
    None,
    /// A static bearer token supplied in `headers`.
    Bearer,
    /// OAuth 2.1 authorization-code flow brokered by the OAuth proxy.
    Oauth,
}

/// Configuration for a subprocess (stdio) server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioServerConfig {
    /// Executable to spawn.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the child; the parent environment is not inherited.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Optional working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

/// Configuration for a remote (streamable HTTP) server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpServerConfig {
    /// The MCP endpoint URL.
    pub url: url::Url,
    /// Extra headers merged into every request (auth tokens go here).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// How this server authenticates.
    #[serde(default)]
    pub auth_kind: AuthKind,
}

/// One of the two server configuration shapes.
///
/// Untagged on the wire: a `command` key means stdio, a `url` key means
/// HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerConfig {
    /// A subprocess to spawn.
    Stdio(StdioServerConfig),
    /// A remote endpoint.
    Http(HttpServerConfig),
}

impl ServerConfig {
    /// Human label for the transport kind, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerConfig::Stdio(_) => "stdio",
            ServerConfig::Http(_) => "http",
        }
    }
}

/// Construct a transport for `config`, enforcing the process-mode policy.
///
/// In web mode, stdio transports are disallowed entirely and HTTP servers
/// must use `https://`. Outside web mode, `http://` and `https://` are both
/// accepted; any other scheme is rejected.
///
/// # Errors
///
/// - [`McpLensError::Forbidden`] when the config is disallowed in the
///   current mode.
/// - [`McpLensError::Validation`] for URLs with unsupported schemes.
/// - [`McpLensError::Transport`] when the subprocess cannot be spawned.
pub fn open_transport(
    config: &ServerConfig,
    web_mode: bool,
    request_timeout: Duration,
) -> Result<Arc<dyn Transport>> {
    match config {
        ServerConfig::Stdio(stdio) => {
            if web_mode {
                return Err(McpLensError::Forbidden(
                    "stdio transports are disabled in web mode".to_string(),
                )
                .into());
            }
            let transport = stdio::StdioTransport::spawn(
                PathBuf::from(&stdio.command),
                stdio.args.clone(),
                stdio.env.clone(),
                stdio.cwd.clone(),
            )?;
            Ok(Arc::new(transport))
        }
        ServerConfig::Http(remote) => {
            match remote.url.scheme() {
                "https" => {}
                "http" if !web_mode => {}
                "http" => {
                    return Err(McpLensError::Forbidden(format!(
                        "plain http MCP server URLs are disallowed in web mode: {}",
                        remote.url
                    ))
                    .into());
                }
                other => {
                    return Err(McpLensError::Validation(format!(
                        "unsupported MCP server URL scheme `{other}`"
                    ))
                    .into());
                }
            }
            let transport = http::HttpTransport::new(
                remote.url.clone(),
                remote.headers.clone(),
                request_timeout,
            );
            Ok(Arc::new(transport))
        }
    }
}

pub mod http;
pub mod stdio;

#[cfg(test)]
pub mod fake;
