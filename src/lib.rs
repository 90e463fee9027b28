//! MCPLens - Inspector backend for Model Context Protocol servers
//!
//! This library hosts the core of the MCPLens service: a long-lived process
//! that owns many concurrent MCP client sessions, multiplexes operations
//! across them, brokers interactive elicitation requests back to UI clients
//! via a streaming event hub, runs LLM chat turns that dispatch tool calls
//! against those sessions, and exposes an OAuth proxy for browser clients.
//!
//! # Architecture
//!
//! Data flows `server` (HTTP edge) → `manager` → session → `mcp::transport`;
//! server-initiated traffic comes back through the manager's inbox and is
//! republished on the `hub`. The `chat` engine sits beside the manager and
//! consumes it as a dependency.
//!
//! - `mcp`: wire types, JSON-RPC client, protocol wrapper, transports
//! - `manager`: server records, session supervision, op dispatch
//! - `hub`: pub/sub topics with replay and bounded subscriber queues,
//!   plus the elicitation broker
//! - `chat`: model driver seam and the turn engine
//! - `server`: axum routes, SSE streams, OAuth proxy
//! - `config` / `cli` / `error`: ambient plumbing

pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod manager;
pub mod mcp;
pub mod server;

// Re-export commonly used types
pub use chat::{ChatEngine, ChatTurnRequest};
pub use config::Settings;
pub use error::{ErrorCode, McpLensError, Result};
pub use hub::{EventHub, Topic};
pub use manager::ClientManager;
