//! Server records and their lifecycle states
//!
//! One [`ServerRecord`] exists per configured server. Records are created by
//! "add server", mutated only by the manager under its single-writer
//! discipline, and destroyed by "remove server". The per-record generation
//! counter starts at 0 and is bumped on every session (re)establishment and
//! teardown so that frames and close events from dead sessions are
//! discarded.

use serde::{Deserialize, Serialize};

use crate::mcp::transport::ServerConfig;
use crate::mcp::types::ServerCapabilities;

/// Connection lifecycle state of a server record.
///
/// Within one generation, transitions move strictly forward through
/// `disconnected → connecting → handshaking → ready`; `oauth-required` and
/// `failed` are terminal for their generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    /// No session; the record is idle.
    Disconnected,
    /// A transport is being opened.
    Connecting,
    /// The transport is up and the MCP handshake is in flight.
    Handshaking,
    /// The session is fully negotiated and usable.
    Ready,
    /// The server demanded OAuth credentials the client does not hold.
    OauthRequired,
    /// Connection attempts were exhausted.
    Failed,
}

/// A capability flag advertised by a connected server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// `tools/list`, `tools/call`
    Tools,
    /// `resources/list`, `resources/read`
    Resources,
    /// `prompts/list`, `prompts/get`
    Prompts,
    /// `logging/setLevel`, `notifications/message`
    Logging,
    /// Server-initiated `elicitation/create`
    Elicitation,
    /// Long-running tasks
    Tasks,
}

/// Flatten the wire capability object into the flag set the records carry.
pub fn capability_flags(caps: &ServerCapabilities) -> Vec<Capability> {
    let mut flags = Vec::new();
    if caps.tools.is_some() {
        flags.push(Capability::Tools);
    }
    if caps.resources.is_some() {
        flags.push(Capability::Resources);
    }
    if caps.prompts.is_some() {
        flags.push(Capability::Prompts);
    }
    if caps.logging.is_some() {
        flags.push(Capability::Logging);
    }
    if caps.elicitation.is_some() {
        flags.push(Capability::Elicitation);
    }
    if caps.tasks.is_some() {
        flags.push(Capability::Tasks);
    }
    flags
}

/// The manager-owned state for one configured server.
#[derive(Debug, Clone)]
pub struct ServerRecord {
    /// Opaque unique id within this process.
    pub id: String,
    /// Human label.
    pub name: String,
    /// How to reach the server.
    pub config: ServerConfig,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Last connection or transport error, if any.
    pub last_error: Option<String>,
    /// Connection attempts consumed by the current reconnection cycle.
    pub retry_count: u32,
    /// Capability flags from the most recent successful handshake.
    pub caps: Vec<Capability>,
    /// Negotiated protocol version.
    pub protocol_version: Option<String>,
    /// Server implementation version string.
    pub server_version: Option<String>,
    /// Monotonic session generation, starting at 0.
    pub generation: u64,
}

impl ServerRecord {
    /// A fresh record in state `disconnected`, generation 0.
    pub fn new(id: String, name: String, config: ServerConfig) -> Self {
        Self {
            id,
            name,
            config,
            state: ServerState::Disconnected,
            last_error: None,
            retry_count: 0,
            caps: Vec::new(),
            protocol_version: None,
            server_version: None,
            generation: 0,
        }
    }

    /// The serializable view handed out over HTTP.
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
            retry_count: self.retry_count,
            caps: self.caps.clone(),
            protocol_version: self.protocol_version.clone(),
            server_version: self.server_version.clone(),
        }
    }
}

/// Wire view of a [`ServerRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    /// Opaque unique id.
    pub id: String,
    /// Human label.
    pub name: String,
    /// How the server is reached.
    pub config: ServerConfig,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Last error text, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Connection attempts consumed by the current reconnection cycle.
    pub retry_count: u32,
    /// Advertised capability flags.
    pub caps: Vec<Capability>,
    /// Negotiated protocol version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    /// Server implementation version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}
