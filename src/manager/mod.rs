//! MCP client manager
//!
//! The [`ClientManager`] owns the set of server records and their live
//! sessions. It routes operations to the right session, taps every RPC onto
//! the log bus, supervises reconnection with jittered exponential backoff,
//! and reacts to server-initiated traffic arriving on its inbox:
//! elicitation requests are brokered through the event hub, progress
//! notifications are routed to registered sinks, and tool-list-changed
//! notifications invalidate the per-server tool cache.
//!
//! # Concurrency
//!
//! Operations against distinct sessions run concurrently with no shared
//! locks; operations against the same session are safe because the
//! session's request/response correlation handles interleaving. The record
//! table is the only shared mutable structure: every mutation happens under
//! one write lock, and readers observe consistent snapshots.
//!
//! # Generations
//!
//! Each record carries a generation counter starting at 0. Every session
//! establishment and every teardown bumps it; inbox messages tagged with a
//! stale generation are discarded. This is what guarantees that a server is
//! never observed through two sessions at once.

pub mod record;
pub mod session;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};

use crate::config::Settings;
use crate::error::{code_of, ErrorCode, McpLensError, Result};
use crate::hub::elicitation::ElicitationBroker;
use crate::hub::{EventHub, Topic};
use crate::mcp::client::{BoxFuture, SessionEvent};
use crate::mcp::protocol::{
    InitializedMcpProtocol, McpProtocol, ServerCapabilityFlag, ToolOutcome,
};
use crate::mcp::transport::{open_transport, ServerConfig};
use crate::mcp::types::{
    ClientCapabilities, ElicitationCreateParams, ElicitationResult, GetPromptResponse,
    Implementation, ListPromptsResponse, ListResourcesResponse, ListToolsResponse, LoggingLevel,
    McpTool, ProgressParams, ResourceContents, TaskParams, METHOD_ELICITATION_CREATE,
    METHOD_PING, NOTIF_PROGRESS, NOTIF_TOOLS_LIST_CHANGED,
};

pub use record::{Capability, ServerRecord, ServerSnapshot, ServerState};
pub use session::ManagerMessage;

use record::capability_flags;
use session::{wire_transport, SessionHandle};

struct ServerEntry {
    record: ServerRecord,
    session: Option<Arc<SessionHandle>>,
}

/// Per-session override for server-initiated `elicitation/create` requests.
///
/// The default behavior brokers elicitations through the event hub so SSE
/// subscribers can answer them; embedders install an override when they want
/// to resolve a specific server's elicitations programmatically.
pub trait ElicitationHandler: Send + Sync {
    /// Produce the response for one elicitation request.
    fn handle<'a>(
        &'a self,
        server_id: &'a str,
        params: ElicitationCreateParams,
    ) -> BoxFuture<'a, Result<ElicitationResult>>;
}

/// The process-wide MCP client manager.
///
/// Created once at startup with [`ClientManager::new`]; the returned `Arc`
/// is shared by the HTTP edge and the chat engine.
pub struct ClientManager {
    settings: Settings,
    hub: Arc<EventHub>,
    elicitation: Arc<ElicitationBroker>,
    servers: RwLock<HashMap<String, ServerEntry>>,
    inbox_tx: mpsc::UnboundedSender<ManagerMessage>,
    /// Progress-token -> sink for in-flight tool calls that asked for
    /// incremental progress.
    progress_sinks: StdMutex<HashMap<String, mpsc::UnboundedSender<ProgressParams>>>,
    /// Latest advertised tool list per server; invalidated on
    /// `tools/list_changed` and on session churn.
    tool_cache: StdMutex<HashMap<String, Vec<McpTool>>>,
    /// Per-server elicitation handler overrides.
    elicitation_handlers: StdMutex<HashMap<String, Arc<dyn ElicitationHandler>>>,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager").finish_non_exhaustive()
    }
}

impl ClientManager {
    /// Create the manager and start its inbox loop.
    pub fn new(
        settings: Settings,
        hub: Arc<EventHub>,
        elicitation: Arc<ElicitationBroker>,
    ) -> Arc<Self> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            settings,
            hub,
            elicitation,
            servers: RwLock::new(HashMap::new()),
            inbox_tx,
            progress_sinks: StdMutex::new(HashMap::new()),
            tool_cache: StdMutex::new(HashMap::new()),
            elicitation_handlers: StdMutex::new(HashMap::new()),
        });

        tokio::spawn(inbox_loop(Arc::downgrade(&manager), inbox_rx));
        manager
    }

    /// The hub this manager publishes on.
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The elicitation broker serving this manager's sessions.
    pub fn elicitation(&self) -> &Arc<ElicitationBroker> {
        &self.elicitation
    }

    /// The ambient settings (timeouts, reconnect policy, web mode).
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Install a per-server elicitation handler, replacing the hub-brokered
    /// default (and any previous override) for that server.
    pub fn set_elicitation_handler(&self, id: &str, handler: Arc<dyn ElicitationHandler>) {
        let mut handlers = self
            .elicitation_handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        handlers.insert(id.to_string(), handler);
    }

    /// Remove a per-server elicitation handler, restoring the default.
    pub fn clear_elicitation_handler(&self, id: &str) {
        let mut handlers = self
            .elicitation_handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        handlers.remove(id);
    }

    // -----------------------------------------------------------------
    // Record lifecycle
    // -----------------------------------------------------------------

    /// Create a server record in state `disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::Validation`] when the id is empty or already
    /// taken.
    pub async fn add_server(
        &self,
        id: String,
        name: String,
        config: ServerConfig,
    ) -> Result<ServerSnapshot> {
        if id.is_empty() {
            return Err(McpLensError::Validation("server id must not be empty".into()).into());
        }

        let mut servers = self.servers.write().await;
        if servers.contains_key(&id) {
            return Err(
                McpLensError::Validation(format!("server `{id}` already exists")).into(),
            );
        }

        let record = ServerRecord::new(id.clone(), name, config);
        let snapshot = record.snapshot();
        servers.insert(
            id,
            ServerEntry {
                record,
                session: None,
            },
        );
        Ok(snapshot)
    }

    /// Snapshot every record.
    pub async fn list_servers(&self) -> Vec<ServerSnapshot> {
        let servers = self.servers.read().await;
        let mut out: Vec<ServerSnapshot> =
            servers.values().map(|e| e.record.snapshot()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Snapshot one record.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::NotFound`] for unknown ids.
    pub async fn get_server(&self, id: &str) -> Result<ServerSnapshot> {
        let servers = self.servers.read().await;
        servers
            .get(id)
            .map(|e| e.record.snapshot())
            .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")).into())
    }

    /// Drive a record through `connecting → handshaking → ready`.
    ///
    /// Any existing session is torn down first; the generation is bumped so
    /// frames from the old session are discarded. Success publishes
    /// `server-ready`; failure records `lastError`, increments `retryCount`,
    /// and leaves the record in `failed` (or `oauth-required` when the
    /// server demanded credentials).
    pub async fn connect(&self, id: &str) -> Result<ServerSnapshot> {
        // Single-writer: claim a new generation and tear out the old session.
        let (config, generation, old_session) = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .get_mut(id)
                .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")))?;
            entry.record.generation += 1;
            entry.record.state = ServerState::Connecting;
            entry.record.last_error = None;
            (
                entry.record.config.clone(),
                entry.record.generation,
                entry.session.take(),
            )
        };
        self.invalidate_tool_cache(id);
        if let Some(old) = old_session {
            old.shutdown().await;
        }
        self.elicitation.cancel_for_server(id).await;

        match self.establish(id, generation, &config).await {
            Ok(handle) => {
                let snapshot = {
                    let mut servers = self.servers.write().await;
                    let entry = servers
                        .get_mut(id)
                        .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")))?;
                    if entry.record.generation != generation {
                        // The record moved on (remove/reconnect race); this
                        // session is already stale.
                        drop(servers);
                        handle.shutdown().await;
                        return Err(McpLensError::Cancelled(format!(
                            "connect superseded for server `{id}`"
                        ))
                        .into());
                    }
                    let init = &handle.protocol.initialize_response;
                    entry.record.caps = capability_flags(&init.capabilities);
                    entry.record.protocol_version = Some(init.protocol_version.clone());
                    entry.record.server_version = Some(init.server_info.version.clone());
                    entry.record.state = ServerState::Ready;
                    entry.record.last_error = None;
                    entry.session = Some(Arc::new(handle));
                    entry.record.snapshot()
                };
                tracing::info!(server = %id, generation, "server ready");
                self.hub.publish(
                    Topic::RpcLog,
                    serde_json::json!({ "type": "server-ready", "serverId": id }),
                );
                Ok(snapshot)
            }
            Err(e) => {
                let failed_state = if code_of(&e) == ErrorCode::Unauthorized {
                    ServerState::OauthRequired
                } else {
                    ServerState::Failed
                };
                {
                    let mut servers = self.servers.write().await;
                    if let Some(entry) = servers.get_mut(id) {
                        if entry.record.generation == generation {
                            entry.record.state = failed_state;
                            entry.record.last_error = Some(format!("{e:#}"));
                            entry.record.retry_count += 1;
                        }
                    }
                }
                tracing::warn!(server = %id, "connect failed: {e:#}");
                self.hub.publish(
                    Topic::RpcLog,
                    serde_json::json!({
                        "type": "server-error",
                        "serverId": id,
                        "error": format!("{e:#}"),
                    }),
                );
                Err(e)
            }
        }
    }

    /// Close the session and return the record to `disconnected`.
    ///
    /// The record itself is kept.
    pub async fn disconnect(&self, id: &str) -> Result<ServerSnapshot> {
        let (session, snapshot) = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .get_mut(id)
                .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")))?;
            entry.record.generation += 1;
            entry.record.state = ServerState::Disconnected;
            (entry.session.take(), entry.record.snapshot())
        };
        self.invalidate_tool_cache(id);
        if let Some(session) = session {
            session.shutdown().await;
        }
        self.elicitation.cancel_for_server(id).await;
        Ok(snapshot)
    }

    /// Disconnect and drop the record.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let session = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .remove(id)
                .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")))?;
            entry.session
        };
        self.invalidate_tool_cache(id);
        self.clear_elicitation_handler(id);
        if let Some(session) = session {
            session.shutdown().await;
        }
        self.elicitation.cancel_for_server(id).await;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------

    /// One page of tools; the cursor is passed through verbatim.
    pub async fn list_tools(&self, id: &str, cursor: Option<String>) -> Result<ListToolsResponse> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .list_tools(cursor, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// Every advertised tool, served from the per-server cache when warm.
    pub async fn list_all_tools(&self, id: &str) -> Result<Vec<McpTool>> {
        {
            let cache = self.tool_cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(tools) = cache.get(id) {
                return Ok(tools.clone());
            }
        }
        let session = self.ready_session(id).await?;
        let tools = session
            .protocol
            .list_all_tools(Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))?;
        let mut cache = self.tool_cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.insert(id.to_string(), tools.clone());
        Ok(tools)
    }

    /// Invoke a tool, optionally streaming progress to `on_progress`.
    ///
    /// When a progress sink is supplied, a fresh progress token is attached
    /// to the call's `_meta` and `notifications/progress` messages carrying
    /// it are routed to the sink until the call completes.
    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Option<serde_json::Value>,
        task: Option<TaskParams>,
        on_progress: Option<mpsc::UnboundedSender<ProgressParams>>,
        timeout: Option<Duration>,
    ) -> Result<ToolOutcome> {
        let session = self.ready_session(id).await?;

        let token = on_progress.map(|sink| {
            let token = uuid::Uuid::new_v4().to_string();
            let mut sinks = self
                .progress_sinks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            sinks.insert(token.clone(), sink);
            token
        });
        let meta = token
            .as_ref()
            .map(|t| serde_json::json!({ "progressToken": t }));

        let outcome = session
            .protocol
            .call_tool(
                name,
                arguments,
                meta,
                task,
                Some(timeout.unwrap_or(self.settings.timeouts.tool)),
            )
            .await;

        if let Some(token) = token {
            let mut sinks = self
                .progress_sinks
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            sinks.remove(&token);
        }

        outcome.map_err(|e| self.annotate(id, e))
    }

    /// One page of resources; the cursor is passed through verbatim.
    pub async fn list_resources(
        &self,
        id: &str,
        cursor: Option<String>,
    ) -> Result<ListResourcesResponse> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .list_resources(cursor, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, id: &str, uri: &str) -> Result<Vec<ResourceContents>> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .read_resource(uri, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// One page of prompts; the cursor is passed through verbatim.
    pub async fn list_prompts(
        &self,
        id: &str,
        cursor: Option<String>,
    ) -> Result<ListPromptsResponse> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .list_prompts(cursor, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// Render a prompt with arguments.
    pub async fn get_prompt(
        &self,
        id: &str,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .get_prompt(name, arguments, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// Round-trip a ping and return the elapsed duration.
    pub async fn ping(&self, id: &str) -> Result<Duration> {
        let session = self.ready_session(id).await?;
        session
            .protocol
            .ping(Some(self.settings.timeouts.ping))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    /// Forward `logging/setLevel`, gated on the advertised capability.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::FeatureNotSupported`] when the server did not
    /// advertise `logging`.
    pub async fn set_log_level(&self, id: &str, level: LoggingLevel) -> Result<()> {
        let session = self.ready_session(id).await?;
        if !session.protocol.capable(ServerCapabilityFlag::Logging) {
            return Err(McpLensError::FeatureNotSupported(format!(
                "server `{id}` does not advertise the logging capability"
            ))
            .into());
        }
        session
            .protocol
            .set_log_level(level, Some(self.settings.timeouts.tool))
            .await
            .map_err(|e| self.annotate(id, e))
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn ready_session(&self, id: &str) -> Result<Arc<SessionHandle>> {
        let servers = self.servers.read().await;
        let entry = servers
            .get(id)
            .ok_or_else(|| McpLensError::NotFound(format!("unknown server `{id}`")))?;
        if entry.record.state != ServerState::Ready {
            return Err(McpLensError::NotConnected(format!(
                "server `{id}` is {:?}",
                entry.record.state
            ))
            .into());
        }
        entry
            .session
            .clone()
            .ok_or_else(|| McpLensError::NotConnected(format!("server `{id}` has no session")).into())
    }

    /// Open the transport, wire the pumps, and run the handshake.
    async fn establish(
        &self,
        id: &str,
        generation: u64,
        config: &ServerConfig,
    ) -> Result<SessionHandle> {
        let transport = open_transport(
            config,
            self.settings.web_mode,
            self.settings.timeouts.tool,
        )?;

        let wired = wire_transport(
            id,
            generation,
            Arc::clone(&transport),
            Arc::clone(&self.hub),
            self.inbox_tx.clone(),
        );

        {
            let mut servers = self.servers.write().await;
            if let Some(entry) = servers.get_mut(id) {
                if entry.record.generation == generation {
                    entry.record.state = ServerState::Handshaking;
                }
            }
        }

        let protocol = McpProtocol::new(Arc::clone(&wired.client));
        let initialized: InitializedMcpProtocol = match protocol
            .initialize(
                Implementation {
                    name: "mcplens".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    description: None,
                },
                ClientCapabilities::advertised(),
                Some(self.settings.timeouts.connect),
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                wired.cancel.cancel();
                transport.close().await;
                return Err(e);
            }
        };

        if let Err(e) = transport.open_push_stream().await {
            tracing::warn!(server = %id, "push stream unavailable: {e:#}");
        }

        Ok(SessionHandle {
            generation,
            protocol: initialized,
            transport,
            cancel: wired.cancel,
        })
    }

    fn invalidate_tool_cache(&self, id: &str) {
        let mut cache = self.tool_cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.remove(id);
    }

    /// Attach the server id to an operation error and publish it.
    fn annotate(&self, id: &str, e: anyhow::Error) -> anyhow::Error {
        self.hub.publish(
            Topic::RpcLog,
            serde_json::json!({
                "type": "server-error",
                "serverId": id,
                "error": format!("{e:#}"),
            }),
        );
        e.context(format!("server `{id}`"))
    }

    /// React to one inbox message from a session's read loop.
    async fn handle_message(self: Arc<Self>, msg: ManagerMessage) {
        // Discard anything from a generation that is no longer current.
        let current = {
            let servers = self.servers.read().await;
            servers.get(&msg.server_id).map(|e| e.record.generation)
        };
        if current != Some(msg.generation) {
            tracing::debug!(
                server = %msg.server_id,
                generation = msg.generation,
                "dropping event from stale generation"
            );
            return;
        }

        match msg.event {
            SessionEvent::Notification { method, params } => {
                self.handle_notification(&msg.server_id, &method, params).await;
            }
            SessionEvent::ServerRequest { id, method, params } => {
                self.handle_server_request(&msg.server_id, id, &method, params)
                    .await;
            }
            SessionEvent::Closed { reason } => {
                let weak = Arc::downgrade(&self);
                self.handle_closed(&msg.server_id, msg.generation, reason, weak)
                    .await;
            }
        }
    }

    async fn handle_notification(
        &self,
        server_id: &str,
        method: &str,
        params: serde_json::Value,
    ) {
        match method {
            NOTIF_TOOLS_LIST_CHANGED => {
                self.invalidate_tool_cache(server_id);
            }
            NOTIF_PROGRESS => {
                let Ok(progress) = serde_json::from_value::<ProgressParams>(params) else {
                    tracing::debug!(server = %server_id, "malformed progress notification");
                    return;
                };
                let key = progress
                    .progress_token
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| progress.progress_token.to_string());
                let sink = {
                    let sinks = self
                        .progress_sinks
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    sinks.get(&key).cloned()
                };
                if let Some(sink) = sink {
                    let _ = sink.send(progress);
                }
            }
            // Log records and list-changed notifications for resources and
            // prompts already reach subscribers through the rpc-log tap.
            _ => {}
        }
    }

    async fn handle_server_request(
        &self,
        server_id: &str,
        request_id: serde_json::Value,
        method: &str,
        params: serde_json::Value,
    ) {
        let Ok(session) = self.ready_session(server_id).await else {
            return;
        };
        let client = Arc::clone(&session.protocol.client);

        match method {
            METHOD_ELICITATION_CREATE => {
                let parsed: ElicitationCreateParams = match serde_json::from_value(params) {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = client.respond_error(
                            request_id,
                            -32602,
                            &format!("Invalid params: {e}"),
                        );
                        return;
                    }
                };

                let override_handler = {
                    let handlers = self
                        .elicitation_handlers
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    handlers.get(server_id).cloned()
                };

                // Resolution can wait minutes; never block the inbox loop.
                let broker = Arc::clone(&self.elicitation);
                let server_id = server_id.to_string();
                let deadline = self.settings.timeouts.elicitation;
                tokio::spawn(async move {
                    let result = match override_handler {
                        Some(handler) => match handler.handle(&server_id, parsed).await {
                            Ok(result) => result,
                            Err(e) => {
                                let _ = client.respond_error(
                                    request_id,
                                    -32603,
                                    &format!("elicitation handler failed: {e:#}"),
                                );
                                return;
                            }
                        },
                        None => broker.request(&server_id, parsed, deadline).await,
                    };
                    let value =
                        serde_json::to_value(result).unwrap_or(serde_json::Value::Null);
                    let _ = client.respond(request_id, value);
                });
            }
            METHOD_PING => {
                let _ = client.respond(request_id, serde_json::json!({}));
            }
            other => {
                let _ = client.respond_error(
                    request_id,
                    -32601,
                    &format!("Method not found: {other}"),
                );
            }
        }
    }

    /// The session for `generation` died. If it was ready, supervise a
    /// reconnection cycle; otherwise the in-flight `connect` owns the
    /// failure.
    async fn handle_closed(
        &self,
        server_id: &str,
        generation: u64,
        reason: String,
        weak: Weak<Self>,
    ) {
        let should_reconnect = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(server_id) else {
                return;
            };
            if entry.record.generation != generation || entry.record.state != ServerState::Ready {
                return;
            }
            let diagnostics = entry.session.as_ref().and_then(|s| s.diagnostics());
            let last_error = match diagnostics {
                Some(tail) => format!("{reason}; stderr tail:\n{tail}"),
                None => reason.clone(),
            };
            entry.record.generation += 1;
            entry.record.state = ServerState::Connecting;
            entry.record.last_error = Some(last_error);
            entry.record.retry_count = 0;
            entry.session.take()
        };
        self.invalidate_tool_cache(server_id);
        if let Some(session) = should_reconnect {
            session.shutdown().await;
        }
        self.elicitation.cancel_for_server(server_id).await;

        tracing::warn!(server = %server_id, "session closed unexpectedly: {reason}");
        self.hub.publish(
            Topic::RpcLog,
            serde_json::json!({
                "type": "server-error",
                "serverId": server_id,
                "error": reason,
            }),
        );

        tokio::spawn(supervise_reconnect(weak, server_id.to_string()));
    }
}

/// Drains the shared inbox, reacting to each session event in arrival
/// order. Exits when the manager is dropped.
async fn inbox_loop(
    manager: Weak<ClientManager>,
    mut inbox_rx: mpsc::UnboundedReceiver<ManagerMessage>,
) {
    while let Some(msg) = inbox_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_message(msg).await;
    }
}

/// Reconnection supervision: bounded, jittered exponential backoff.
///
/// Each attempt goes through the full `connect` path. Success records the
/// number of attempts consumed; exhaustion leaves the record `failed`.
async fn supervise_reconnect(manager: Weak<ClientManager>, server_id: String) {
    let policy = {
        let Some(manager) = manager.upgrade() else {
            return;
        };
        manager.settings.reconnect.clone()
    };

    for attempt in 0..policy.max_attempts {
        tokio::time::sleep(policy.delay_for(attempt)).await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        match manager.connect(&server_id).await {
            Ok(_) => {
                let mut servers = manager.servers.write().await;
                if let Some(entry) = servers.get_mut(&server_id) {
                    entry.record.retry_count = attempt + 1;
                }
                tracing::info!(
                    server = %server_id,
                    attempts = attempt + 1,
                    "reconnected"
                );
                return;
            }
            Err(e) => {
                // `connect` already recorded lastError and bumped retryCount.
                tracing::warn!(
                    server = %server_id,
                    attempt = attempt + 1,
                    "reconnect attempt failed: {e:#}"
                );
            }
        }
    }

    tracing::warn!(server = %server_id, "reconnect attempts exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_manager() -> Arc<ClientManager> {
        let hub = Arc::new(EventHub::new());
        let broker = Arc::new(ElicitationBroker::new(Arc::clone(&hub)));
        ClientManager::new(Settings::default(), hub, broker)
    }

    fn stdio_config(command: &str) -> ServerConfig {
        serde_json::from_value(serde_json::json!({ "command": command })).unwrap()
    }

    #[tokio::test]
    async fn test_add_list_get_remove() {
        let manager = make_manager();

        let snap = manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();
        assert_eq!(snap.state, ServerState::Disconnected);
        assert_eq!(snap.retry_count, 0);

        let all = manager.list_servers().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "srv1");

        let got = manager.get_server("srv1").await.unwrap();
        assert_eq!(got.name, "One");

        manager.remove_server("srv1").await.unwrap();
        assert!(manager.list_servers().await.is_empty());
        assert!(manager.get_server("srv1").await.is_err());
    }

    #[tokio::test]
    async fn test_add_duplicate_id_rejected() {
        let manager = make_manager();
        manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();
        let dup = manager
            .add_server("srv1".into(), "Two".into(), stdio_config("cat"))
            .await;
        assert!(dup.is_err());
        assert!(dup.unwrap_err().to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_add_remove_add_yields_fresh_record() {
        let manager = make_manager();
        manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();
        manager.remove_server("srv1").await.unwrap();
        let again = manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();
        assert_eq!(again.state, ServerState::Disconnected);
        assert_eq!(again.retry_count, 0);
    }

    #[tokio::test]
    async fn test_ops_on_disconnected_server_fail_not_connected() {
        let manager = make_manager();
        manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();

        let result = manager.list_tools("srv1", None).await;
        assert!(result.is_err());
        assert_eq!(code_of(&result.unwrap_err()), ErrorCode::ServerUnreachable);

        let result = manager.ping("srv1").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ops_on_unknown_server_fail_not_found() {
        let manager = make_manager();
        let result = manager.list_tools("ghost", None).await;
        assert!(result.is_err());
        assert_eq!(code_of(&result.unwrap_err()), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_connect_unknown_server_fails_not_found() {
        let manager = make_manager();
        let result = manager.connect("ghost").await;
        assert!(result.is_err());
        assert_eq!(code_of(&result.unwrap_err()), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_connect_spawn_failure_marks_failed_and_counts_retry() {
        let manager = make_manager();
        manager
            .add_server(
                "srv1".into(),
                "One".into(),
                stdio_config("/nonexistent/mcp/server/binary"),
            )
            .await
            .unwrap();

        let result = manager.connect("srv1").await;
        assert!(result.is_err());

        let snap = manager.get_server("srv1").await.unwrap();
        assert_eq!(snap.state, ServerState::Failed);
        assert_eq!(snap.retry_count, 1);
        assert!(snap.last_error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_connect_failure_publishes_server_error() {
        let manager = make_manager();
        let mut log = manager.hub().subscribe(Topic::RpcLog);
        manager
            .add_server(
                "srv1".into(),
                "One".into(),
                stdio_config("/nonexistent/mcp/server/binary"),
            )
            .await
            .unwrap();
        let _ = manager.connect("srv1").await;

        let event = tokio::time::timeout(Duration::from_secs(2), log.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event["type"], "server-error");
        assert_eq!(event["serverId"], "srv1");
    }

    #[tokio::test]
    async fn test_stdio_forbidden_in_web_mode() {
        let hub = Arc::new(EventHub::new());
        let broker = Arc::new(ElicitationBroker::new(Arc::clone(&hub)));
        let settings = Settings {
            web_mode: true,
            ..Default::default()
        };
        let manager = ClientManager::new(settings, hub, broker);

        manager
            .add_server("srv1".into(), "One".into(), stdio_config("cat"))
            .await
            .unwrap();
        let result = manager.connect("srv1").await;
        assert!(result.is_err());
        assert_eq!(code_of(&result.unwrap_err()), ErrorCode::Forbidden);
    }
}
