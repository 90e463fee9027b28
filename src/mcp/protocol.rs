//! Typed MCP lifecycle wrapper over [`JsonRpcClient`]
//!
//! Two types represent the two phases of an MCP client session:
//!
//! - [`McpProtocol`] -- an uninitialized client. Call
//!   [`McpProtocol::initialize`] to perform the `initialize` /
//!   `notifications/initialized` handshake and receive an
//!   [`InitializedMcpProtocol`].
//! - [`InitializedMcpProtocol`] -- a fully negotiated session exposing the
//!   MCP operations as typed async methods.
//!
//! Pagination cursors are passed through verbatim: each `list_*` call is one
//! page. [`InitializedMcpProtocol::list_all_tools`] follows `nextCursor` to
//! exhaustion for callers (the chat engine) that need the full set.
//!
//! Neither type owns a transport; callers wire up channels externally and
//! pass the shared [`JsonRpcClient`] in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{McpLensError, Result};
use crate::mcp::client::JsonRpcClient;
use crate::mcp::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, CreateTaskResult, GetPromptParams,
    GetPromptResponse, Implementation, InitializeParams, InitializeResponse, ListPromptsResponse,
    ListResourcesResponse, ListToolsResponse, LoggingLevel, McpTool, PaginatedParams,
    ReadResourceParams, ReadResourceResponse, ResourceContents, SetLevelParams, Task,
    TaskParams, TaskRefParams, LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_LOGGING_SET_LEVEL, METHOD_PING, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_TASKS_CANCEL, METHOD_TASKS_GET,
    METHOD_TASKS_RESULT, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Identifies a specific capability that may be advertised by a server.
///
/// Used with [`InitializedMcpProtocol::capable`] to check whether the
/// negotiated server supports a given feature before issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// Server exposes tools via `tools/list` and `tools/call`.
    Tools,
    /// Server exposes resources via `resources/list` and `resources/read`.
    Resources,
    /// Server exposes prompts via `prompts/list` and `prompts/get`.
    Prompts,
    /// Server supports `logging/setLevel` and log notifications.
    Logging,
    /// Server may issue `elicitation/create` requests.
    Elicitation,
    /// Server supports long-running tasks.
    Tasks,
}

/// The outcome of a `tools/call`: either direct content or a task envelope.
///
/// Servers that support long-running tasks may answer `tools/call` with a
/// `task` object instead of content. The two are surfaced distinctly so that
/// callers can opt into task polling.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool produced its result inline.
    Content(CallToolResponse),
    /// The server created a task; poll `tasks/get` and fetch `tasks/result`.
    Task(CreateTaskResult),
}

/// An uninitialized MCP client session.
///
/// Wraps a shared [`JsonRpcClient`] and provides a single method,
/// [`McpProtocol::initialize`], which performs the MCP handshake and returns
/// an [`InitializedMcpProtocol`] ready for use.
#[derive(Debug)]
pub struct McpProtocol {
    client: Arc<JsonRpcClient>,
}

impl McpProtocol {
    /// Create a new uninitialized MCP protocol session.
    ///
    /// The caller must have already started the read loop on the same
    /// client (see [`crate::mcp::client::start_read_loop`]).
    pub fn new(client: Arc<JsonRpcClient>) -> Self {
        Self { client }
    }

    /// Perform the MCP `initialize` / `notifications/initialized` handshake.
    ///
    /// Sends an `initialize` request with the given client identity and
    /// capabilities, verifies that the server's chosen protocol version is
    /// in [`SUPPORTED_PROTOCOL_VERSIONS`], sends the
    /// `notifications/initialized` notification, and returns an
    /// [`InitializedMcpProtocol`].
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::ProtocolVersion`] if the server selects a
    /// version this client does not accept, plus any transport or timeout
    /// error from the underlying request.
    pub async fn initialize(
        self,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        timeout: Option<Duration>,
    ) -> Result<InitializedMcpProtocol> {
        let response: InitializeResponse = self
            .client
            .request(
                METHOD_INITIALIZE,
                InitializeParams {
                    protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                    capabilities,
                    client_info,
                },
                timeout,
            )
            .await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            return Err(McpLensError::ProtocolVersion {
                expected: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        // Fire-and-forget the initialized notification; errors are not fatal.
        let _ = self.client.notify(METHOD_INITIALIZED, serde_json::json!({}));

        Ok(InitializedMcpProtocol {
            client: self.client,
            initialize_response: response,
        })
    }
}

/// A fully negotiated MCP client session.
///
/// Created by [`McpProtocol::initialize`].
#[derive(Debug)]
pub struct InitializedMcpProtocol {
    /// The underlying JSON-RPC client, shared with the read loop.
    pub client: Arc<JsonRpcClient>,
    /// The server's response to the `initialize` request.
    pub initialize_response: InitializeResponse,
}

impl InitializedMcpProtocol {
    /// Check whether the server advertises a specific capability.
    pub fn capable(&self, capability: ServerCapabilityFlag) -> bool {
        let caps = &self.initialize_response.capabilities;
        match capability {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
            ServerCapabilityFlag::Elicitation => caps.elicitation.is_some(),
            ServerCapabilityFlag::Tasks => caps.tasks.is_some(),
        }
    }

    /// Request one page of tools, passing the cursor through verbatim.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or times out.
    pub async fn list_tools(
        &self,
        cursor: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<ListToolsResponse> {
        self.client
            .request(METHOD_TOOLS_LIST, PaginatedParams { cursor }, timeout)
            .await
    }

    /// List every tool the server advertises, following `nextCursor` until
    /// the server returns none.
    ///
    /// # Errors
    ///
    /// Returns an error if any paged request fails.
    pub async fn list_all_tools(&self, timeout: Option<Duration>) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let resp = self.list_tools(cursor, timeout).await?;
            tools.extend(resp.tools);
            match resp.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }

        Ok(tools)
    }

    /// Invoke a named tool on the server.
    ///
    /// Responses carrying a `task` envelope are surfaced as
    /// [`ToolOutcome::Task`] so callers can opt into polling; everything
    /// else is parsed as a normal content result.
    ///
    /// # Arguments
    ///
    /// * `name` - The tool name as returned by `tools/list`.
    /// * `arguments` - JSON arguments matching the tool's `inputSchema`.
    /// * `meta` - Optional `_meta` object (carries the progress token).
    /// * `task` - Optional task-wrapping parameters.
    /// * `timeout` - Per-call deadline.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, times out, or the response is
    /// neither a content result nor a task envelope.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
        meta: Option<serde_json::Value>,
        task: Option<TaskParams>,
        timeout: Option<Duration>,
    ) -> Result<ToolOutcome> {
        let raw: serde_json::Value = self
            .client
            .request(
                METHOD_TOOLS_CALL,
                CallToolParams {
                    name: name.to_string(),
                    arguments,
                    meta,
                    task,
                },
                timeout,
            )
            .await?;

        if raw.get("task").is_some() {
            let envelope: CreateTaskResult = serde_json::from_value(raw)?;
            return Ok(ToolOutcome::Task(envelope));
        }

        let response: CallToolResponse = serde_json::from_value(raw)?;
        Ok(ToolOutcome::Content(response))
    }

    /// Request one page of resources, passing the cursor through verbatim.
    pub async fn list_resources(
        &self,
        cursor: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<ListResourcesResponse> {
        self.client
            .request(METHOD_RESOURCES_LIST, PaginatedParams { cursor }, timeout)
            .await
    }

    /// Read the contents of a resource by URI.
    pub async fn read_resource(
        &self,
        uri: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResourceContents>> {
        let resp: ReadResourceResponse = self
            .client
            .request(
                METHOD_RESOURCES_READ,
                ReadResourceParams {
                    uri: uri.to_string(),
                },
                timeout,
            )
            .await?;
        Ok(resp.contents)
    }

    /// Request one page of prompts, passing the cursor through verbatim.
    pub async fn list_prompts(
        &self,
        cursor: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<ListPromptsResponse> {
        self.client
            .request(METHOD_PROMPTS_LIST, PaginatedParams { cursor }, timeout)
            .await
    }

    /// Retrieve a rendered prompt by name, substituting template arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
        timeout: Option<Duration>,
    ) -> Result<GetPromptResponse> {
        self.client
            .request(
                METHOD_PROMPTS_GET,
                GetPromptParams {
                    name: name.to_string(),
                    arguments,
                },
                timeout,
            )
            .await
    }

    /// Round-trip a `ping` and return the elapsed duration.
    ///
    /// # Errors
    ///
    /// Returns an error if the request times out or the channel is closed.
    pub async fn ping(&self, timeout: Option<Duration>) -> Result<Duration> {
        let started = tokio::time::Instant::now();
        let _: serde_json::Value = self
            .client
            .request(METHOD_PING, serde_json::json!({}), timeout)
            .await?;
        Ok(started.elapsed())
    }

    /// Forward a `logging/setLevel` request.
    ///
    /// The capability gate lives in the manager; this method assumes the
    /// server advertises `logging`.
    pub async fn set_log_level(
        &self,
        level: LoggingLevel,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .request(METHOD_LOGGING_SET_LEVEL, SetLevelParams { level }, timeout)
            .await?;
        Ok(())
    }

    /// Retrieve the current state of a long-running task.
    pub async fn tasks_get(&self, task_id: &str, timeout: Option<Duration>) -> Result<Task> {
        self.client
            .request(
                METHOD_TASKS_GET,
                TaskRefParams {
                    task_id: task_id.to_string(),
                },
                timeout,
            )
            .await
    }

    /// Retrieve the final result of a completed task.
    pub async fn tasks_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<CallToolResponse> {
        self.client
            .request(
                METHOD_TASKS_RESULT,
                TaskRefParams {
                    task_id: task_id.to_string(),
                },
                timeout,
            )
            .await
    }

    /// Request cancellation of a running task.
    pub async fn tasks_cancel(&self, task_id: &str, timeout: Option<Duration>) -> Result<Task> {
        self.client
            .request(
                METHOD_TASKS_CANCEL,
                TaskRefParams {
                    task_id: task_id.to_string(),
                },
                timeout,
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::client::{start_read_loop, SessionEvent};
    use crate::mcp::types::ServerCapabilities;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    /// Build a wired `McpProtocol` sharing its `JsonRpcClient` with a read
    /// loop. Returns `(protocol, out_rx, in_tx, cancel_token)`.
    fn wired_protocol() -> (
        McpProtocol,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
        CancellationToken,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let token = CancellationToken::new();
        let client = Arc::new(JsonRpcClient::new(out_tx));
        start_read_loop(in_rx, token.clone(), Arc::clone(&client), ev_tx);
        (McpProtocol::new(client), out_rx, in_tx, token)
    }

    /// Build a wired `InitializedMcpProtocol` with the given capabilities.
    fn wired_session(
        capabilities: ServerCapabilities,
    ) -> (
        InitializedMcpProtocol,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
        CancellationToken,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel::<SessionEvent>();
        let token = CancellationToken::new();
        let client = Arc::new(JsonRpcClient::new(out_tx));
        start_read_loop(in_rx, token.clone(), Arc::clone(&client), ev_tx);
        let session = InitializedMcpProtocol {
            client,
            initialize_response: InitializeResponse {
                protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
                capabilities,
                server_info: Implementation {
                    name: "mock".to_string(),
                    version: "1.0".to_string(),
                    description: None,
                },
                instructions: None,
            },
        };
        (session, out_rx, in_tx, token)
    }

    /// Answer the next outbound request with the given `result` payload.
    async fn answer_next(
        out_rx: &mut mpsc::UnboundedReceiver<String>,
        in_tx: &mpsc::UnboundedSender<String>,
        result: serde_json::Value,
    ) {
        let raw = out_rx.recv().await.unwrap();
        let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let resp = serde_json::json!({
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": result
        });
        in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_capability_flags_absent_by_default() {
        let (session, _o, _i, _ct) = wired_session(ServerCapabilities::default());
        assert!(!session.capable(ServerCapabilityFlag::Tools));
        assert!(!session.capable(ServerCapabilityFlag::Logging));
        assert!(!session.capable(ServerCapabilityFlag::Elicitation));
    }

    #[tokio::test]
    async fn test_capability_flags_present() {
        let caps = ServerCapabilities {
            tools: Some(serde_json::json!({})),
            logging: Some(serde_json::json!({})),
            ..Default::default()
        };
        let (session, _o, _i, _ct) = wired_session(caps);
        assert!(session.capable(ServerCapabilityFlag::Tools));
        assert!(session.capable(ServerCapabilityFlag::Logging));
        assert!(!session.capable(ServerCapabilityFlag::Prompts));
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_protocol_version() {
        let (proto, mut out_rx, in_tx, ct) = wired_protocol();

        tokio::spawn(async move {
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {
                    "protocolVersion": "1999-01-01",
                    "capabilities": {},
                    "serverInfo": { "name": "old-server", "version": "0.0.1" }
                }
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
        });

        let result = proto
            .initialize(
                Implementation {
                    name: "mcplens".to_string(),
                    version: "0.1.0".to_string(),
                    description: None,
                },
                ClientCapabilities::advertised(),
                None,
            )
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("1999-01-01"));
        ct.cancel();
    }

    #[tokio::test]
    async fn test_initialize_succeeds_and_sends_initialized() {
        let (proto, mut out_rx, in_tx, ct) = wired_protocol();

        let responder = tokio::spawn(async move {
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(req["method"], METHOD_INITIALIZE);
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {
                    "protocolVersion": LATEST_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "test-server", "version": "1.0.0" }
                }
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();

            // The follow-up frame must be the initialized notification.
            let raw = out_rx.recv().await.unwrap();
            let notif: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(notif["method"], METHOD_INITIALIZED);
            assert!(notif.get("id").is_none());
        });

        let session = proto
            .initialize(
                Implementation {
                    name: "mcplens".to_string(),
                    version: "0.1.0".to_string(),
                    description: None,
                },
                ClientCapabilities::advertised(),
                None,
            )
            .await
            .unwrap();

        assert!(session.capable(ServerCapabilityFlag::Tools));
        responder.await.unwrap();
        ct.cancel();
    }

    #[tokio::test]
    async fn test_list_tools_single_page_passes_cursor_verbatim() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        let responder = tokio::spawn(async move {
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(req["params"]["cursor"], "opaque-cursor-42");
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": { "tools": [], "nextCursor": null }
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
        });

        let page = session
            .list_tools(Some("opaque-cursor-42".to_string()), None)
            .await
            .unwrap();
        assert!(page.tools.is_empty());
        assert!(page.next_cursor.is_none());
        responder.await.unwrap();
        ct.cancel();
    }

    #[tokio::test]
    async fn test_list_all_tools_follows_pagination() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        tokio::spawn(async move {
            // Page 1.
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {
                    "tools": [{ "name": "tool_a", "inputSchema": {} }],
                    "nextCursor": "page2"
                }
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();

            // Page 2.
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(req["params"]["cursor"], "page2");
            let resp = serde_json::json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "result": {
                    "tools": [{ "name": "tool_b", "inputSchema": {} }],
                    "nextCursor": null
                }
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
        });

        let tools = session.list_all_tools(None).await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "tool_a");
        assert_eq!(tools[1].name, "tool_b");
        ct.cancel();
    }

    #[tokio::test]
    async fn test_call_tool_content_result() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        let responder = answer_next(
            &mut out_rx,
            &in_tx,
            serde_json::json!({
                "content": [{ "type": "text", "text": "hi" }],
                "isError": false
            }),
        );
        let (outcome, ()) = tokio::join!(
            session.call_tool("echo", Some(serde_json::json!({"text": "hi"})), None, None, None),
            responder
        );

        match outcome.unwrap() {
            ToolOutcome::Content(resp) => {
                assert_eq!(resp.content.len(), 1);
                assert_eq!(resp.is_error, Some(false));
            }
            ToolOutcome::Task(_) => panic!("expected content result"),
        }
        ct.cancel();
    }

    #[tokio::test]
    async fn test_call_tool_task_envelope_surfaced_distinctly() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        let responder = answer_next(
            &mut out_rx,
            &in_tx,
            serde_json::json!({
                "task": { "taskId": "t-1", "status": "working", "pollInterval": 500 }
            }),
        );
        let (outcome, ()) = tokio::join!(
            session.call_tool("slow_tool", None, None, Some(TaskParams { ttl: Some(60) }), None),
            responder
        );

        match outcome.unwrap() {
            ToolOutcome::Task(envelope) => {
                assert_eq!(envelope.task.task_id, "t-1");
            }
            ToolOutcome::Content(_) => panic!("expected task envelope"),
        }
        ct.cancel();
    }

    #[tokio::test]
    async fn test_ping_returns_elapsed() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        let responder = answer_next(&mut out_rx, &in_tx, serde_json::json!({}));
        let (elapsed, ()) = tokio::join!(session.ping(None), responder);
        // A locally answered ping is fast but always non-negative.
        assert!(elapsed.unwrap() < Duration::from_secs(1));
        ct.cancel();
    }

    #[tokio::test]
    async fn test_set_log_level_sends_level() {
        let (session, mut out_rx, in_tx, ct) = wired_session(ServerCapabilities::default());

        let responder = tokio::spawn(async move {
            let raw = out_rx.recv().await.unwrap();
            let req: serde_json::Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(req["method"], METHOD_LOGGING_SET_LEVEL);
            assert_eq!(req["params"]["level"], "warning");
            let resp = serde_json::json!({
                "jsonrpc": "2.0", "id": req["id"], "result": {}
            });
            in_tx.send(serde_json::to_string(&resp).unwrap()).unwrap();
        });

        session
            .set_log_level(LoggingLevel::Warning, None)
            .await
            .unwrap();
        responder.await.unwrap();
        ct.cancel();
    }
}
