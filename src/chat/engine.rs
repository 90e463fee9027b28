//! Chat turn engine
//!
//! Drives one LLM chat turn end-to-end: streams model output, intercepts
//! tool calls, gates them on the approval policy, dispatches approved calls
//! to the client manager, and feeds results back into the next model step.
//!
//! Per turn the state machine is `idle → streaming → awaiting-tool →
//! awaiting-approval → streaming → … → done | errored | cancelled`. Tool
//! failures never abort the turn: they become synthetic tool results with
//! `isError: true` so the model can recover. Only a driver error or the
//! caller's deadline ends a turn early.
//!
//! Every event is delivered on the per-turn channel (the `/chat` SSE
//! response) and republished, tagged with the turn id, on the hub's chat
//! topic for observers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::chat::driver::{
    ChatMessage, DriverEvent, DriverRequest, ModelDriver, ToolCall, ToolSpec,
};
use crate::error::{McpLensError, Result};
use crate::hub::{EventHub, Topic};
use crate::manager::ClientManager;
use crate::mcp::protocol::ToolOutcome;
use crate::mcp::types::{ProgressParams, ToolResponseContent};

/// Default bound on model steps per turn.
const DEFAULT_MAX_STEPS: u32 = 10;

/// One chat turn as posted to `POST /chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurnRequest {
    /// Model identifier.
    pub model: String,
    /// Provider name (`openai`, `ollama`, `openai-compatible`).
    pub provider: String,
    /// Provider credential; held only for the duration of the turn.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override endpoint for compatible gateways.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Optional system prompt prefix.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Conversation history.
    pub messages: Vec<ChatMessage>,
    /// Servers whose tools are exposed to the model.
    #[serde(default)]
    pub server_ids: Vec<String>,
    /// Host-defined "skill" pseudo-tools attached to the exposed set. Their
    /// invocations are not dispatched to any MCP session; the subscriber
    /// fulfils them from the emitted `tool-call` events.
    #[serde(default)]
    pub skills: Vec<ToolSpec>,
    /// Tools pre-approved for this session, keyed `server:tool`.
    #[serde(default)]
    pub session_approved_tools: HashSet<String>,
    /// Bound on model steps; defaults to 10.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

/// A decision for one pending tool-approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    /// Run this one call.
    Approve,
    /// Run this call and auto-approve the same `server:tool` key for the
    /// rest of the turn.
    ApproveForSession,
    /// Refuse the call; the model sees a synthetic error result.
    Deny,
}

enum ApprovalWait {
    Decided(ApprovalDecision),
    TimedOut,
    Cancelled,
}

/// The chat engine. One instance serves all turns.
pub struct ChatEngine {
    manager: Arc<ClientManager>,
    hub: Arc<EventHub>,
    approvals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine").finish_non_exhaustive()
    }
}

impl ChatEngine {
    /// Create an engine dispatching through `manager`.
    pub fn new(manager: Arc<ClientManager>, hub: Arc<EventHub>) -> Self {
        Self {
            manager,
            hub,
            approvals: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a pending tool-approval request.
    ///
    /// # Errors
    ///
    /// Returns [`McpLensError::NotFound`] when no approval with `call_id` is
    /// waiting (already decided, timed out, or never existed).
    pub async fn respond_to_approval(
        &self,
        call_id: &str,
        decision: ApprovalDecision,
    ) -> Result<()> {
        let tx = {
            let mut approvals = self.approvals.lock().await;
            approvals.remove(call_id).ok_or_else(|| {
                McpLensError::NotFound(format!("no pending approval for call `{call_id}`"))
            })?
        };
        let _ = tx.send(decision);
        Ok(())
    }

    /// Run one chat turn, emitting events on `events` until a terminal
    /// `done`, `error`, or `cancelled` event.
    ///
    /// Cancelling `cancel` (the HTTP request aborting, or an explicit stop)
    /// ends the turn promptly; in-flight tool calls are abandoned and their
    /// sessions release the waiters through request timeouts.
    pub async fn run_turn(
        &self,
        driver: Arc<dyn ModelDriver>,
        request: ChatTurnRequest,
        events: mpsc::UnboundedSender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let turn_id = uuid::Uuid::new_v4().to_string();
        let max_steps = request.max_steps.unwrap_or(DEFAULT_MAX_STEPS).max(1);

        // Union the advertised tools of every selected server, namespaced so
        // the model can never ambiguously invoke one.
        let mut tools: Vec<ToolSpec> = Vec::new();
        for server_id in &request.server_ids {
            match self.manager.list_all_tools(server_id).await {
                Ok(server_tools) => {
                    for tool in server_tools {
                        tools.push(ToolSpec {
                            name: format!("{server_id}:{}", tool.name),
                            description: tool.description.clone(),
                            parameters: tool.input_schema.clone(),
                        });
                    }
                }
                Err(e) => {
                    // A dead server hides its tools but does not kill the turn.
                    tracing::warn!(server = %server_id, "tool listing failed: {e:#}");
                }
            }
        }
        let skill_names: HashSet<String> =
            request.skills.iter().map(|s| s.name.clone()).collect();
        tools.extend(request.skills.iter().cloned());

        let mut approved = request.session_approved_tools.clone();
        let mut messages = request.messages.clone();

        for step in 0..max_steps {
            self.hub.publish(
                Topic::Xray,
                serde_json::json!({
                    "type": "xray",
                    "turnId": turn_id,
                    "step": step,
                    "model": request.model,
                    "systemPrompt": request.system_prompt,
                    "tools": tools,
                    "messages": messages,
                }),
            );

            let mut rx = match driver
                .stream(DriverRequest {
                    model: request.model.clone(),
                    system_prompt: request.system_prompt.clone(),
                    temperature: request.temperature,
                    messages: messages.clone(),
                    tools: tools.clone(),
                })
                .await
            {
                Ok(rx) => rx,
                Err(e) => {
                    self.emit(
                        &turn_id,
                        &events,
                        serde_json::json!({ "type": "error", "message": format!("{e:#}") }),
                    );
                    return Err(e);
                }
            };

            let mut text = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.emit(&turn_id, &events, serde_json::json!({ "type": "cancelled" }));
                        return Ok(());
                    }
                    event = rx.recv() => event,
                };

                match event {
                    None => break,
                    Some(Ok(DriverEvent::TextDelta(delta))) => {
                        self.emit(
                            &turn_id,
                            &events,
                            serde_json::json!({ "type": "text", "delta": delta }),
                        );
                        text.push_str(&delta);
                    }
                    Some(Ok(DriverEvent::ToolCall(call))) => {
                        self.emit(
                            &turn_id,
                            &events,
                            serde_json::json!({
                                "type": "tool-call",
                                "callId": call.id,
                                "toolName": call.function.name,
                                "arguments": call.function.arguments,
                            }),
                        );
                        calls.push(call);
                    }
                    Some(Ok(DriverEvent::Finished)) => break,
                    Some(Err(e)) => {
                        self.emit(
                            &turn_id,
                            &events,
                            serde_json::json!({ "type": "error", "message": format!("{e:#}") }),
                        );
                        return Err(e);
                    }
                }
            }

            messages.push(ChatMessage::assistant(
                if text.is_empty() { None } else { Some(text) },
                if calls.is_empty() {
                    None
                } else {
                    Some(calls.clone())
                },
            ));

            if calls.is_empty() {
                self.emit(&turn_id, &events, serde_json::json!({ "type": "done" }));
                return Ok(());
            }

            for call in calls {
                match self
                    .execute_call(&turn_id, &call, &mut approved, &skill_names, &events, &cancel)
                    .await
                {
                    Some(result) => messages.push(result),
                    None => {
                        self.emit(&turn_id, &events, serde_json::json!({ "type": "cancelled" }));
                        return Ok(());
                    }
                }
            }
        }

        self.emit(
            &turn_id,
            &events,
            serde_json::json!({ "type": "done", "reason": "max-steps" }),
        );
        Ok(())
    }

    /// Gate one call on the approval policy, dispatch it, and return the
    /// tool-result message for the model. `None` means the turn was
    /// cancelled while waiting.
    async fn execute_call(
        &self,
        turn_id: &str,
        call: &ToolCall,
        approved: &mut HashSet<String>,
        skill_names: &HashSet<String>,
        events: &mpsc::UnboundedSender<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Option<ChatMessage> {
        let key = call.function.name.clone();

        // Skill pseudo-tools are fulfilled by the host from the emitted
        // tool-call event; the model just needs an acknowledgement.
        if skill_names.contains(&key) {
            self.emit(
                turn_id,
                events,
                serde_json::json!({
                    "type": "tool-result",
                    "callId": call.id,
                    "toolName": key,
                    "isError": false,
                    "content": [{ "type": "text", "text": format!("skill `{key}` delegated to the host application") }],
                }),
            );
            return Some(ChatMessage::tool_result(
                call.id.clone(),
                format!("skill `{key}` delegated to the host application"),
            ));
        }

        if !approved.contains(&key) {
            self.emit(
                turn_id,
                events,
                serde_json::json!({
                    "type": "tool-approval-request",
                    "callId": call.id,
                    "toolName": key,
                    "arguments": call.function.arguments,
                }),
            );

            match self.wait_approval(&call.id, cancel).await {
                ApprovalWait::Decided(ApprovalDecision::Approve) => {}
                ApprovalWait::Decided(ApprovalDecision::ApproveForSession) => {
                    approved.insert(key.clone());
                }
                ApprovalWait::Decided(ApprovalDecision::Deny) => {
                    return Some(self.synthetic_result(turn_id, events, call, "user denied"));
                }
                ApprovalWait::TimedOut => {
                    return Some(self.synthetic_result(
                        turn_id,
                        events,
                        call,
                        "approval timed out",
                    ));
                }
                ApprovalWait::Cancelled => return None,
            }
        }

        // Composite key: everything before the first `:` is the server id.
        let Some((server_id, tool_name)) = key.split_once(':') else {
            return Some(self.synthetic_result(
                turn_id,
                events,
                call,
                &format!("malformed tool name `{key}`"),
            ));
        };

        let arguments: serde_json::Value =
            serde_json::from_str(&call.function.arguments).unwrap_or(serde_json::json!({}));

        // Forward incremental progress from the server to the subscriber.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressParams>();
        let progress_task = {
            let events = events.clone();
            let hub = Arc::clone(&self.hub);
            let turn_id = turn_id.to_string();
            let call_id = call.id.clone();
            tokio::spawn(async move {
                while let Some(p) = progress_rx.recv().await {
                    let mut event = serde_json::json!({
                        "type": "tool-progress",
                        "callId": call_id,
                        "progress": p.progress,
                        "total": p.total,
                        "message": p.message,
                    });
                    event["turnId"] = serde_json::Value::String(turn_id.clone());
                    hub.publish(Topic::Chat, event.clone());
                    let _ = events.send(event);
                }
            })
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                progress_task.abort();
                return None;
            }
            outcome = self.manager.call_tool(
                server_id,
                tool_name,
                Some(arguments),
                None,
                Some(progress_tx),
                None,
            ) => outcome,
        };
        progress_task.abort();

        let message = match outcome {
            Ok(ToolOutcome::Content(response)) => {
                let is_error = response.is_error.unwrap_or(false);
                let rendered = render_content(&response.content);
                self.emit(
                    turn_id,
                    events,
                    serde_json::json!({
                        "type": "tool-result",
                        "callId": call.id,
                        "toolName": key,
                        "isError": is_error,
                        "content": response.content,
                    }),
                );
                ChatMessage::tool_result(call.id.clone(), rendered)
            }
            Ok(ToolOutcome::Task(envelope)) => {
                self.emit(
                    turn_id,
                    events,
                    serde_json::json!({
                        "type": "tool-result",
                        "callId": call.id,
                        "toolName": key,
                        "isError": false,
                        "task": envelope.task,
                    }),
                );
                ChatMessage::tool_result(
                    call.id.clone(),
                    format!(
                        "tool started task {}; poll tasks/get for completion",
                        envelope.task.task_id
                    ),
                )
            }
            Err(e) => {
                // The model sees the failure and may recover; the turn goes on.
                return Some(self.synthetic_result(
                    turn_id,
                    events,
                    call,
                    &format!("tool call failed: {e:#}"),
                ));
            }
        };
        Some(message)
    }

    /// Register a pending approval and wait for a decision.
    async fn wait_approval(&self, call_id: &str, cancel: &CancellationToken) -> ApprovalWait {
        let (tx, rx) = oneshot::channel();
        {
            let mut approvals = self.approvals.lock().await;
            approvals.insert(call_id.to_string(), tx);
        }

        let timeout = self.manager.settings().timeouts.elicitation;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => ApprovalWait::Cancelled,
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(decision)) => ApprovalWait::Decided(decision),
                Ok(Err(_)) => ApprovalWait::Cancelled,
                Err(_) => ApprovalWait::TimedOut,
            },
        };

        let mut approvals = self.approvals.lock().await;
        approvals.remove(call_id);
        outcome
    }

    /// Emit a synthetic `isError` tool result (denial, malformed call,
    /// dispatch failure) and build the matching model message.
    fn synthetic_result(
        &self,
        turn_id: &str,
        events: &mpsc::UnboundedSender<serde_json::Value>,
        call: &ToolCall,
        reason: &str,
    ) -> ChatMessage {
        self.emit(
            turn_id,
            events,
            serde_json::json!({
                "type": "tool-result",
                "callId": call.id,
                "toolName": call.function.name,
                "isError": true,
                "content": [{ "type": "text", "text": reason }],
            }),
        );
        ChatMessage::tool_result(call.id.clone(), reason)
    }

    fn emit(
        &self,
        turn_id: &str,
        events: &mpsc::UnboundedSender<serde_json::Value>,
        mut event: serde_json::Value,
    ) {
        event["turnId"] = serde_json::Value::String(turn_id.to_string());
        self.hub.publish(Topic::Chat, event.clone());
        let _ = events.send(event);
    }
}

/// Render tool content for the model: text items joined, anything else as
/// raw JSON.
fn render_content(content: &[ToolResponseContent]) -> String {
    let texts: Vec<&str> = content
        .iter()
        .filter_map(|c| match c {
            ToolResponseContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if texts.is_empty() {
        serde_json::to_string(content).unwrap_or_default()
    } else {
        texts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::driver::FunctionCall;
    use crate::config::Settings;
    use crate::hub::elicitation::ElicitationBroker;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// A driver that replays scripted steps.
    struct ScriptedDriver {
        steps: StdMutex<VecDeque<Vec<DriverEvent>>>,
    }

    impl ScriptedDriver {
        fn new(steps: Vec<Vec<DriverEvent>>) -> Arc<Self> {
            Arc::new(Self {
                steps: StdMutex::new(steps.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ModelDriver for ScriptedDriver {
        async fn stream(
            &self,
            _request: DriverRequest,
        ) -> Result<mpsc::Receiver<Result<DriverEvent>>> {
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![DriverEvent::Finished]);
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for event in step {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn make_engine() -> Arc<ChatEngine> {
        let hub = Arc::new(EventHub::new());
        let broker = Arc::new(ElicitationBroker::new(Arc::clone(&hub)));
        let manager = ClientManager::new(Settings::default(), Arc::clone(&hub), broker);
        Arc::new(ChatEngine::new(manager, hub))
    }

    fn turn_request() -> ChatTurnRequest {
        ChatTurnRequest {
            model: "test-model".into(),
            provider: "openai".into(),
            api_key: None,
            base_url: None,
            system_prompt: None,
            temperature: None,
            messages: vec![ChatMessage::user("hello")],
            server_ids: vec![],
            skills: vec![],
            session_approved_tools: HashSet::new(),
            max_steps: None,
        }
    }

    fn call(id: &str, name: &str) -> DriverEvent {
        DriverEvent::ToolCall(ToolCall {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: "{}".into(),
            },
        })
    }

    async fn next_of_type(
        rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
        wanted: &str,
    ) -> serde_json::Value {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if event["type"] == wanted {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_text_only_turn_emits_text_and_done() {
        let engine = make_engine();
        let driver = ScriptedDriver::new(vec![vec![
            DriverEvent::TextDelta("Hello ".into()),
            DriverEvent::TextDelta("world".into()),
            DriverEvent::Finished,
        ]]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        engine
            .run_turn(driver, turn_request(), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap()["delta"], "Hello ");
        assert_eq!(rx.recv().await.unwrap()["delta"], "world");
        assert_eq!(rx.recv().await.unwrap()["type"], "done");
    }

    #[tokio::test]
    async fn test_denied_tool_never_dispatched_and_turn_continues() {
        let engine = make_engine();
        // Step 1 requests a dangerous tool; step 2 answers with final text.
        let driver = ScriptedDriver::new(vec![
            vec![call("call_1", "srv1:delete_all"), DriverEvent::Finished],
            vec![DriverEvent::TextDelta("understood".into()), DriverEvent::Finished],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rpc_log = engine.hub.subscribe(Topic::RpcLog);

        let engine_clone = Arc::clone(&engine);
        let turn = tokio::spawn(async move {
            engine_clone
                .run_turn(driver, turn_request(), tx, CancellationToken::new())
                .await
        });

        let request = next_of_type(&mut rx, "tool-approval-request").await;
        assert_eq!(request["toolName"], "srv1:delete_all");
        let call_id = request["callId"].as_str().unwrap().to_string();

        engine
            .respond_to_approval(&call_id, ApprovalDecision::Deny)
            .await
            .unwrap();

        let result = next_of_type(&mut rx, "tool-result").await;
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "user denied");

        let text = next_of_type(&mut rx, "text").await;
        assert_eq!(text["delta"], "understood");
        next_of_type(&mut rx, "done").await;
        turn.await.unwrap().unwrap();

        // Denied: nothing was dispatched, so no server-error appears on the
        // rpc log (a dispatch against the unknown server would publish one).
        assert!(rpc_log.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_approve_for_session_skips_second_prompt() {
        let engine = make_engine();
        let driver = ScriptedDriver::new(vec![
            vec![call("call_1", "srv1:echo"), DriverEvent::Finished],
            vec![call("call_2", "srv1:echo"), DriverEvent::Finished],
            vec![DriverEvent::TextDelta("done".into()), DriverEvent::Finished],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let engine_clone = Arc::clone(&engine);
        let turn = tokio::spawn(async move {
            engine_clone
                .run_turn(driver, turn_request(), tx, CancellationToken::new())
                .await
        });

        let request = next_of_type(&mut rx, "tool-approval-request").await;
        let call_id = request["callId"].as_str().unwrap().to_string();
        engine
            .respond_to_approval(&call_id, ApprovalDecision::ApproveForSession)
            .await
            .unwrap();

        // Both dispatches fail (no such server) as synthetic results, but
        // only the first call asked for approval.
        let mut approval_requests = 1;
        let mut results = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match event["type"].as_str().unwrap() {
                "tool-approval-request" => approval_requests += 1,
                "tool-result" => results += 1,
                "done" => break,
                _ => {}
            }
        }
        assert_eq!(approval_requests, 1);
        assert_eq!(results, 2);
        turn.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_session_approved_tools_skip_prompt_entirely() {
        let engine = make_engine();
        let driver = ScriptedDriver::new(vec![
            vec![call("call_1", "srv1:echo"), DriverEvent::Finished],
            vec![DriverEvent::Finished],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut request = turn_request();
        request.session_approved_tools.insert("srv1:echo".into());

        engine
            .run_turn(driver, request, tx, CancellationToken::new())
            .await
            .unwrap();

        // Dispatch fails with a synthetic result (unknown server), but no
        // approval request was ever emitted.
        let mut saw_approval = false;
        let mut saw_result = false;
        while let Some(event) = rx.recv().await {
            match event["type"].as_str().unwrap() {
                "tool-approval-request" => saw_approval = true,
                "tool-result" => {
                    saw_result = true;
                    assert_eq!(event["isError"], true);
                }
                _ => {}
            }
        }
        assert!(!saw_approval);
        assert!(saw_result);
    }

    #[tokio::test]
    async fn test_cancellation_mid_stream() {
        let engine = make_engine();
        // A step that never finishes: the channel stays open with no events.
        struct HangingDriver;
        #[async_trait::async_trait]
        impl ModelDriver for HangingDriver {
            async fn stream(
                &self,
                _request: DriverRequest,
            ) -> Result<mpsc::Receiver<Result<DriverEvent>>> {
                let (tx, rx) = mpsc::channel(1);
                tokio::spawn(async move {
                    // Keep the sender alive forever.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    drop(tx);
                });
                Ok(rx)
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        engine
            .run_turn(Arc::new(HangingDriver), turn_request(), tx, cancel)
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "cancelled");
    }

    #[tokio::test]
    async fn test_skill_pseudo_tool_acknowledged_without_dispatch_or_approval() {
        let engine = make_engine();
        let driver = ScriptedDriver::new(vec![
            vec![call("call_1", "summarize"), DriverEvent::Finished],
            vec![DriverEvent::TextDelta("ok".into()), DriverEvent::Finished],
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut request = turn_request();
        request.skills.push(crate::chat::driver::ToolSpec {
            name: "summarize".into(),
            description: Some("Summarize the conversation".into()),
            parameters: serde_json::json!({ "type": "object" }),
        });

        engine
            .run_turn(driver, request, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut saw_approval = false;
        let mut skill_result = None;
        while let Some(event) = rx.recv().await {
            match event["type"].as_str().unwrap() {
                "tool-approval-request" => saw_approval = true,
                "tool-result" => skill_result = Some(event),
                _ => {}
            }
        }
        assert!(!saw_approval, "skills are not approval-gated");
        let result = skill_result.expect("expected a skill acknowledgement");
        assert_eq!(result["isError"], false);
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("delegated to the host"));
    }

    #[tokio::test]
    async fn test_respond_to_unknown_approval_fails_not_found() {
        let engine = make_engine();
        let result = engine
            .respond_to_approval("ghost", ApprovalDecision::Approve)
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Not found"));
    }

    #[tokio::test]
    async fn test_chat_events_republished_on_hub_with_turn_id() {
        let engine = make_engine();
        let mut chat_topic = engine.hub.subscribe(Topic::Chat);
        let driver = ScriptedDriver::new(vec![vec![
            DriverEvent::TextDelta("hi".into()),
            DriverEvent::Finished,
        ]]);
        let (tx, _rx) = mpsc::unbounded_channel();

        engine
            .run_turn(driver, turn_request(), tx, CancellationToken::new())
            .await
            .unwrap();

        let event = chat_topic.recv().await.unwrap();
        assert_eq!(event["type"], "text");
        assert!(event["turnId"].as_str().is_some());
    }

    #[test]
    fn test_render_content_prefers_text() {
        let rendered = render_content(&[
            ToolResponseContent::Text { text: "a".into() },
            ToolResponseContent::Text { text: "b".into() },
        ]);
        assert_eq!(rendered, "a\nb");

        let rendered = render_content(&[ToolResponseContent::Image {
            data: "AA==".into(),
            mime_type: "image/png".into(),
        }]);
        assert!(rendered.contains("image/png"));
    }

    #[test]
    fn test_turn_request_parses_camel_case() {
        let body = serde_json::json!({
            "model": "gpt-4o-mini",
            "provider": "openai",
            "apiKey": "sk-test",
            "systemPrompt": "be brief",
            "messages": [{ "role": "user", "content": "hi" }],
            "serverIds": ["srv1"],
            "sessionApprovedTools": ["srv1:echo"],
            "maxSteps": 4
        });
        let parsed: ChatTurnRequest = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.api_key.as_deref(), Some("sk-test"));
        assert_eq!(parsed.server_ids, vec!["srv1"]);
        assert!(parsed.session_approved_tools.contains("srv1:echo"));
        assert_eq!(parsed.max_steps, Some(4));
    }
}
