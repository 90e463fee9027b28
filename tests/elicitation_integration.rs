//! Elicitation round-trip tests against the `mcp_test_server` subprocess
//!
//! The server's `ask_age` tool issues an `elicitation/create` request
//! mid-call; the manager's default handler brokers it through the hub, a
//! test "UI" answers via the broker, and the tool call resumes with the
//! answer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mcplens::config::Settings;
use mcplens::hub::elicitation::ElicitationBroker;
use mcplens::hub::{EventHub, Topic};
use mcplens::manager::{ClientManager, ElicitationHandler};
use mcplens::mcp::client::BoxFuture;
use mcplens::mcp::protocol::ToolOutcome;
use mcplens::mcp::transport::ServerConfig;
use mcplens::mcp::types::{ElicitationAction, ElicitationCreateParams, ElicitationResult};

fn server_config() -> ServerConfig {
    serde_json::from_value(serde_json::json!({
        "command": PathBuf::from(env!("CARGO_BIN_EXE_mcp_test_server")).to_string_lossy(),
    }))
    .unwrap()
}

async fn connected_manager() -> Arc<ClientManager> {
    let hub = Arc::new(EventHub::new());
    let broker = Arc::new(ElicitationBroker::new(Arc::clone(&hub)));
    let manager = ClientManager::new(Settings::default(), hub, broker);
    manager
        .add_server("srv1".into(), "Test".into(), server_config())
        .await
        .unwrap();
    manager.connect("srv1").await.unwrap();
    manager
}

#[tokio::test]
async fn test_elicitation_accept_round_trip() {
    let manager = connected_manager().await;
    let mut events = manager.hub().subscribe(Topic::Elicitation);

    // Start the tool call; it blocks on the elicitation.
    let call_manager = Arc::clone(&manager);
    let call = tokio::spawn(async move {
        call_manager
            .call_tool("srv1", "ask_age", None, None, None, Some(Duration::from_secs(30)))
            .await
    });

    // Exactly one elicitation-open event arrives.
    let open = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for elicitation-open")
        .expect("subscription closed");
    assert_eq!(open["type"], "elicitation-open");
    assert_eq!(open["serverId"], "srv1");
    assert_eq!(open["message"], "How old are you?");
    assert_eq!(open["schema"]["properties"]["age"]["type"], "integer");
    let request_id = open["requestId"].as_str().unwrap().to_string();

    // The UI answers.
    manager
        .elicitation()
        .respond(
            &request_id,
            ElicitationAction::Accept,
            Some(serde_json::json!({ "age": 42 })),
        )
        .await
        .unwrap();

    // The tool call resumes with the answer.
    let outcome = tokio::time::timeout(Duration::from_secs(10), call)
        .await
        .expect("tool call did not resume")
        .expect("task panicked")
        .expect("tool call failed");
    match outcome {
        ToolOutcome::Content(response) => {
            assert_eq!(response.is_error, Some(false));
            assert_eq!(
                response.structured_content,
                Some(serde_json::json!({ "age": 42 }))
            );
        }
        ToolOutcome::Task(_) => panic!("unexpected task envelope"),
    }

    // And the closed event reports the accepted outcome.
    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for elicitation-closed")
        .expect("subscription closed");
    assert_eq!(closed["type"], "elicitation-closed");
    assert_eq!(closed["requestId"], request_id.as_str());
    assert_eq!(closed["outcome"], "accepted");

    // A duplicate response fails with NOT_FOUND.
    let dup = manager
        .elicitation()
        .respond(
            &request_id,
            ElicitationAction::Accept,
            Some(serde_json::json!({ "age": 43 })),
        )
        .await;
    assert!(dup.is_err());

    manager.remove_server("srv1").await.unwrap();
}

/// An override handler that answers every elicitation programmatically.
struct FixedAnswer;

impl ElicitationHandler for FixedAnswer {
    fn handle<'a>(
        &'a self,
        _server_id: &'a str,
        _params: ElicitationCreateParams,
    ) -> BoxFuture<'a, mcplens::Result<ElicitationResult>> {
        Box::pin(async move {
            Ok(ElicitationResult {
                action: ElicitationAction::Accept,
                content: Some(serde_json::json!({ "age": 7 })),
            })
        })
    }
}

#[tokio::test]
async fn test_elicitation_handler_override_bypasses_hub() {
    let manager = connected_manager().await;
    let mut events = manager.hub().subscribe(Topic::Elicitation);

    manager.set_elicitation_handler("srv1", Arc::new(FixedAnswer));

    let outcome = manager
        .call_tool("srv1", "ask_age", None, None, None, Some(Duration::from_secs(30)))
        .await
        .unwrap();
    match outcome {
        ToolOutcome::Content(response) => {
            assert_eq!(
                response.structured_content,
                Some(serde_json::json!({ "age": 7 }))
            );
        }
        ToolOutcome::Task(_) => panic!("unexpected task envelope"),
    }

    // The hub never saw the elicitation.
    assert!(events.try_recv().is_none());

    manager.remove_server("srv1").await.unwrap();
}

#[tokio::test]
async fn test_elicitation_decline_surfaces_tool_error() {
    let manager = connected_manager().await;
    let mut events = manager.hub().subscribe(Topic::Elicitation);

    let call_manager = Arc::clone(&manager);
    let call = tokio::spawn(async move {
        call_manager
            .call_tool("srv1", "ask_age", None, None, None, Some(Duration::from_secs(30)))
            .await
    });

    let open = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out")
        .expect("subscription closed");
    let request_id = open["requestId"].as_str().unwrap().to_string();

    manager
        .elicitation()
        .respond(&request_id, ElicitationAction::Decline, None)
        .await
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), call)
        .await
        .expect("tool call did not resume")
        .expect("task panicked")
        .expect("tool call failed");
    match outcome {
        ToolOutcome::Content(response) => {
            assert_eq!(response.is_error, Some(true));
        }
        ToolOutcome::Task(_) => panic!("unexpected task envelope"),
    }

    let closed = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out")
        .expect("subscription closed");
    assert_eq!(closed["outcome"], "declined");

    manager.remove_server("srv1").await.unwrap();
}
