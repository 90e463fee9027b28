//! Elicitation broker
//!
//! When an MCP server issues an `elicitation/create` request mid-tool-call,
//! the session's default handler lands here. The broker:
//!
//! 1. Allocates a fresh `requestId` and inserts an open record keyed by it.
//! 2. Publishes `elicitation-open` on the hub's elicitation topic.
//! 3. Awaits the resolver with a deadline.
//!
//! A UI client answers via `respond`, which validates the content against
//! the requested schema, resolves the waiter exactly once, and publishes
//! `elicitation-closed` with the outcome. Late or duplicate responses fail
//! with `NOT_FOUND`; an expired deadline closes the record with outcome
//! `expired` and unblocks the tool call with a cancel result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};

use crate::error::{McpLensError, Result};
use crate::hub::{EventHub, Topic};
use crate::mcp::types::{ElicitationAction, ElicitationCreateParams, ElicitationResult};

/// Final disposition of an elicitation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElicitationOutcome {
    /// The user supplied valid content.
    Accepted,
    /// The user explicitly refused.
    Declined,
    /// The interaction was dismissed, or its session went away.
    Cancelled,
    /// The deadline fired before any response arrived.
    Expired,
}

impl ElicitationOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ElicitationOutcome::Accepted => "accepted",
            ElicitationOutcome::Declined => "declined",
            ElicitationOutcome::Cancelled => "cancelled",
            ElicitationOutcome::Expired => "expired",
        }
    }
}

struct PendingElicitation {
    server_id: String,
    schema: serde_json::Value,
    tx: oneshot::Sender<ElicitationResult>,
}

/// Brokers server-initiated elicitation requests through the event hub.
///
/// One broker serves every session; records are keyed by their fresh
/// `requestId` and resolvable exactly once.
pub struct ElicitationBroker {
    hub: Arc<EventHub>,
    pending: Mutex<HashMap<String, PendingElicitation>>,
}

impl ElicitationBroker {
    /// Create a broker publishing on `hub`.
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            hub,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Open an elicitation and wait for a response or the deadline.
    ///
    /// Publishes `elicitation-open` to all current subscribers, then blocks
    /// until [`respond`](Self::respond) resolves the record or `timeout`
    /// elapses. On expiry the record is closed with outcome `expired` and
    /// the waiting tool call receives a `cancel` result so the server can
    /// unwind.
    pub async fn request(
        &self,
        server_id: &str,
        params: ElicitationCreateParams,
        timeout: Duration,
    ) -> ElicitationResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let deadline = created_at + chrono::Duration::from_std(timeout).unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                request_id.clone(),
                PendingElicitation {
                    server_id: server_id.to_string(),
                    schema: params.requested_schema.clone(),
                    tx,
                },
            );
        }

        self.hub.publish(
            Topic::Elicitation,
            serde_json::json!({
                "type": "elicitation-open",
                "requestId": request_id,
                "serverId": server_id,
                "message": params.message,
                "schema": params.requested_schema,
                "createdAt": created_at.to_rfc3339(),
                "deadline": deadline.to_rfc3339(),
            }),
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Sender dropped without a response (session teardown).
                self.publish_closed(&request_id, ElicitationOutcome::Cancelled);
                ElicitationResult {
                    action: ElicitationAction::Cancel,
                    content: None,
                }
            }
            Err(_) => {
                let removed = {
                    let mut pending = self.pending.lock().await;
                    pending.remove(&request_id).is_some()
                };
                // A response may have won the race; only report expiry when
                // the record was still open.
                if removed {
                    self.publish_closed(&request_id, ElicitationOutcome::Expired);
                }
                ElicitationResult {
                    action: ElicitationAction::Cancel,
                    content: None,
                }
            }
        }
    }

    /// Resolve an open elicitation.
    ///
    /// For `accept`, `content` is validated against the record's requested
    /// schema; on violation the record stays open and the caller receives
    /// `VALIDATION_ERROR` so the user can retry.
    ///
    /// # Errors
    ///
    /// - [`McpLensError::NotFound`] for unknown, already-resolved, or
    ///   expired request ids.
    /// - [`McpLensError::Validation`] when accepted content does not satisfy
    ///   the schema.
    pub async fn respond(
        &self,
        request_id: &str,
        action: ElicitationAction,
        content: Option<serde_json::Value>,
    ) -> Result<()> {
        let record = {
            let mut pending = self.pending.lock().await;

            if action == ElicitationAction::Accept {
                let record = pending.get(request_id).ok_or_else(|| {
                    McpLensError::NotFound(format!("unknown or expired elicitation {request_id}"))
                })?;
                let instance = content.clone().unwrap_or(serde_json::Value::Null);
                if !jsonschema::is_valid(&record.schema, &instance) {
                    return Err(McpLensError::Validation(format!(
                        "elicitation {request_id}: content does not satisfy the requested schema"
                    ))
                    .into());
                }
            }

            pending.remove(request_id).ok_or_else(|| {
                McpLensError::NotFound(format!("unknown or expired elicitation {request_id}"))
            })?
        };

        let outcome = match action {
            ElicitationAction::Accept => ElicitationOutcome::Accepted,
            ElicitationAction::Decline => ElicitationOutcome::Declined,
            ElicitationAction::Cancel => ElicitationOutcome::Cancelled,
        };

        // The waiter may have timed out between our remove and this send;
        // the outcome event still reflects the response that won the map.
        let _ = record.tx.send(ElicitationResult {
            action,
            content: if action == ElicitationAction::Accept {
                content
            } else {
                None
            },
        });

        self.publish_closed(request_id, outcome);
        Ok(())
    }

    /// Cancel every open elicitation belonging to `server_id`.
    ///
    /// Called when a session closes so tool calls blocked on user input
    /// unwind promptly instead of waiting out their deadlines.
    pub async fn cancel_for_server(&self, server_id: &str) {
        let cancelled: Vec<(String, PendingElicitation)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, rec)| rec.server_id == server_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|rec| (id, rec)))
                .collect()
        };

        for (request_id, record) in cancelled {
            let _ = record.tx.send(ElicitationResult {
                action: ElicitationAction::Cancel,
                content: None,
            });
            self.publish_closed(&request_id, ElicitationOutcome::Cancelled);
        }
    }

    /// Number of open records. Test hook.
    pub async fn open_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn publish_closed(&self, request_id: &str, outcome: ElicitationOutcome) {
        self.hub.publish(
            Topic::Elicitation,
            serde_json::json!({
                "type": "elicitation-closed",
                "requestId": request_id,
                "outcome": outcome.as_str(),
            }),
        );
    }
}

impl std::fmt::Debug for ElicitationBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElicitationBroker").finish_non_exhaustive()
    }
}
