//! Chat routes
//!
//! `POST /chat` runs one turn and streams its events as SSE, terminated by
//! the `data: [DONE]` sentinel. `POST /chat/approval` resolves a pending
//! tool-approval request.
//!
//! The turn is cancelled when the subscriber disconnects (the response
//! stream holds a [`tokio_util::sync::DropGuard`] on the turn's
//! cancellation token) or when the chat-turn deadline fires.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::chat::{driver_for, ApprovalDecision, ChatTurnRequest};
use crate::server::{ApiError, AppState};

/// `POST /chat` — run a turn, streaming events until `[DONE]`.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatTurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // Credentials are used to build the turn's driver and never stored.
    let driver = driver_for(
        &request.provider,
        request.api_key.as_deref(),
        request.base_url.as_deref(),
    )?;

    let (events_tx, events_rx) = mpsc::unbounded_channel::<serde_json::Value>();
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let engine = Arc::clone(&state.engine);
    let turn_deadline = state.settings.timeouts.chat_turn;
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        let turn = engine.run_turn(driver, request, events_tx, run_cancel.clone());
        if tokio::time::timeout(turn_deadline, turn).await.is_err() {
            run_cancel.cancel();
        }
        // events_tx drops here, which closes the SSE stream with [DONE].
    });

    struct StreamState {
        rx: mpsc::UnboundedReceiver<serde_json::Value>,
        _guard: DropGuard,
    }

    let hint = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().retry(Duration::from_millis(1500)))
    });
    let body = futures::stream::unfold(
        Some(StreamState {
            rx: events_rx,
            _guard: guard,
        }),
        |state| async move {
            let mut state = state?;
            match state.rx.recv().await {
                Some(event) => Some((
                    Ok::<Event, Infallible>(Event::default().data(event.to_string())),
                    Some(state),
                )),
                // Channel closed: the turn is over. Emit the sentinel, then end.
                None => Some((
                    Ok::<Event, Infallible>(Event::default().data("[DONE]")),
                    None,
                )),
            }
        },
    );

    Ok(Sse::new(hint.chain(body)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(25))
            .text(""),
    ))
}

/// Body of `POST /chat/approval`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalBody {
    /// The call id from the `tool-approval-request` event.
    pub call_id: String,
    /// `approve`, `approve-for-session`, or `deny`.
    pub decision: ApprovalDecision,
}

/// `POST /chat/approval` — resolve a pending tool-approval request.
pub async fn respond_approval(
    State(state): State<AppState>,
    Json(body): Json<ApprovalBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .engine
        .respond_to_approval(&body.call_id, body.decision)
        .await?;
    Ok(Json(serde_json::json!({ "callId": body.call_id, "ok": true })))
}
