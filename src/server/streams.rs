//! SSE stream endpoints backed by hub subscriptions
//!
//! Each stream sends an initial `retry: 1500` hint, `data: <json>` frames
//! in publish order (with `dropped-N` markers after overflow), and a `:`
//! comment keep-alive every 25 seconds.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use futures::StreamExt;

use crate::hub::{Subscription, Topic};
use crate::server::AppState;

/// Interval between `:` keep-alive comments.
const KEEP_ALIVE_SECS: u64 = 25;
/// Reconnect hint sent as the first frame of every stream.
const RETRY_HINT_MS: u64 = 1500;

/// Adapt a hub subscription into an SSE body.
pub(crate) fn sse_for(
    subscription: Subscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let hint = futures::stream::once(async {
        Ok::<Event, Infallible>(Event::default().retry(Duration::from_millis(RETRY_HINT_MS)))
    });

    let live = futures::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        Some((
            Ok::<Event, Infallible>(Event::default().data(event.to_string())),
            sub,
        ))
    });

    Sse::new(hint.chain(live)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEP_ALIVE_SECS))
            .text(""),
    )
}

/// `GET /elicitation/stream`
pub async fn elicitation_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_for(state.hub.subscribe(Topic::Elicitation))
}

/// `GET /rpc/stream`
pub async fn rpc_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_for(state.hub.subscribe(Topic::RpcLog))
}

/// `GET /xray/stream`
pub async fn xray_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sse_for(state.hub.subscribe(Topic::Xray))
}
