//! Session wiring: transport pumps, RPC log tap, and inbox forwarding
//!
//! A live session is three background tasks around one transport:
//!
//! - a **writer pump** draining the client's outbound channel into
//!   [`Transport::send`], tapping each frame onto the `rpc-log` topic with
//!   direction `out`;
//! - a **reader pump** draining [`Transport::receive`] into the read loop's
//!   inbound channel, tapping each frame with direction `in`;
//! - the **read loop** itself (see [`crate::mcp::client`]), which resolves
//!   responses and posts server-initiated traffic to the manager's inbox.
//!
//! Each session carries its record's generation; the forwarding pump tags
//! every inbox message with it so the manager can discard events from dead
//! generations.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::hub::{EventHub, Topic};
use crate::mcp::client::{start_read_loop, JsonRpcClient, SessionEvent};
use crate::mcp::protocol::InitializedMcpProtocol;
use crate::mcp::transport::Transport;

/// A message from one session's read loop, tagged for fan-in.
#[derive(Debug)]
pub struct ManagerMessage {
    /// Which server's session produced this event.
    pub server_id: String,
    /// The generation of that session; stale generations are discarded.
    pub generation: u64,
    /// The event itself.
    pub event: SessionEvent,
}

/// A fully wired, initialized session.
pub(crate) struct SessionHandle {
    /// The generation this session belongs to.
    pub generation: u64,
    /// The negotiated protocol layer.
    pub protocol: InitializedMcpProtocol,
    /// The underlying transport, retained for `close()` and diagnostics.
    pub transport: Arc<dyn Transport>,
    /// Cancelling stops the read loop and both pumps.
    pub cancel: CancellationToken,
}

impl SessionHandle {
    /// Tear the session down: stop the pumps and close the transport.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.transport.close().await;
    }

    /// Recent transport diagnostics (stderr tail for stdio).
    pub fn diagnostics(&self) -> Option<String> {
        self.transport.diagnostics()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// The channel ends produced by [`wire_transport`], ready for the handshake.
pub(crate) struct WiredTransport {
    /// Shared JSON-RPC client bound to the transport's outbound side.
    pub client: Arc<JsonRpcClient>,
    /// Cancels the pumps and the read loop.
    pub cancel: CancellationToken,
}

/// Publish one frame to the `rpc-log` topic.
///
/// The frame is re-parsed so subscribers receive structured JSON; frames
/// that fail to parse are logged as raw strings (they also fail the session
/// in the read loop).
fn tap_rpc(hub: &EventHub, server_id: &str, direction: &str, frame: &str) {
    let message: serde_json::Value = serde_json::from_str(frame)
        .unwrap_or_else(|_| serde_json::Value::String(frame.to_string()));
    hub.publish(
        Topic::RpcLog,
        serde_json::json!({
            "type": "rpc",
            "serverId": server_id,
            "direction": direction,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "message": message,
        }),
    );
}

/// Wire pumps and read loop around `transport`.
///
/// Spawns the writer pump, the reader pump, the JSON-RPC read loop, and an
/// inbox forwarding task that tags [`SessionEvent`]s with `server_id` and
/// `generation` before posting them to `inbox_tx`.
pub(crate) fn wire_transport(
    server_id: &str,
    generation: u64,
    transport: Arc<dyn Transport>,
    hub: Arc<EventHub>,
    inbox_tx: mpsc::UnboundedSender<ManagerMessage>,
) -> WiredTransport {
    let cancel = CancellationToken::new();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<SessionEvent>();

    // Writer pump: outbound frames, in submission order, onto the transport.
    {
        let transport = Arc::clone(&transport);
        let hub = Arc::clone(&hub);
        let server_id = server_id.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    maybe = out_rx.recv() => {
                        let Some(frame) = maybe else { break };
                        tap_rpc(&hub, &server_id, "out", &frame);
                        if let Err(e) = transport.send(frame).await {
                            tracing::warn!(server = %server_id, "transport send failed: {e:#}");
                            break;
                        }
                    }
                }
            }
        });
    }

    // Reader pump: inbound frames into the read loop, tapping each one.
    {
        let transport = Arc::clone(&transport);
        let hub = Arc::clone(&hub);
        let server_id = server_id.to_string();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut stream = transport.receive();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    maybe = stream.next() => {
                        let Some(frame) = maybe else { break };
                        tap_rpc(&hub, &server_id, "in", &frame);
                        if in_tx.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            // Dropping in_tx ends the read loop, which posts Closed.
        });
    }

    let client = Arc::new(JsonRpcClient::new(out_tx));
    start_read_loop(in_rx, cancel.clone(), Arc::clone(&client), ev_tx);

    // Inbox forwarding: tag events with identity and generation.
    {
        let server_id = server_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = ev_rx.recv().await {
                if inbox_tx
                    .send(ManagerMessage {
                        server_id: server_id.clone(),
                        generation,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    WiredTransport { client, cancel }
}
