//! In-process fake transport for unit and integration tests
//!
//! [`FakeTransport`] and [`FakeTransportHandle`] form an in-process pair
//! that replaces real network or process I/O in tests.
//!
//! From the **client** perspective:
//!
//! - "outbound" = what the client *sends* = what the test reads via
//!   `handle.outbound_rx`.
//! - "inbound"  = what the client *receives* = what the test injects via
//!   `handle.inbound_tx`.
//!
//! ```text
//! client send() -----> outbound_tx -----> outbound_rx (handle reads)
//! handle inbound_tx -> inbound_tx  -----> inbound_rx  (client receive())
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, Mutex};

use crate::error::{McpLensError, Result};
use crate::mcp::transport::Transport;

/// In-process fake transport for use in tests.
///
/// Implements the full [`Transport`] trait using in-memory channels, so
/// tests can drive a session without spawning processes or making network
/// requests.
#[derive(Debug)]
pub struct FakeTransport {
    /// `send()` writes here; the handle drains it via `outbound_rx`.
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Populated by the handle's `inbound_tx`; exposed via `receive()`.
    inbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    /// Sender used by `inject()` to push messages onto the inbound channel.
    inbound_inject_tx: mpsc::UnboundedSender<String>,
    /// Set once `close()` has been called.
    closed: AtomicBool,
}

impl FakeTransport {
    /// Create a new `(FakeTransport, FakeTransportHandle)` pair.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        let transport = Self {
            outbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            inbound_inject_tx: inbound_tx.clone(),
            closed: AtomicBool::new(false),
        };

        let handle = FakeTransportHandle {
            outbound_rx,
            inbound_tx,
        };

        (transport, handle)
    }

    /// Inject a [`serde_json::Value`] as a server message.
    ///
    /// The value is serialized and pushed onto the inbound channel, so the
    /// next poll of [`Transport::receive`] yields it.
    ///
    /// # Panics
    ///
    /// Panics if the inbound channel has been closed.
    pub fn inject(&self, message: serde_json::Value) {
        let serialized =
            serde_json::to_string(&message).expect("FakeTransport: failed to serialize message");
        self.inbound_inject_tx
            .send(serialized)
            .expect("FakeTransport: inbound channel closed before inject");
    }

    /// Whether `close()` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// The test-side handle for a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Receives messages that the client sent via [`Transport::send`].
    pub outbound_rx: mpsc::UnboundedReceiver<String>,
    /// Sends server messages into the client's [`Transport::receive`] stream.
    pub inbound_tx: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpLensError::Transport("FakeTransport closed".into()).into());
        }
        self.outbound_tx.send(message).map_err(|e| {
            McpLensError::Transport(format!("FakeTransport outbound channel closed: {}", e)).into()
        })
    }

    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.inbound_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Always empty: the fake transport has no stderr.
    fn receive_err(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        Box::pin(futures::stream::empty())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::StreamExt;

    #[tokio::test]
    async fn test_send_delivers_to_handle_outbound_rx() {
        let (transport, mut handle) = FakeTransport::new();

        transport
            .send(r#"{"jsonrpc":"2.0","method":"ping"}"#.to_string())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), handle.outbound_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");

        assert_eq!(received, r#"{"jsonrpc":"2.0","method":"ping"}"#);
    }

    #[tokio::test]
    async fn test_receive_yields_injected_messages_in_order() {
        let (transport, handle) = FakeTransport::new();

        handle.inbound_tx.send("first".to_string()).unwrap();
        transport.inject(serde_json::json!({"via": "inject"}));

        let mut stream = transport.receive();
        assert_eq!(stream.next().await.unwrap(), "first");
        let second: serde_json::Value =
            serde_json::from_str(&stream.next().await.unwrap()).unwrap();
        assert_eq!(second["via"], "inject");
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, _handle) = FakeTransport::new();
        transport.close().await;
        assert!(transport.is_closed());
        let result = transport.send("test".to_string()).await;
        assert!(result.is_err(), "send should fail after close");
    }

    #[tokio::test]
    async fn test_send_returns_error_when_handle_dropped() {
        let (transport, handle) = FakeTransport::new();
        drop(handle);

        let result = transport.send("test".to_string()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_fake_transport_is_object_safe() {
        let (transport, _handle) = FakeTransport::new();
        let _boxed: Box<dyn Transport> = Box::new(transport);
    }
}
