//! In-memory publish/subscribe event hub
//!
//! The hub carries four independent topics (`rpc-log`, `elicitation`,
//! `chat`, `xray`) that SSE endpoints on the HTTP edge subscribe to. All
//! topics share one bus shape:
//!
//! - A **publisher** writes events synchronously and never blocks on slow
//!   subscribers.
//! - Each **subscriber** owns a bounded queue. On overflow the oldest events
//!   are dropped; the subscriber's next delivery is preceded by a
//!   `dropped-N` marker event so that delivered counts plus drop counts
//!   always equal published counts.
//! - On subscribe, the last K events from a per-topic ring buffer are
//!   replayed before live events.
//! - Subscriber close is idempotent; closed queues are garbage-collected on
//!   the next publish.
//!
//! Events are JSON values; the hub imposes no schema beyond the synthesized
//! drop marker `{"type": "dropped", "count": N}`.

pub mod elicitation;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// The topics the hub carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Inbound/outbound JSON-RPC frames, direction-tagged, plus server
    /// lifecycle events.
    RpcLog,
    /// Elicitation open/closed events.
    Elicitation,
    /// Chat turn events (text deltas, tool calls, approvals), turn-tagged.
    Chat,
    /// Full LLM request payload captures.
    Xray,
}

impl Topic {
    /// `(replay_depth, queue_capacity)` for this topic.
    fn tuning(&self) -> (usize, usize) {
        match self {
            Topic::RpcLog => (3, 256),
            Topic::Elicitation => (0, 64),
            Topic::Chat => (10, 256),
            Topic::Xray => (10, 256),
        }
    }

    fn index(&self) -> usize {
        match self {
            Topic::RpcLog => 0,
            Topic::Elicitation => 1,
            Topic::Chat => 2,
            Topic::Xray => 3,
        }
    }
}

/// Per-subscriber bounded queue plus drop accounting.
struct SubQueue {
    buf: VecDeque<serde_json::Value>,
    dropped: u64,
}

struct SubscriberInner {
    queue: Mutex<SubQueue>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SubscriberInner {
    /// Enqueue one event, dropping oldest-first on overflow.
    fn push(&self, event: &serde_json::Value) {
        {
            let mut q = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if q.buf.len() >= self.capacity {
                q.buf.pop_front();
                q.dropped += 1;
            }
            q.buf.push_back(event.clone());
        }
        self.notify.notify_one();
    }
}

/// A handle to one subscriber's queue on one topic.
///
/// Dropping the subscription closes it; publishers garbage-collect closed
/// queues on the next publish.
pub struct Subscription {
    inner: Arc<SubscriberInner>,
}

impl Subscription {
    /// Receive the next event, waiting if the queue is empty.
    ///
    /// When events were dropped since the last delivery, the first value
    /// returned is the synthesized marker `{"type": "dropped", "count": N}`;
    /// the queued tail follows in publish order. Returns `None` once the
    /// subscription is closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        loop {
            {
                let mut q = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
                if q.dropped > 0 {
                    let count = q.dropped;
                    q.dropped = 0;
                    return Some(serde_json::json!({ "type": "dropped", "count": count }));
                }
                if let Some(event) = q.buf.pop_front() {
                    return Some(event);
                }
                if self.inner.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Receive without waiting. Test and drain helper.
    pub fn try_recv(&mut self) -> Option<serde_json::Value> {
        let mut q = self.inner.queue.lock().unwrap_or_else(|p| p.into_inner());
        if q.dropped > 0 {
            let count = q.dropped;
            q.dropped = 0;
            return Some(serde_json::json!({ "type": "dropped", "count": count }));
        }
        q.buf.pop_front()
    }

    /// Close this subscription. Idempotent.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

struct TopicState {
    ring: VecDeque<serde_json::Value>,
    replay_depth: usize,
    queue_capacity: usize,
    subscribers: Vec<Arc<SubscriberInner>>,
}

/// The process-wide event hub.
///
/// Created once at startup next to the manager; both are the only
/// process-wide singletons.
pub struct EventHub {
    topics: [Mutex<TopicState>; 4],
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create a hub with the default per-topic tuning.
    pub fn new() -> Self {
        let make = |topic: Topic| {
            let (replay_depth, queue_capacity) = topic.tuning();
            Mutex::new(TopicState {
                ring: VecDeque::with_capacity(replay_depth),
                replay_depth,
                queue_capacity,
                subscribers: Vec::new(),
            })
        };
        Self {
            topics: [
                make(Topic::RpcLog),
                make(Topic::Elicitation),
                make(Topic::Chat),
                make(Topic::Xray),
            ],
        }
    }

    /// Publish an event to every current subscriber of `topic`.
    ///
    /// Synchronous and non-blocking: slow subscribers lose their oldest
    /// events rather than stalling the publisher. Closed subscriptions are
    /// pruned here.
    pub fn publish(&self, topic: Topic, event: serde_json::Value) {
        let mut state = self.topics[topic.index()]
            .lock()
            .unwrap_or_else(|p| p.into_inner());

        if state.replay_depth > 0 {
            if state.ring.len() >= state.replay_depth {
                state.ring.pop_front();
            }
            state.ring.push_back(event.clone());
        }

        state
            .subscribers
            .retain(|sub| !sub.closed.load(Ordering::SeqCst));
        for sub in &state.subscribers {
            sub.push(&event);
        }
    }

    /// Subscribe to `topic`, receiving the replay ring first, then live
    /// events.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let mut state = self.topics[topic.index()]
            .lock()
            .unwrap_or_else(|p| p.into_inner());

        let inner = Arc::new(SubscriberInner {
            queue: Mutex::new(SubQueue {
                buf: state.ring.iter().cloned().collect(),
                dropped: 0,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: state.queue_capacity,
        });
        state.subscribers.push(Arc::clone(&inner));

        Subscription { inner }
    }

    /// Number of live subscribers on `topic`. Test hook.
    #[cfg(test)]
    fn subscriber_count(&self, topic: Topic) -> usize {
        let state = self.topics[topic.index()]
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        state
            .subscribers
            .iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .count()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}
