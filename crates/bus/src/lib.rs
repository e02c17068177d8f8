// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event Bus (spec.md §4.4): topic fan-out from the Stream Pipeline to
//! interactive consumers.
//!
//! Grounded on the per-topic broadcast shape in
//! `other_examples/c6c6d505_..._interactive_session.rs.rs` and the
//! lock-acquired-only-on-subscribe/unsubscribe idiom in
//! `daemon/src/event_bus.rs`. Unlike that WAL-backed bus, this one keeps no
//! durable log: a subscriber that misses a message because it was not yet
//! subscribed, or because its buffer overflowed under a `drop-*` policy,
//! never gets it replayed (durability across restart is a non-goal here).

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use relay_core::{BackpressurePolicy, IdGen, Message, SessionId, Subscription, SubscriptionId, Topic, UuidIdGen, WorkspaceId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Per-subscription delivery buffer and bookkeeping. One of these backs
/// every `Subscription` handed out by `EventBus::subscribe`.
struct SubscriberState {
    buffer: VecDeque<Message>,
    capacity: usize,
    policy: BackpressurePolicy,
    closed: bool,
    delivered: u64,
    dropped: u64,
    last_delivered_sequence: u64,
}

struct SubscriberHandle {
    id: SubscriptionId,
    topic: Topic,
    state: Mutex<SubscriberState>,
    notify: Notify,
}

impl SubscriberHandle {
    /// Apply `policy` to a single incoming message. Never blocks: `Block`
    /// callers wait in `enqueue_blocking` instead, one level up, so that a
    /// slow subscriber cannot stall delivery to its siblings.
    fn push_nonblocking(&self, message: Message) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.buffer.len() < state.capacity {
            state.buffer.push_back(message);
            self.notify.notify_waiters();
            return;
        }
        match state.policy {
            BackpressurePolicy::DropOldest => {
                state.buffer.pop_front();
                state.buffer.push_back(message);
                state.dropped += 1;
                self.notify.notify_waiters();
            }
            BackpressurePolicy::DropNewest => {
                state.dropped += 1;
            }
            BackpressurePolicy::CloseOnOverflow => {
                state.closed = true;
                state.dropped += 1;
                self.notify.notify_waiters();
            }
            BackpressurePolicy::Block => {
                // Handled by the caller; reaching here with a full buffer
                // under `Block` means `enqueue_blocking` should have waited.
                // Treat as drop-oldest so a message is never silently lost
                // to a programming error in the caller.
                state.buffer.pop_front();
                state.buffer.push_back(message);
                state.dropped += 1;
                self.notify.notify_waiters();
            }
        }
    }

    async fn enqueue(&self, message: Message) {
        if self.state.lock().policy != BackpressurePolicy::Block {
            self.push_nonblocking(message);
            return;
        }
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return;
                }
                if state.buffer.len() < state.capacity {
                    state.buffer.push_back(message);
                    self.notify.notify_waiters();
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.notify.notify_waiters();
    }

    fn snapshot(&self) -> Subscription {
        let state = self.state.lock();
        let mut subscription = Subscription::new(self.id.clone(), self.topic.clone(), state.capacity, state.policy);
        subscription.last_delivered_sequence = state.last_delivered_sequence;
        subscription.delivered = state.delivered;
        subscription.dropped = state.dropped;
        subscription.closed = state.closed;
        subscription
    }
}

/// A consumer-facing handle returned by `EventBus::subscribe`. Messages are
/// pulled with `recv`; `None` means the topic (or this subscription) closed.
pub struct Receiver {
    handle: Arc<SubscriberHandle>,
}

impl Receiver {
    pub fn id(&self) -> SubscriptionId {
        self.handle.id.clone()
    }

    pub async fn recv(&self) -> Option<Message> {
        loop {
            {
                let mut state = self.handle.state.lock();
                if let Some(message) = state.buffer.pop_front() {
                    state.delivered += 1;
                    state.last_delivered_sequence = message.sequence;
                    self.handle.notify.notify_waiters();
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.handle.notify.notified().await;
        }
    }

    pub fn snapshot(&self) -> Subscription {
        self.handle.snapshot()
    }

    pub fn close(&self) {
        self.handle.close();
    }
}

/// Publish/Subscribe/CloseTopic contract (spec.md §4.4). One `EventBus`
/// serves every session and workspace the daemon hosts.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<String, Vec<Arc<SubscriberHandle>>>>,
    /// Registered so a publish to `session:<id>` can also fan out to
    /// `workspace:<id>` subscribers, per spec.md §4.4's topic semantics.
    session_workspace: Mutex<HashMap<SessionId, WorkspaceId>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates a session with its owning workspace so publishes to that
    /// session also reach workspace-wide subscribers. Idempotent.
    pub fn register_session(&self, session_id: SessionId, workspace_id: WorkspaceId) {
        self.session_workspace.lock().insert(session_id, workspace_id);
    }

    pub fn unregister_session(&self, session_id: SessionId) {
        self.session_workspace.lock().remove(&session_id);
    }

    pub fn subscribe(&self, topic: Topic, buffer_size: usize, policy: BackpressurePolicy) -> Receiver {
        let id = SubscriptionId::new(UuidIdGen.next());
        let handle = Arc::new(SubscriberHandle {
            id,
            topic: topic.clone(),
            state: Mutex::new(SubscriberState {
                buffer: VecDeque::with_capacity(buffer_size.min(256)),
                capacity: buffer_size,
                policy,
                closed: false,
                delivered: 0,
                dropped: 0,
                last_delivered_sequence: 0,
            }),
            notify: Notify::new(),
        });
        self.topics.lock().entry(topic.to_string()).or_default().push(handle.clone());
        trace!(subscription = %id, topic = %topic, "subscribed");
        Receiver { handle }
    }

    pub fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) {
        let mut topics = self.topics.lock();
        if let Some(subscribers) = topics.get_mut(&topic.to_string()) {
            if let Some(pos) = subscribers.iter().position(|h| h.id == id) {
                let handle = subscribers.remove(pos);
                handle.close();
            }
        }
    }

    /// Closes every subscription on `topic`, removing it from the bus.
    /// Subscribers observe this as `recv` returning `None`.
    pub fn close_topic(&self, topic: &Topic) {
        if let Some(subscribers) = self.topics.lock().remove(&topic.to_string()) {
            for handle in subscribers {
                handle.close();
            }
        }
    }

    /// Delivers `message` to every subscription on `topic`, plus, when
    /// `topic` is a session topic, every subscription on its owning
    /// workspace topic. Non-blocking for `drop-*`/`close-on-overflow`
    /// subscribers; a `block` subscriber's enqueue runs as its own task so
    /// other subscribers are never delayed by it. Returns once every
    /// matching subscription has had the message enqueued.
    pub async fn publish(&self, topic: &Topic, message: Message) {
        let handles = self.matching_handles(topic);
        if handles.is_empty() {
            return;
        }
        let mut set = tokio::task::JoinSet::new();
        for handle in handles {
            let message = message.clone();
            set.spawn(async move { handle.enqueue(message).await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Like `publish`, but a `block`-policy subscription that hasn't drained
    /// within `deadline` is force-closed rather than stalling the call
    /// indefinitely (spec.md §4.3's stall-deadline/`OverflowEvicted` rule).
    /// The Stream Pipeline is the caller that enforces this; the Bus itself
    /// places no deadline on an ordinary `publish`.
    pub async fn publish_with_deadline(&self, topic: &Topic, message: Message, deadline: std::time::Duration) -> Vec<SubscriptionId> {
        let handles = self.matching_handles(topic);
        if handles.is_empty() {
            return Vec::new();
        }
        let mut set = tokio::task::JoinSet::new();
        for handle in handles {
            let message = message.clone();
            set.spawn(async move {
                let timed_out = tokio::time::timeout(deadline, handle.enqueue(message)).await.is_err();
                if timed_out {
                    handle.close();
                }
                (handle.id.clone(), timed_out)
            });
        }
        let mut evicted = Vec::new();
        while let Some(result) = set.join_next().await {
            if let Ok((id, true)) = result {
                evicted.push(id);
            }
        }
        evicted
    }

    fn matching_handles(&self, topic: &Topic) -> Vec<Arc<SubscriberHandle>> {
        let mut keys = vec![topic.to_string()];
        if let Topic::Session(session_id) = topic {
            if let Some(workspace_id) = self.session_workspace.lock().get(session_id).cloned() {
                keys.push(Topic::Workspace(workspace_id).to_string());
            }
        }
        let topics = self.topics.lock();
        keys.iter().filter_map(|key| topics.get(key)).flatten().cloned().collect()
    }

    pub fn topic_subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.lock().get(&topic.to_string()).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MessageType;

    fn message(sequence: u64) -> Message {
        Message::new(MessageType::Text, serde_json::json!({"text": sequence}), sequence, 0)
    }

    fn new_session_id() -> SessionId {
        SessionId::new(UuidIdGen.next())
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages_in_order() {
        let bus = EventBus::new();
        let session_id = new_session_id();
        let topic = Topic::Session(session_id);
        let receiver = bus.subscribe(topic.clone(), 8, BackpressurePolicy::Block);
        bus.publish(&topic, message(1)).await;
        bus.publish(&topic, message(2)).await;
        assert_eq!(receiver.recv().await.unwrap().sequence, 1);
        assert_eq!(receiver.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn session_publish_also_reaches_workspace_subscriber() {
        let bus = EventBus::new();
        let session_id = new_session_id();
        let workspace_id = WorkspaceId::new(UuidIdGen.next());
        bus.register_session(session_id.clone(), workspace_id.clone());
        let workspace_rx = bus.subscribe(Topic::Workspace(workspace_id), 8, BackpressurePolicy::Block);
        bus.publish(&Topic::Session(session_id), message(1)).await;
        assert_eq!(workspace_rx.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn drop_oldest_policy_evicts_earliest_buffered_message() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 2, BackpressurePolicy::DropOldest);
        for seq in 1..=3 {
            bus.publish(&topic, message(seq)).await;
        }
        assert_eq!(receiver.recv().await.unwrap().sequence, 2);
        assert_eq!(receiver.recv().await.unwrap().sequence, 3);
        assert_eq!(receiver.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn drop_newest_policy_discards_incoming_message_on_overflow() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 1, BackpressurePolicy::DropNewest);
        bus.publish(&topic, message(1)).await;
        bus.publish(&topic, message(2)).await;
        assert_eq!(receiver.recv().await.unwrap().sequence, 1);
        assert_eq!(receiver.snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn close_on_overflow_policy_closes_subscription() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 1, BackpressurePolicy::CloseOnOverflow);
        bus.publish(&topic, message(1)).await;
        bus.publish(&topic, message(2)).await;
        // The buffered message still delivers; afterwards the subscription is closed.
        assert_eq!(receiver.recv().await.unwrap().sequence, 1);
        assert_eq!(receiver.recv().await, None);
    }

    #[tokio::test]
    async fn block_policy_waits_for_room_instead_of_dropping() {
        let bus = Arc::new(EventBus::new());
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 1, BackpressurePolicy::Block);
        bus.publish(&topic, message(1)).await;

        let bus_clone = bus.clone();
        let topic_clone = topic.clone();
        let publisher = tokio::spawn(async move {
            bus_clone.publish(&topic_clone, message(2)).await;
        });

        // Give the publish task a chance to start waiting on the full buffer.
        tokio::task::yield_now().await;
        assert_eq!(receiver.recv().await.unwrap().sequence, 1);
        publisher.await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn close_topic_ends_every_subscription() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 4, BackpressurePolicy::Block);
        bus.close_topic(&topic);
        assert_eq!(receiver.recv().await, None);
        assert_eq!(bus.topic_subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_single_subscriber_without_affecting_others() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let a = bus.subscribe(topic.clone(), 4, BackpressurePolicy::Block);
        let b = bus.subscribe(topic.clone(), 4, BackpressurePolicy::Block);
        bus.unsubscribe(&topic, a.id());
        bus.publish(&topic, message(1)).await;
        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn publish_with_deadline_evicts_a_stalled_block_subscriber() {
        let bus = EventBus::new();
        let topic = Topic::Session(new_session_id());
        let receiver = bus.subscribe(topic.clone(), 1, BackpressurePolicy::Block);
        bus.publish(&topic, message(1)).await;

        let evicted = bus
            .publish_with_deadline(&topic, message(2), std::time::Duration::from_millis(20))
            .await;
        assert_eq!(evicted, vec![receiver.id()]);
        assert_eq!(receiver.recv().await.unwrap().sequence, 1);
        assert_eq!(receiver.recv().await, None);
    }
}
