//! State and event fan-out with per-subscriber bounded queues and a
//! configurable drop policy.
//!
//! `tokio::sync::broadcast` almost fits here but it only offers lagged-receiver
//! semantics (a slow subscriber sees an error and has to catch up); the
//! reference broadcaster instead lets each subscriber pick drop-oldest,
//! drop-newest, or block. That needs producer-side eviction, which a plain
//! mpsc channel does not expose to the sender, so subscriber queues are a
//! small hand-rolled deque behind a mutex plus a `Notify`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Map as JsonMap;
use tokio::sync::Notify;
use tracing::warn;

use crate::config::DropPolicy;

#[derive(Debug, Clone, Serialize)]
pub struct StatePayload {
    pub alt: f64,
    pub battery: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub severity: u8,
    pub name: String,
    pub json_ctx: JsonMap<String, serde_json::Value>,
}

impl EventPayload {
    pub fn new(severity: u8, name: impl Into<String>, json_ctx: JsonMap<String, serde_json::Value>) -> Self {
        Self {
            severity,
            name: name.into(),
            json_ctx,
        }
    }
}

enum Item<T> {
    Value(T),
    Closed,
}

struct SubQueue<T> {
    inner: Mutex<VecDeque<Item<T>>>,
    notify: Notify,
    maxsize: usize,
    policy: DropPolicy,
    alive: AtomicBool,
}

impl<T> SubQueue<T> {
    fn new(maxsize: usize, policy: DropPolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            maxsize: maxsize.max(1),
            policy,
            alive: AtomicBool::new(true),
        }
    }

    /// Push an item according to the configured drop policy. Returns false
    /// if the subscriber should be dropped (only possible with `Block` if the
    /// subscriber has gone away, which we detect via `alive`).
    async fn push(&self, item: T) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if guard.len() < self.maxsize {
                    guard.push_back(Item::Value(item));
                    self.notify.notify_waiters();
                    return true;
                }
                match self.policy {
                    DropPolicy::DropOldest => {
                        guard.pop_front();
                        guard.push_back(Item::Value(item));
                        self.notify.notify_waiters();
                        return true;
                    }
                    DropPolicy::DropNewest => {
                        return true;
                    }
                    DropPolicy::Block => {
                        // fall through to wait below
                    }
                }
            }
            self.notify.notified().await;
            if !self.alive.load(Ordering::Acquire) {
                return false;
            }
        }
    }

    fn push_closed(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.push_back(Item::Closed);
        self.notify.notify_waiters();
    }

    async fn next(&self) -> Option<T> {
        loop {
            {
                let mut guard = self.inner.lock().unwrap();
                if let Some(item) = guard.pop_front() {
                    self.notify.notify_waiters();
                    return match item {
                        Item::Value(v) => Some(v),
                        Item::Closed => None,
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// An open subscription to one of the bus's channels. Dropping it unregisters
/// from the bus, mirroring the reference implementation's `finally: unregister()`.
pub struct Subscription<T> {
    queue: Arc<SubQueue<T>>,
    channel: Arc<ChannelInner<T>>,
}

impl<T> Subscription<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.queue.next().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.channel.unregister(&self.queue);
    }
}

struct ChannelInner<T> {
    subscribers: Mutex<Vec<Arc<SubQueue<T>>>>,
    closed: AtomicBool,
    default_maxsize: usize,
    default_policy: DropPolicy,
}

impl<T: Clone> ChannelInner<T> {
    fn new(default_maxsize: usize, default_policy: DropPolicy) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            default_maxsize,
            default_policy,
        }
    }

    fn subscribe(self: &Arc<Self>, maxsize: Option<usize>) -> Subscription<T> {
        let queue = Arc::new(SubQueue::new(
            maxsize.unwrap_or(self.default_maxsize),
            self.default_policy,
        ));
        if self.closed.load(Ordering::Acquire) {
            queue.push_closed();
        } else {
            self.subscribers.lock().unwrap().push(queue.clone());
        }
        Subscription {
            queue,
            channel: self.clone(),
        }
    }

    fn unregister(&self, queue: &Arc<SubQueue<T>>) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|q| !Arc::ptr_eq(q, queue));
    }

    async fn publish(&self, payload: T) {
        let subs: Vec<_> = self.subscribers.lock().unwrap().clone();
        let mut dead = Vec::new();
        for sub in &subs {
            if !sub.push(payload.clone()).await {
                dead.push(sub.clone());
            }
        }
        if !dead.is_empty() {
            let mut guard = self.subscribers.lock().unwrap();
            guard.retain(|q| !dead.iter().any(|d| Arc::ptr_eq(d, q)));
        }
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.iter() {
            sub.push_closed();
            sub.mark_dead();
        }
    }
}

pub struct EventBus {
    state: Arc<ChannelInner<StatePayload>>,
    event: Arc<ChannelInner<EventPayload>>,
}

impl EventBus {
    pub fn new(subscriber_maxsize: usize, drop_policy: DropPolicy) -> Self {
        Self {
            state: Arc::new(ChannelInner::new(subscriber_maxsize, drop_policy)),
            event: Arc::new(ChannelInner::new(subscriber_maxsize, drop_policy)),
        }
    }

    pub async fn publish_state(&self, payload: StatePayload) {
        self.state.publish(payload).await;
    }

    pub async fn publish_event(&self, payload: EventPayload) {
        self.event.publish(payload).await;
    }

    pub fn subscribe_state(&self, maxsize: Option<usize>) -> Subscription<StatePayload> {
        self.state.subscribe(maxsize)
    }

    pub fn subscribe_event(&self, maxsize: Option<usize>) -> Subscription<EventPayload> {
        self.event.subscribe(maxsize)
    }

    pub fn shutdown(&self) {
        self.state.shutdown();
        self.event.shutdown();
        warn!("event bus shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state(seq: i64) -> StatePayload {
        StatePayload {
            alt: 0.0,
            battery: seq,
            lat: None,
            lon: None,
        }
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent() {
        let bus = EventBus::new(2, DropPolicy::DropOldest);
        let mut sub = bus.subscribe_state(None);
        for seq in 1..=5 {
            bus.publish_state(state(seq)).await;
        }
        assert_eq!(sub.next().await.unwrap().battery, 4);
        assert_eq!(sub.next().await.unwrap().battery, 5);
    }

    #[tokio::test]
    async fn drop_newest_keeps_earliest() {
        let bus = EventBus::new(2, DropPolicy::DropNewest);
        let mut sub = bus.subscribe_state(None);
        for seq in 1..=5 {
            bus.publish_state(state(seq)).await;
        }
        assert_eq!(sub.next().await.unwrap().battery, 1);
        assert_eq!(sub.next().await.unwrap().battery, 2);
    }

    #[tokio::test]
    async fn shutdown_terminates_existing_and_new_subscribers() {
        let bus = EventBus::new(10, DropPolicy::DropOldest);
        let mut sub = bus.subscribe_state(None);
        bus.shutdown();
        assert!(sub.next().await.is_none());

        let mut late_sub = bus.subscribe_state(None);
        assert!(late_sub.next().await.is_none());
    }

    #[tokio::test]
    async fn unregister_on_drop_removes_subscriber() {
        let bus = EventBus::new(10, DropPolicy::DropOldest);
        {
            let _sub = bus.subscribe_event(None);
            assert_eq!(bus.event.subscribers.lock().unwrap().len(), 1);
        }
        assert_eq!(bus.event.subscribers.lock().unwrap().len(), 0);
    }
}
