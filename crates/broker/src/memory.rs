//! In-memory broker for tests. Every publish is kept for inspection, so it is
//! not meant for long-running processes.
//!
//! Follows the AMQP rules the worker depends on: direct, topic and fanout
//! routing, per-queue dead-lettering on `reject(requeue = false)`, prefetch
//! limits and conflicting redeclarations. Message TTL is not timed; call
//! [`InMemoryBroker::expire_queue`] to dead-letter a queue's ready messages
//! as if their TTL had elapsed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use herald_common::config::ExchangeKind;

use crate::{
    Acknowledger, Binding, Broker, BrokerError, Delivery, DeliveryStream, EnvelopeHeaders,
    ExchangeDecl, OutboundMessage, QueueArguments, QueueDecl,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    body: Vec<u8>,
    headers: EnvelopeHeaders,
}

#[derive(Debug)]
struct MemoryQueue {
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
}

/// A message as it was handed to `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: EnvelopeHeaders,
}

/// A message waiting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: EnvelopeHeaders,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    next_id: AtomicU64,
    connected: AtomicBool,
    fail_publishes: AtomicBool,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route to every matching queue. Unroutable messages are dropped.
    fn route(
        &self,
        state: &mut State,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        headers: &EnvelopeHeaders,
    ) -> Result<usize, BrokerError> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let kind = *state.exchanges.get(exchange).ok_or_else(|| {
                BrokerError::publish(exchange, format!("no exchange '{}'", exchange))
            })?;
            let mut targets: Vec<String> = state
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| match kind {
                    ExchangeKind::Direct => b.routing_key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
                })
                .map(|b| b.queue.clone())
                .collect();
            targets.dedup();
            targets
        };

        let mut delivered = 0;
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    id: self.next_id(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    headers: headers.clone(),
                });
                delivered += 1;
            }
        }

        if delivered == 0 {
            tracing::debug!(exchange, routing_key, "Unroutable message dropped");
        }
        Ok(delivered)
    }

    /// Dead-letter per the queue's arguments; dropped when it has none.
    fn dead_letter(&self, state: &mut State, arguments: &QueueArguments, message: StoredMessage) {
        let Some(exchange) = &arguments.dead_letter_exchange else {
            return;
        };
        let routing_key = arguments
            .dead_letter_routing_key
            .clone()
            .unwrap_or(message.routing_key);
        if let Err(e) = self.route(state, exchange, &routing_key, &message.body, &message.headers)
        {
            tracing::debug!(error = %e, "Dead-lettering dropped a message");
        }
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("in-memory broker is closed".to_string()));
        }
        Ok(())
    }
}

/// In-process [`Broker`]. Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                fail_publishes: AtomicBool::new(false),
            }),
        }
    }

    /// Dead-letter every ready message in `queue` as if its TTL had expired.
    /// Returns the number of messages moved.
    pub async fn expire_queue(&self, queue: &str) -> usize {
        let mut state = self.inner.state.lock().await;
        let Some(q) = state.queues.get_mut(queue) else {
            return 0;
        };
        let arguments = q.arguments.clone();
        let expired: Vec<StoredMessage> = q.ready.drain(..).collect();
        let count = expired.len();
        for message in expired {
            self.inner.dead_letter(&mut state, &arguments, message);
        }
        drop(state);

        self.inner.notify.notify_waiters();
        count
    }

    /// Number of ready (not yet delivered) messages.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    /// Number of delivered, unacknowledged messages.
    pub async fn unacked_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map(|q| q.unacked.len()).unwrap_or(0)
    }

    pub async fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        let state = self.inner.state.lock().await;
        state
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| QueuedMessage {
                        routing_key: m.routing_key.clone(),
                        body: m.body.clone(),
                        headers: m.headers.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every successful publish, in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.clone()
    }

    pub async fn has_exchange(&self, name: &str) -> bool {
        self.inner.state.lock().await.exchanges.contains_key(name)
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().await.queues.contains_key(name)
    }

    /// Entity counts: (exchanges, queues, bindings).
    pub async fn entity_counts(&self) -> (usize, usize, usize) {
        let state = self.inner.state.lock().await;
        (
            state.exchanges.len(),
            state.queues.len(),
            state.bindings.len(),
        )
    }

    /// Make subsequent publishes fail until reset.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Disconnect: further operations fail and open consumer streams end.
    pub fn close(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    id: u64,
}

impl MemoryAcker {
    async fn settle(&self, requeue: Option<bool>) -> Result<(), BrokerError> {
        let mut state = self.inner.state.lock().await;
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::Acknowledge(format!("no queue '{}'", self.queue)))?;
        let message = queue.unacked.remove(&self.id).ok_or_else(|| {
            BrokerError::Acknowledge(format!("delivery {} already settled", self.id))
        })?;

        match requeue {
            None => {}
            Some(true) => queue.ready.push_front(message),
            Some(false) => {
                let arguments = queue.arguments.clone();
                self.inner.dead_letter(&mut state, &arguments, message);
            }
        }
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(None).await
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(Some(requeue)).await
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, exchange: &ExchangeDecl) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if *existing != exchange.kind => Err(BrokerError::PreconditionFailed {
                entity: format!("exchange '{}'", exchange.name),
                message: format!(
                    "inequivalent type: declared {} but existing is {}",
                    exchange.kind, existing
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDecl) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.arguments != queue.arguments => {
                Err(BrokerError::PreconditionFailed {
                    entity: format!("queue '{}'", queue.name),
                    message: format!(
                        "inequivalent arguments: declared {:?} but existing is {:?}",
                        queue.arguments, existing.arguments
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    queue.name.clone(),
                    MemoryQueue {
                        arguments: queue.arguments.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        let mut state = self.inner.state.lock().await;
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(BrokerError::declaration(
                format!("binding {} -> {}", binding.queue, binding.exchange),
                "exchange not found",
            ));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(BrokerError::declaration(
                format!("binding {} -> {}", binding.queue, binding.exchange),
                "queue not found",
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.inner.ensure_connected()?;
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::publish(exchange, "publish rejected (simulated)"));
        }

        let mut state = self.inner.state.lock().await;
        self.inner
            .route(&mut state, exchange, routing_key, &message.body, &message.headers)?;
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: message.body,
            headers: message.headers,
        });
        drop(state);

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.inner.ensure_connected()?;
        if !self.has_queue(queue).await {
            return Err(BrokerError::consume(queue, "queue not found"));
        }

        let seed = (self.inner.clone(), queue.to_string());
        let stream = futures::stream::unfold(seed, move |(inner, queue)| async move {
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !inner.connected.load(Ordering::SeqCst) {
                    return None;
                }

                {
                    let mut state = inner.state.lock().await;
                    let q = state.queues.get_mut(&queue)?;
                    let has_capacity = prefetch == 0 || q.unacked.len() < prefetch as usize;
                    if has_capacity && let Some(message) = q.ready.pop_front() {
                        q.unacked.insert(message.id, message.clone());
                        let acker = MemoryAcker {
                            inner: inner.clone(),
                            queue: queue.clone(),
                            id: message.id,
                        };
                        let delivery = Delivery::new(message.body, message.headers, acker);
                        drop(state);
                        return Some((Ok(delivery), (inner.clone(), queue)));
                    }
                }

                notified.await;
            }
        });

        Ok(Box::pin(stream))
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn provider_name(&self) -> &'static str {
        "in-memory"
    }
}

/// AMQP topic match: `*` is exactly one word, `#` is zero or more words.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}
