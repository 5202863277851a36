//! # In-Memory Broker
//!
//! Thread-safe in-memory AMQP-style broker for testing and local development.
//!
//! ## Features
//!
//! - **Routing**: direct exchanges, topic exchanges (`*` / `#`), and the default
//!   exchange (`""`) routing straight to the queue named by the routing key
//! - **Prefetch**: a consumer never holds more unacked deliveries than its window
//! - **TTL**: expired messages are dropped, or dead-lettered when the queue has a
//!   dead-letter exchange
//! - **Ack/Nack**: requeue puts the message back at the head flagged as redelivered
//! - **Conflict detection**: re-declaring with different flags is a topology conflict
//!
//! One consumer per queue is supported. Every publish is recorded so tests can assert
//! on what was (or was not) sent.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::traits::BrokerChannel;
use super::types::{
    BrokerDelivery, DeliveryStream, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::constants::queue_arguments;
use crate::messaging::{MessagingError, MessagingResult};

/// A record of one publish call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub expiration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct QueueConsumer {
    tag: String,
    prefetch: u16,
    sender: mpsc::UnboundedSender<BrokerDelivery>,
}

#[derive(Debug)]
struct MemoryQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    consumer: Option<QueueConsumer>,
}

impl MemoryQueue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<Binding>,
    published: Vec<PublishedMessage>,
    prefetch: u16,
    next_delivery_tag: u64,
    failing_publishes: u32,
    closed: bool,
}

impl BrokerState {
    /// Enqueue a message on every queue the exchange routes it to
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        ttl: Option<Duration>,
    ) -> MessagingResult<Vec<String>> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default()
        } else {
            let spec = self
                .exchanges
                .get(exchange)
                .ok_or_else(|| MessagingError::exchange_not_found(exchange))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
                let matched = match spec.kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        for queue_name in &targets {
            if let Some(queue) = self.queues.get_mut(queue_name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    expires_at,
                    redelivered: false,
                });
            }
        }
        Ok(targets)
    }

    /// Push ready messages to the queue's consumer within its prefetch window
    fn dispatch(&mut self, queue_name: &str) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let BrokerState {
            queues,
            next_delivery_tag,
            ..
        } = self;

        if let Some(queue) = queues.get_mut(queue_name) {
            let consumer = queue
                .consumer
                .as_ref()
                .map(|c| (c.sender.clone(), c.prefetch));

            match consumer {
                None => {
                    let (live, dead): (VecDeque<_>, VecDeque<_>) =
                        queue.ready.drain(..).partition(|m| !m.is_expired(now));
                    queue.ready = live;
                    expired.extend(dead);
                }
                Some((sender, prefetch)) => loop {
                    if prefetch > 0 && queue.unacked.len() >= usize::from(prefetch) {
                        break;
                    }
                    let Some(message) = queue.ready.pop_front() else {
                        break;
                    };
                    if message.is_expired(now) {
                        expired.push(message);
                        continue;
                    }
                    *next_delivery_tag += 1;
                    let delivery = BrokerDelivery {
                        delivery_tag: *next_delivery_tag,
                        exchange: message.exchange.clone(),
                        routing_key: message.routing_key.clone(),
                        redelivered: message.redelivered,
                        body: message.body.clone(),
                    };
                    if sender.send(delivery).is_err() {
                        // Consumer stream dropped
                        queue.ready.push_front(message);
                        queue.consumer = None;
                        break;
                    }
                    queue.unacked.insert(*next_delivery_tag, message);
                },
            }
        }

        for message in expired {
            self.dead_letter(queue_name, message);
        }
    }

    /// Route a rejected or expired message through the queue's dead-letter exchange
    fn dead_letter(&mut self, queue_name: &str, message: StoredMessage) {
        let Some((dlx, dl_key)) = self.queues.get(queue_name).and_then(|q| {
            q.spec
                .arguments
                .get(queue_arguments::DEAD_LETTER_EXCHANGE)
                .map(|dlx| {
                    let key = q
                        .spec
                        .arguments
                        .get(queue_arguments::DEAD_LETTER_ROUTING_KEY)
                        .cloned()
                        .unwrap_or_else(|| message.routing_key.clone());
                    (dlx.clone(), key)
                })
        }) else {
            tracing::debug!(queue = %queue_name, "Dropping message without dead-letter exchange");
            return;
        };

        match self.route(&dlx, &dl_key, &message.body, None) {
            Ok(targets) => {
                for target in targets {
                    if target != queue_name {
                        self.dispatch(&target);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(queue = %queue_name, error = %e, "Dead-lettering failed; message dropped");
            }
        }
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.closed {
            Err(MessagingError::channel_closed("in-memory broker is closed"))
        } else {
            Ok(())
        }
    }
}

/// Match a routing key against a topic binding pattern
///
/// `*` matches exactly one dot-separated word, `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
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
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-memory broker provider
///
/// Cloning shares the same underlying state, so a test can keep a handle for
/// inspection while the provider is owned by the system under test.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in publish order (for testing)
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages published to one exchange with one routing key (for testing)
    pub fn published_to(&self, exchange: &str, routing_key: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.exchange == exchange && m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Number of ready (undelivered, unexpired) messages in a queue
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        let mut state = self.state.lock();
        state.dispatch(queue_name);
        state
            .queues
            .get(queue_name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Number of delivered but unacknowledged messages in a queue
    pub fn unacked_count(&self, queue_name: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Remove and return the bodies of all ready messages in a queue (for testing)
    pub fn take_ready(&self, queue_name: &str) -> Vec<Vec<u8>> {
        let mut state = self.state.lock();
        state.dispatch(queue_name);
        state
            .queues
            .get_mut(queue_name)
            .map(|q| q.ready.drain(..).map(|m| m.body).collect())
            .unwrap_or_default()
    }

    /// Declared exchange, if any
    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state.lock().exchanges.get(name).cloned()
    }

    /// Declared queue, if any
    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state.lock().queues.get(name).map(|q| q.spec.clone())
    }

    /// All bindings as `(queue, exchange, routing_key)`
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state
            .lock()
            .bindings
            .iter()
            .map(|b| (b.queue.clone(), b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Consumer tag currently attached to a queue
    pub fn consumer_tag(&self, queue_name: &str) -> Option<String> {
        self.state
            .lock()
            .queues
            .get(queue_name)
            .and_then(|q| q.consumer.as_ref().map(|c| c.tag.clone()))
    }

    /// Make the next `count` publish calls fail (for testing)
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.lock().failing_publishes = count;
    }
}

#[async_trait]
impl BrokerChannel for InMemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing == spec => Ok(()),
            Some(existing) => Err(MessagingError::topology_conflict(
                &spec.name,
                format!(
                    "exchange exists as {} (durable={}), redeclared as {} (durable={})",
                    existing.kind, existing.durable, spec.kind, spec.durable
                ),
            )),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        match state.queues.get(&spec.name) {
            Some(existing) if &existing.spec == spec => Ok(()),
            Some(existing) => Err(MessagingError::topology_conflict(
                &spec.name,
                format!(
                    "queue exists with durable={} arguments={:?}, redeclared with durable={} arguments={:?}",
                    existing.spec.durable, existing.spec.arguments, spec.durable, spec.arguments
                ),
            )),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), MemoryQueue::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::exchange_not_found(exchange));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::queue_not_found(queue));
        }

        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(MessagingError::publish(
                exchange,
                routing_key,
                "injected publish failure",
            ));
        }

        let ttl = properties.expiration_ms.map(Duration::from_millis);
        let targets = state.route(exchange, routing_key, body, ttl)?;

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            persistent: properties.persistent,
            expiration_ms: properties.expiration_ms,
        });

        if targets.is_empty() {
            tracing::debug!(exchange = %exchange, routing_key = %routing_key, "Unroutable message dropped");
        }
        for target in targets {
            state.dispatch(&target);
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.prefetch = prefetch;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;
            let prefetch = state.prefetch;

            let memory_queue = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| MessagingError::queue_not_found(queue))?;
            if let Some(existing) = &memory_queue.consumer {
                if !existing.sender.is_closed() {
                    return Err(MessagingError::consume(
                        queue,
                        format!("queue already consumed by {}", existing.tag),
                    ));
                }
            }
            memory_queue.consumer = Some(QueueConsumer {
                tag: consumer_tag.to_string(),
                prefetch,
                sender,
            });
            state.dispatch(queue);
        }

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let removed = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?
            .unacked
            .remove(&delivery_tag);
        if removed.is_none() {
            return Err(MessagingError::ack(queue, delivery_tag, "unknown delivery tag"));
        }
        state.dispatch(queue);
        Ok(())
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let memory_queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::queue_not_found(queue))?;
        let mut message = memory_queue
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| MessagingError::nack(queue, delivery_tag, "unknown delivery tag"))?;

        if requeue {
            message.redelivered = true;
            memory_queue.ready.push_front(message);
        } else {
            state.dead_letter(queue, message);
        }
        state.dispatch(queue);
        Ok(())
    }

    async fn close(&self) -> MessagingResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.consumer = None;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.state.lock().closed
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}
