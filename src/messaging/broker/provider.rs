//! # Broker Provider Enum
//!
//! Enum dispatch for broker providers, avoiding trait object overhead.

use std::sync::Arc;

use super::in_memory::InMemoryBroker;
use super::rabbitmq::RabbitMqBroker;
use super::traits::BrokerChannel;
use super::types::{DeliveryStream, ExchangeSpec, PublishProperties, QueueSpec};
use crate::messaging::MessagingResult;

/// Provider enum for static dispatch
///
/// Publishers, consumers and the orchestrator hold an `Arc<BrokerProvider>` handed
/// to them by the Connection Manager. Nothing keeps a process-wide client; replacing
/// a failed connection means building a new provider.
///
/// # Variants
///
/// - `RabbitMq` - RabbitMQ via the lapin crate
/// - `InMemory` - In-process broker for tests and local runs
#[derive(Debug)]
pub enum BrokerProvider {
    /// RabbitMQ provider (AMQP 0.9.1)
    RabbitMq(RabbitMqBroker),

    /// In-memory provider for testing
    InMemory(InMemoryBroker),
}

/// Shared handle passed by ownership into every broker user
pub type BrokerHandle = Arc<BrokerProvider>;

impl BrokerProvider {
    /// Wrap a provider into a shareable handle
    pub fn into_handle(self) -> BrokerHandle {
        Arc::new(self)
    }

    /// Get the provider name for logging
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::RabbitMq(b) => b.provider_name(),
            Self::InMemory(b) => b.provider_name(),
        }
    }

    /// Declare an exchange
    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.declare_exchange(spec).await,
            Self::InMemory(b) => b.declare_exchange(spec).await,
        }
    }

    /// Declare a queue
    pub async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.declare_queue(spec).await,
            Self::InMemory(b) => b.declare_queue(spec).await,
        }
    }

    /// Bind a queue to an exchange
    pub async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.bind_queue(queue, exchange, routing_key).await,
            Self::InMemory(b) => b.bind_queue(queue, exchange, routing_key).await,
        }
    }

    /// Publish raw bytes
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.publish(exchange, routing_key, body, properties).await,
            Self::InMemory(b) => b.publish(exchange, routing_key, body, properties).await,
        }
    }

    /// Set the consumer prefetch window
    pub async fn set_prefetch(&self, prefetch: u16) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.set_prefetch(prefetch).await,
            Self::InMemory(b) => b.set_prefetch(prefetch).await,
        }
    }

    /// Start consuming a queue
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream> {
        match self {
            Self::RabbitMq(b) => b.consume(queue, consumer_tag).await,
            Self::InMemory(b) => b.consume(queue, consumer_tag).await,
        }
    }

    /// Acknowledge a delivery
    pub async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.ack(queue, delivery_tag).await,
            Self::InMemory(b) => b.ack(queue, delivery_tag).await,
        }
    }

    /// Negative-acknowledge a delivery
    pub async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.nack(queue, delivery_tag, requeue).await,
            Self::InMemory(b) => b.nack(queue, delivery_tag, requeue).await,
        }
    }

    /// Close the underlying connection
    pub async fn close(&self) -> MessagingResult<()> {
        match self {
            Self::RabbitMq(b) => b.close().await,
            Self::InMemory(b) => b.close().await,
        }
    }

    /// Connection liveness
    pub fn is_connected(&self) -> bool {
        match self {
            Self::RabbitMq(b) => b.is_connected(),
            Self::InMemory(b) => b.is_connected(),
        }
    }

    /// Borrow the in-memory provider, if that is what this is (for testing)
    pub fn as_in_memory(&self) -> Option<&InMemoryBroker> {
        match self {
            Self::InMemory(b) => Some(b),
            Self::RabbitMq(_) => None,
        }
    }
}

impl From<InMemoryBroker> for BrokerProvider {
    fn from(broker: InMemoryBroker) -> Self {
        Self::InMemory(broker)
    }
}

impl From<RabbitMqBroker> for BrokerProvider {
    fn from(broker: RabbitMqBroker) -> Self {
        Self::RabbitMq(broker)
    }
}
