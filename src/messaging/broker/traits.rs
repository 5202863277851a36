//! # Broker Channel Trait
//!
//! Provider-agnostic AMQP-style channel operations.

use async_trait::async_trait;

use super::types::{DeliveryStream, ExchangeSpec, PublishProperties, QueueSpec};
use crate::messaging::MessagingResult;

/// Core broker channel trait
///
/// Implemented by the RabbitMQ provider (lapin) and the in-memory provider used in
/// tests. Declarations must be idempotent: re-declaring an entity with identical
/// parameters succeeds, while changing a flag or argument on an existing entity is a
/// `MessagingError::TopologyConflict`.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare an exchange
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()>;

    /// Declare a queue
    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()>;

    /// Bind a queue to an exchange with a routing key
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> MessagingResult<()>;

    /// Publish a message and wait for the broker to accept it
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()>;

    /// Set the prefetch window applied to consumers created afterwards
    async fn set_prefetch(&self, prefetch: u16) -> MessagingResult<()>;

    /// Start a push consumer on a queue
    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream>;

    /// Acknowledge a delivery
    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()>;

    /// Reject a delivery, optionally returning it to the queue
    ///
    /// With `requeue = false` the broker dead-letters the message when the queue
    /// has a dead-letter exchange configured, otherwise drops it.
    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()>;

    /// Close the channel and its connection
    async fn close(&self) -> MessagingResult<()>;

    /// Whether the underlying connection is still usable
    fn is_connected(&self) -> bool;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}
