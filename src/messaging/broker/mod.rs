//! # Broker Abstraction
//!
//! Provider-agnostic AMQP-style channel used by every messaging component.
//!
//! - [`BrokerChannel`] - the async trait every provider implements
//! - [`BrokerProvider`] - enum dispatch over the concrete providers
//! - [`RabbitMqBroker`] - production provider (lapin)
//! - [`InMemoryBroker`] - test provider with routing, prefetch, TTL and dead-lettering

pub mod in_memory;
pub mod provider;
pub mod rabbitmq;
pub mod traits;
pub mod types;

pub use in_memory::{topic_matches, InMemoryBroker, PublishedMessage};
pub use provider::{BrokerHandle, BrokerProvider};
pub use rabbitmq::{ConnectionParams, RabbitMqBroker};
pub use traits::BrokerChannel;
pub use types::{
    BrokerDelivery, DeliveryStream, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
