//! # Publisher
//!
//! Sends envelopes to an exchange with persistent delivery and a short per-message TTL.
//! A command whose consumer never shows up expires instead of piling up; the publisher
//! gets no signal when that happens.
//!
//! The channel is shared by every task in the process, so publishes are serialized
//! through a single async mutex.
//!
//! ```rust
//! use pipeline_core::constants::{exchanges, routing_keys};
//! use pipeline_core::messaging::{
//!     declare_topology, BrokerProvider, Envelope, InMemoryBroker, Publisher, Topology,
//! };
//! use serde_json::json;
//!
//! # tokio_test::block_on(async {
//! let memory = InMemoryBroker::new();
//! let broker = BrokerProvider::InMemory(memory.clone()).into_handle();
//! declare_topology(&broker, &Topology::pipeline()).await.unwrap();
//!
//! let publisher = Publisher::without_ttl(broker);
//! let envelope = Envelope::ok("", json!({"increment": 1, "message": "started"}))
//!     .with_request_id("req-1");
//! publisher
//!     .publish(exchanges::PROGRESS, routing_keys::PROGRESS_UPDATE, envelope)
//!     .await
//!     .unwrap();
//! assert_eq!(memory.published().len(), 1);
//! # });
//! ```

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::broker::{BrokerHandle, PublishProperties};
use super::envelope::Envelope;
use super::payloads::StagePayload;
use super::{MessagingError, MessagingResult};

#[derive(Debug)]
pub struct Publisher {
    broker: BrokerHandle,
    message_ttl: Option<Duration>,
    publish_lock: Mutex<()>,
}

impl Publisher {
    pub fn new(broker: BrokerHandle, message_ttl: Duration) -> Self {
        Self {
            broker,
            message_ttl: Some(message_ttl),
            publish_lock: Mutex::new(()),
        }
    }

    /// Publisher whose messages never expire
    pub fn without_ttl(broker: BrokerHandle) -> Self {
        Self {
            broker,
            message_ttl: None,
            publish_lock: Mutex::new(()),
        }
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }

    fn properties(&self) -> PublishProperties {
        PublishProperties {
            persistent: true,
            expiration_ms: self.message_ttl.map(|ttl| ttl.as_millis() as u64),
            ..Default::default()
        }
    }

    /// Publish an envelope; the routing key is recorded as its pattern when unset
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> MessagingResult<()> {
        let envelope = if envelope.pattern.is_none() {
            envelope.with_pattern(routing_key)
        } else {
            envelope
        };
        let body = envelope
            .encode()
            .map_err(|e| MessagingError::serialization(e.to_string()))?;

        let _guard = self.publish_lock.lock().await;
        self.broker
            .publish(exchange, routing_key, &body, &self.properties())
            .await?;

        debug!(
            exchange = %exchange,
            routing_key = %routing_key,
            request_id = envelope.request_id.as_deref().unwrap_or("-"),
            status = envelope.status.as_str(),
            "Published envelope"
        );
        Ok(())
    }

    /// Publish a typed payload as an OK envelope
    pub async fn publish_payload(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &StagePayload,
        message: &str,
    ) -> MessagingResult<()> {
        let envelope = payload
            .to_envelope(message)
            .map_err(|e| MessagingError::serialization(e.to_string()))?;
        self.publish(exchange, routing_key, envelope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::broker::{BrokerProvider, ExchangeKind, ExchangeSpec, InMemoryBroker};
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_publish_sets_persistence_ttl_and_pattern() {
        let memory = InMemoryBroker::new();
        let handle = BrokerProvider::from(memory.clone()).into_handle();
        handle
            .declare_exchange(&ExchangeSpec::new("progress", ExchangeKind::Topic))
            .await
            .unwrap();

        let publisher = Publisher::new(handle, Duration::from_millis(5000));
        publisher
            .publish(
                "progress",
                "progress.update",
                Envelope::ok("", json!({"increment": 1, "message": "go"})),
            )
            .await
            .unwrap();

        let published = memory.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].persistent);
        assert_eq!(published[0].expiration_ms, Some(5000));

        let raw: Value = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(raw["pattern"], "progress.update");
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_exchange_fails() {
        let handle = BrokerProvider::from(InMemoryBroker::new()).into_handle();
        let publisher = Publisher::new(handle, Duration::from_millis(5000));
        let result = publisher
            .publish("results", "results.done", Envelope::error("boom"))
            .await;
        assert!(result.is_err());
    }
}
