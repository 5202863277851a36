//! # Connection Manager
//!
//! Opens a broker connection with a bounded, fixed-delay retry policy. Each attempt is
//! independent and logged; after `max_retries` failures the manager returns
//! `MessagingError::ConnectionExhausted` and callers must not retry on their own.
//!
//! A failed connection is replaced, never repaired: every successful `connect` builds a
//! fresh provider and hands it out as a [`BrokerHandle`].

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::broker::{BrokerHandle, BrokerProvider, ConnectionParams, InMemoryBroker, RabbitMqBroker};
use super::{MessagingError, MessagingResult};
use crate::constants::{MAX_RETRIES, RETRY_DELAY};

/// Something that can make one connection attempt
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Single connection attempt
    async fn connect(&self) -> MessagingResult<BrokerProvider>;

    /// Target description for logs; must not contain credentials
    fn describe(&self) -> String;
}

/// Connector for a RabbitMQ server
#[derive(Debug, Clone)]
pub struct RabbitMqConnector {
    params: ConnectionParams,
}

impl RabbitMqConnector {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl BrokerConnector for RabbitMqConnector {
    async fn connect(&self) -> MessagingResult<BrokerProvider> {
        RabbitMqBroker::connect(self.params.clone())
            .await
            .map(BrokerProvider::RabbitMq)
    }

    fn describe(&self) -> String {
        self.params.redacted()
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> MessagingResult<BrokerProvider> {
        Ok(BrokerProvider::InMemory(self.clone()))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Fixed-delay retry bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// Owns the retry loop around a connector
#[derive(Debug)]
pub struct ConnectionManager<C> {
    connector: C,
    policy: RetryPolicy,
}

impl<C: BrokerConnector> ConnectionManager<C> {
    pub fn new(connector: C, policy: RetryPolicy) -> Self {
        Self { connector, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Connect, retrying up to `max_retries` attempts in total
    pub async fn connect(&self) -> MessagingResult<BrokerHandle> {
        let attempts = self.policy.max_retries.max(1);
        let target = self.connector.describe();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            info!(target = %target, attempt, max_attempts = attempts, "Connecting to broker");

            match self.connector.connect().await {
                Ok(provider) => {
                    info!(
                        target = %target,
                        attempt,
                        provider = provider.provider_name(),
                        "Broker connection established"
                    );
                    return Ok(provider.into_handle());
                }
                Err(e) => {
                    warn!(target = %target, attempt, max_attempts = attempts, error = %e, "Broker connection attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }

        error!(target = %target, attempts, "Maximum broker connection attempts reached");
        Err(MessagingError::connection_exhausted(attempts, last_error))
    }
}
