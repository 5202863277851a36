//! # RabbitMQ Broker
//!
//! `BrokerChannel` implementation over AMQP 0.9.1 using the `lapin` crate.
//!
//! ## Features
//!
//! - **Durable topology**: exchanges and queues declared from `ExchangeSpec` / `QueueSpec`
//! - **Dead Letter Exchanges**: queue arguments pass straight through to the broker
//! - **Publisher confirms**: `publish` waits for the broker to confirm the message
//! - **Prefetch Control**: `basic_qos` before any consumer is created
//!
//! A connection is never repaired in place. When it drops, the owning process builds a
//! new `RabbitMqBroker` through the Connection Manager.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use super::traits::BrokerChannel;
use super::types::{
    BrokerDelivery, DeliveryStream, ExchangeKind, ExchangeSpec, PublishProperties, QueueSpec,
};
use crate::constants::PERSISTENT_DELIVERY_MODE;
use crate::messaging::{MessagingError, MessagingResult};

/// Everything needed to open one AMQP connection
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_seconds: u16,
    pub blocked_timeout: Duration,
    pub connection_name: String,
}

impl ConnectionParams {
    /// Build the URI field by field so credentials never need percent-encoding
    fn to_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_seconds),
                connection_timeout: Some(self.blocked_timeout.as_millis() as u64),
                ..Default::default()
            },
        }
    }

    /// Connection target with credentials hidden, for logging
    pub fn redacted(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            self.username,
            self.host,
            self.port,
            self.vhost.trim_start_matches('/')
        )
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("target", &self.redacted())
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .field("blocked_timeout", &self.blocked_timeout)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

/// Map a lapin declaration error, surfacing redeclare mismatches as conflicts
fn declaration_error(entity: &str, err: lapin::Error) -> MessagingError {
    let error_str = err.to_string();
    if error_str.contains("PRECONDITION_FAILED") || error_str.contains("406") {
        MessagingError::topology_conflict(entity, error_str)
    } else if error_str.contains("NOT_FOUND") || error_str.contains("404") {
        MessagingError::declaration(entity, format!("referenced entity missing: {}", error_str))
    } else {
        MessagingError::declaration(entity, error_str)
    }
}

/// RabbitMQ-backed broker channel
///
/// Owns exactly one connection and one channel.
pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
    params: ConnectionParams,
}

impl fmt::Debug for RabbitMqBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqBroker")
            .field("params", &self.params)
            .field("connected", &self.connection.status().connected())
            .finish()
    }
}

impl RabbitMqBroker {
    /// Open a connection and a channel
    ///
    /// A single attempt; retry policy belongs to the Connection Manager.
    pub async fn connect(params: ConnectionParams) -> MessagingResult<Self> {
        let properties = ConnectionProperties::default()
            .with_connection_name(params.connection_name.clone().into());

        let connection = tokio::time::timeout(
            params.blocked_timeout,
            Connection::connect_uri(params.to_uri(), properties),
        )
        .await
        .map_err(|_| {
            MessagingError::connection(format!(
                "connection to {} timed out after {:?}",
                params.redacted(),
                params.blocked_timeout
            ))
        })?
        .map_err(|e| {
            MessagingError::connection(format!("RabbitMQ connection failed: {}", e))
        })?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {}", e))
        })?;

        tracing::debug!(target = %params.redacted(), "RabbitMQ channel opened");

        Ok(Self {
            connection,
            channel,
            params,
        })
    }

    /// Connection parameters this broker was opened with
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> MessagingResult<()> {
        let kind = match spec.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };

        self.channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(&spec.name, e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> MessagingResult<()> {
        let mut args = FieldTable::default();
        for (key, value) in &spec.arguments {
            args.insert(
                key.clone().into(),
                AMQPValue::LongString(value.clone().into()),
            );
        }

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    ..Default::default()
                },
                args,
            )
            .await
            .map(|_| ())
            .map_err(|e| declaration_error(&spec.name, e))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> MessagingResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declaration_error(&format!("{}->{}", exchange, queue), e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> MessagingResult<()> {
        let mut amqp_properties =
            BasicProperties::default().with_content_type(properties.content_type.into());
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(ttl) = properties.expiration_ms {
            amqp_properties = amqp_properties.with_expiration(ttl.to_string().into());
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                amqp_properties,
            )
            .await
            .map_err(|e| {
                MessagingError::publish(exchange, routing_key, format!("Publish failed: {}", e))
            })?;

        confirm.await.map_err(|e| {
            MessagingError::publish(
                exchange,
                routing_key,
                format!("Publish confirmation failed: {}", e),
            )
        })?;

        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> MessagingResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| MessagingError::qos(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> MessagingResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::consume(queue, e.to_string()))?;

        let queue_name = queue.to_string();
        let stream = consumer.map(move |item| {
            item.map(|delivery| BrokerDelivery {
                delivery_tag: delivery.delivery_tag,
                exchange: delivery.exchange.to_string(),
                routing_key: delivery.routing_key.to_string(),
                redelivered: delivery.redelivered,
                body: delivery.data,
            })
            .map_err(|e| MessagingError::consume(&queue_name, e.to_string()))
        });

        Ok(Box::pin(stream))
    }

    async fn ack(&self, queue: &str, delivery_tag: u64) -> MessagingResult<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::ack(queue, delivery_tag, e.to_string()))
    }

    async fn nack(&self, queue: &str, delivery_tag: u64, requeue: bool) -> MessagingResult<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::nack(queue, delivery_tag, e.to_string()))
    }

    async fn close(&self) -> MessagingResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| MessagingError::connection(format!("close failed: {}", e)))
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}
