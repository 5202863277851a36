//! # Messaging Error Types
//!
//! Structured errors for broker connections, topology declaration, publishing and
//! consuming. Built with thiserror instead of `Box<dyn Error>` so callers can decide
//! retry and ack policy by variant.

use thiserror::Error;

/// Broker-level error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker unavailable after {attempts} connection attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    #[error("Topology conflict on {entity}: {reason}")]
    TopologyConflict { entity: String, reason: String },

    #[error("Declaration failed for {entity}: {message}")]
    Declaration { entity: String, message: String },

    #[error("Exchange not found: {exchange}")]
    ExchangeNotFound { exchange: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Publish to {exchange}/{routing_key} failed: {message}")]
    Publish {
        exchange: String,
        routing_key: String,
        message: String,
    },

    #[error("Queue operation failed: {queue_name}: {operation}: {message}")]
    QueueOperation {
        queue_name: String,
        operation: String,
        message: String,
    },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a retry-exhausted error
    pub fn connection_exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::ConnectionExhausted {
            attempts,
            last_error: last_error.into(),
        }
    }

    /// Create a topology conflict error
    pub fn topology_conflict(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TopologyConflict {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    /// Create a declaration error
    pub fn declaration(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Declaration {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create an exchange not found error
    pub fn exchange_not_found(exchange: impl Into<String>) -> Self {
        Self::ExchangeNotFound {
            exchange: exchange.into(),
        }
    }

    /// Create a queue not found error
    pub fn queue_not_found(queue_name: impl Into<String>) -> Self {
        Self::QueueNotFound {
            queue_name: queue_name.into(),
        }
    }

    /// Create a publish error
    pub fn publish(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Publish {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            message: message.into(),
        }
    }

    /// Create a consume error
    pub fn consume(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: "consume".to_string(),
            message: message.into(),
        }
    }

    /// Create an ack error
    pub fn ack(queue_name: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: format!("ack(delivery_tag={})", delivery_tag),
            message: message.into(),
        }
    }

    /// Create a nack error
    pub fn nack(queue_name: impl Into<String>, delivery_tag: u64, message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: queue_name.into(),
            operation: format!("nack(delivery_tag={})", delivery_tag),
            message: message.into(),
        }
    }

    /// Create a QoS error
    pub fn qos(message: impl Into<String>) -> Self {
        Self::QueueOperation {
            queue_name: "*".to_string(),
            operation: "basic_qos".to_string(),
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a channel closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Publish { .. }
                | Self::QueueOperation { .. }
                | Self::ChannelClosed { .. }
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MessagingError::publish("execution", "execution.algorithm", "channel blocked");
        assert_eq!(
            err.to_string(),
            "Publish to execution/execution.algorithm failed: channel blocked"
        );

        let err = MessagingError::connection_exhausted(5, "connection refused");
        assert!(err.to_string().contains("5 connection attempts"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MessagingError::connection("refused").is_transient());
        assert!(MessagingError::ack("q", 7, "closed").is_transient());
        assert!(!MessagingError::topology_conflict("requests", "type differs").is_transient());
        assert!(!MessagingError::connection_exhausted(5, "down").is_transient());
    }
}
