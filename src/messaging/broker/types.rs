//! # Broker Types
//!
//! Declaration and delivery types shared by every broker provider.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::messaging::MessagingError;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Pattern routing with `*` (one word) and `#` (zero or more words)
    Topic,
    /// Exact routing-key match
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic => write!(f, "topic"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Exchange declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Queue declaration
///
/// Arguments are kept ordered so two declarations compare equal regardless of the
/// order the table was built in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }
}

/// Properties attached to a published message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    /// Survive broker restarts (delivery mode 2)
    pub persistent: bool,
    /// Per-message TTL; expired messages are dropped or dead-lettered by the broker
    pub expiration_ms: Option<u64>,
    pub content_type: &'static str,
}

impl Default for PublishProperties {
    fn default() -> Self {
        Self {
            persistent: true,
            expiration_ms: None,
            content_type: "application/json",
        }
    }
}

/// A message handed to a consumer
///
/// Transport metadata stays here; business handlers only ever see `body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Push-based delivery stream returned by `consume`
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<BrokerDelivery, MessagingError>> + Send + 'static>>;
