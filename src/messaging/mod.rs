//! # Messaging Module
//!
//! Broker plumbing for the pipeline: connection management, topology, the envelope
//! codec, publishing, consuming and notification helpers.

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod errors;
pub mod notifier;
pub mod payloads;
pub mod publisher;
pub mod topology;

pub use broker::{BrokerHandle, BrokerProvider, InMemoryBroker};
pub use connection::{BrokerConnector, ConnectionManager, RabbitMqConnector, RetryPolicy};
pub use consumer::{Consumer, ConsumerHandle, DeliveryOutcome, HandlerError, MessageHandler};
pub use envelope::{Envelope, EnvelopeError, EnvelopeResult, Status};
pub use errors::{MessagingError, MessagingResult};
pub use notifier::{ProgressNotifier, ResultNotifier, StageNotifier};
pub use payloads::{
    ExecutionCommand, PayloadKind, ProgressUpdate, ResultContent, Stage, StagePayload,
    StageReport, VisualizationCommand,
};
pub use publisher::Publisher;
pub use topology::{declare_topology, Topology};
