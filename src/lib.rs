#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, NetCDF in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Message-driven orchestration core for a multi-stage scientific batch pipeline:
//! data preparation → numerical execution → visualization → result delivery.
//!
//! ## Overview
//!
//! Independent worker processes talk only through a durable RabbitMQ broker. This crate
//! owns the broker plumbing (connection retry, topology, envelope codec, publish and
//! consume), the per-request stage state machine that drives each request through the
//! pipeline, and thin stage workers that hand the real work to external programs.
//!
//! ## Key Features
//!
//! - **Correlated notifications**: every envelope carries `requestId`, so concurrent
//!   requests never act on each other's reports
//! - **At-least-once delivery**: acknowledgement after the handler returns, requeue once,
//!   then dead-letter
//! - **Provider abstraction**: RabbitMQ via `lapin`, or an in-memory broker with the same
//!   routing, prefetch, TTL and dead-letter behavior for tests
//! - **Bounded fan-out**: map rendering across a CPU-sized pool with a join barrier
//!
//! ## Module Organization
//!
//! - [`config`] - Layered configuration with validation
//! - [`constants`] - Topology names, routing keys and operational bounds
//! - [`error`] - Crate-level error type
//! - [`logging`] - Structured logging setup
//! - [`messaging`] - Broker providers, topology, envelope codec, publisher and consumer
//! - [`orchestration`] - Request model, command table, state machine and orchestrator
//! - [`stages`] - Configurator, execution and visualization workers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeline_core::config::PipelineConfig;
//! use pipeline_core::messaging::{declare_topology, ConnectionManager, RabbitMqConnector, Topology};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load(None)?;
//! let manager = ConnectionManager::new(
//!     RabbitMqConnector::new(config.broker.connection_params("example")),
//!     config.broker.retry_policy(),
//! );
//! let broker = manager.connect().await?;
//! declare_topology(&broker, &Topology::pipeline()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod stages;

pub use config::{ConfigurationError, PipelineConfig};
pub use error::{PipelineError, Result};
pub use messaging::{Envelope, MessagingError, Publisher, Status};
pub use orchestration::{Orchestrator, PipelineRequest, PipelineState};
