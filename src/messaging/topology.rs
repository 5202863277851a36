//! # Topology Manager
//!
//! Static exchange / queue / binding table for the pipeline and its idempotent
//! declaration. Exchanges are declared first, then each queue followed by its single
//! binding. The first failure closes the connection and aborts; there is no
//! partial-topology mode.

use tracing::{debug, error, info};

use super::broker::{BrokerProvider, ExchangeKind, ExchangeSpec, QueueSpec};
use super::MessagingResult;
use crate::constants::{exchanges, queue_arguments, queues, routing_keys};

/// One queue with the single routing key binding it to one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: QueueSpec,
    pub exchange: String,
    pub routing_key: String,
}

/// Complete topology table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueBinding>,
}

impl Topology {
    /// The pipeline topology
    ///
    /// Every work queue dead-letters into `dead_letter_queue` through the
    /// `dead_letter` direct exchange.
    pub fn pipeline() -> Self {
        let exchanges = vec![
            ExchangeSpec::new(exchanges::REQUESTS, ExchangeKind::Topic),
            ExchangeSpec::new(exchanges::EXECUTION, ExchangeKind::Topic),
            ExchangeSpec::new(exchanges::NOTIFICATIONS, ExchangeKind::Direct),
            ExchangeSpec::new(exchanges::RESULTS, ExchangeKind::Direct),
            ExchangeSpec::new(exchanges::PROGRESS, ExchangeKind::Topic),
            ExchangeSpec::new(exchanges::DEAD_LETTER, ExchangeKind::Direct),
        ];

        let work_queue = |name: &str, exchange: &str, routing_key: &str| QueueBinding {
            queue: QueueSpec::new(name)
                .with_argument(queue_arguments::DEAD_LETTER_EXCHANGE, exchanges::DEAD_LETTER)
                .with_argument(queue_arguments::DEAD_LETTER_ROUTING_KEY, routing_keys::DEAD_LETTER),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };

        let queues = vec![
            work_queue(queues::CONFIG, exchanges::REQUESTS, routing_keys::CONFIG_CREATE),
            work_queue(queues::HANDLER, exchanges::REQUESTS, routing_keys::HANDLER_START),
            work_queue(
                queues::EXECUTION_ALGORITHM,
                exchanges::EXECUTION,
                routing_keys::EXECUTION_ALGORITHM,
            ),
            work_queue(
                queues::EXECUTION_VISUALIZATION,
                exchanges::EXECUTION,
                routing_keys::EXECUTION_VISUALIZATION,
            ),
            work_queue(
                queues::NOTIFICATIONS,
                exchanges::NOTIFICATIONS,
                routing_keys::NOTIFY_HANDLER,
            ),
            work_queue(queues::RESULTS, exchanges::RESULTS, routing_keys::RESULTS_DONE),
            work_queue(queues::PROGRESS, exchanges::PROGRESS, routing_keys::PROGRESS_UPDATE),
            QueueBinding {
                queue: QueueSpec::new(queues::DEAD_LETTER),
                exchange: exchanges::DEAD_LETTER.to_string(),
                routing_key: routing_keys::DEAD_LETTER.to_string(),
            },
        ];

        Self { exchanges, queues }
    }

    /// Queue bound with the given routing key, if any
    pub fn queue_for(&self, routing_key: &str) -> Option<&QueueBinding> {
        self.queues.iter().find(|q| q.routing_key == routing_key)
    }
}

/// Declare every exchange, then every queue and its binding
///
/// On the first error the connection is closed and the error returned.
pub async fn declare_topology(broker: &BrokerProvider, topology: &Topology) -> MessagingResult<()> {
    info!(
        provider = broker.provider_name(),
        exchanges = topology.exchanges.len(),
        queues = topology.queues.len(),
        "Declaring broker topology"
    );

    if let Err(e) = declare_all(broker, topology).await {
        error!(error = %e, "Topology declaration failed, closing connection");
        if let Err(close_err) = broker.close().await {
            debug!(error = %close_err, "Close after failed declaration also failed");
        }
        return Err(e);
    }

    info!("Broker topology declared");
    Ok(())
}

async fn declare_all(broker: &BrokerProvider, topology: &Topology) -> MessagingResult<()> {
    for exchange in &topology.exchanges {
        broker.declare_exchange(exchange).await?;
        debug!(exchange = %exchange.name, kind = %exchange.kind, "Exchange declared");
    }

    for binding in &topology.queues {
        broker.declare_queue(&binding.queue).await?;
        broker
            .bind_queue(&binding.queue.name, &binding.exchange, &binding.routing_key)
            .await?;
        debug!(
            queue = %binding.queue.name,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Queue declared and bound"
        );
    }

    Ok(())
}
