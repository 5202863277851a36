//! # Consumer
//!
//! One consumer loop per queue. Handlers see only the raw body; the loop alone decides
//! what happens to the delivery:
//!
//! | Handler outcome | Delivery |
//! |-----------------|----------|
//! | `Ok(())` | ack |
//! | `Err(Reject)` | nack without requeue (dead-lettered) |
//! | `Err(Retry)`, first delivery | nack with requeue |
//! | `Err(Retry)`, already redelivered | nack without requeue (dead-lettered) |
//!
//! Acknowledgement only happens after the handler returns, so delivery is at-least-once
//! and handlers must tolerate duplicates.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::broker::{BrokerDelivery, BrokerHandle};
use super::envelope::EnvelopeError;
use super::{MessagingError, MessagingResult};

/// Handler failure, classified for ack policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Will never succeed; dead-letter it
    #[error("message rejected: {0}")]
    Reject(String),

    /// Might succeed on redelivery
    #[error("retryable failure: {0}")]
    Retry(String),
}

impl HandlerError {
    pub fn reject(message: impl Into<String>) -> Self {
        Self::Reject(message.into())
    }

    pub fn retry(message: impl Into<String>) -> Self {
        Self::Retry(message.into())
    }
}

impl From<EnvelopeError> for HandlerError {
    fn from(err: EnvelopeError) -> Self {
        Self::Reject(err.to_string())
    }
}

impl From<MessagingError> for HandlerError {
    fn from(err: MessagingError) -> Self {
        if err.is_transient() {
            Self::Retry(err.to_string())
        } else {
            Self::Reject(err.to_string())
        }
    }
}

/// Business logic attached to a queue
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError>;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "handler"
    }
}

/// What the loop did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

/// Decide ack policy for a handler result
pub fn settle(result: &Result<(), HandlerError>, redelivered: bool) -> DeliveryOutcome {
    match result {
        Ok(()) => DeliveryOutcome::Acked,
        Err(HandlerError::Reject(_)) => DeliveryOutcome::DeadLettered,
        Err(HandlerError::Retry(_)) if redelivered => DeliveryOutcome::DeadLettered,
        Err(HandlerError::Retry(_)) => DeliveryOutcome::Requeued,
    }
}

/// Subscribes handlers to queues
#[derive(Debug, Clone)]
pub struct Consumer {
    broker: BrokerHandle,
    prefetch: u16,
}

impl Consumer {
    pub fn new(broker: BrokerHandle, prefetch: u16) -> Self {
        Self { broker, prefetch }
    }

    /// Apply QoS, start consuming and spawn the delivery loop
    pub async fn subscribe(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagingResult<ConsumerHandle> {
        self.broker.set_prefetch(self.prefetch).await?;

        let consumer_tag = format!("{}-{}", queue, uuid::Uuid::new_v4());
        let stream = self.broker.consume(queue, &consumer_tag).await?;
        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            prefetch = self.prefetch,
            handler = handler.name(),
            "Started consuming"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(
            self.broker.clone(),
            queue.to_string(),
            stream,
            handler,
            shutdown_rx,
        ));

        Ok(ConsumerHandle {
            queue: queue.to_string(),
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Running consumer loop
#[derive(Debug)]
pub struct ConsumerHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<MessagingResult<()>>,
}

impl ConsumerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop after the in-flight delivery and wait for the loop to exit
    pub async fn shutdown(self) -> MessagingResult<()> {
        let _ = self.shutdown.send(true);
        self.join().await
    }

    /// Wait for the loop to end on its own (stream closed or broker error)
    pub async fn join(self) -> MessagingResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MessagingError::consume(
                &self.queue,
                format!("consumer task panicked: {}", e),
            )),
        }
    }
}

async fn run_loop(
    broker: BrokerHandle,
    queue: String,
    mut stream: super::broker::DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> MessagingResult<()> {
    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(queue = %queue, "Consumer shutting down");
                    return Ok(());
                }
                continue;
            }
            next = stream.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => {
                error!(queue = %queue, error = %e, "Delivery stream failed");
                return Err(e);
            }
            None => {
                info!(queue = %queue, "Delivery stream closed");
                return Ok(());
            }
        };

        process_delivery(&broker, &queue, handler.as_ref(), delivery).await?;
    }
}

/// Run one delivery through the handler and settle it
pub async fn process_delivery(
    broker: &BrokerHandle,
    queue: &str,
    handler: &dyn MessageHandler,
    delivery: BrokerDelivery,
) -> MessagingResult<DeliveryOutcome> {
    let result = handler.handle(&delivery.body).await;
    let outcome = settle(&result, delivery.redelivered);

    match (&result, outcome) {
        (Ok(()), _) => debug!(queue = %queue, delivery_tag = delivery.delivery_tag, "Delivery handled"),
        (Err(e), DeliveryOutcome::Requeued) => warn!(
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Handler failed, requeueing delivery"
        ),
        (Err(e), _) => error!(
            queue = %queue,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            error = %e,
            "Handler failed, dead-lettering delivery"
        ),
    }

    match outcome {
        DeliveryOutcome::Acked => broker.ack(queue, delivery.delivery_tag).await?,
        DeliveryOutcome::Requeued => broker.nack(queue, delivery.delivery_tag, true).await?,
        DeliveryOutcome::DeadLettered => broker.nack(queue, delivery.delivery_tag, false).await?,
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_policy() {
        assert_eq!(settle(&Ok(()), false), DeliveryOutcome::Acked);
        assert_eq!(
            settle(&Err(HandlerError::reject("bad")), false),
            DeliveryOutcome::DeadLettered
        );
        assert_eq!(
            settle(&Err(HandlerError::retry("later")), false),
            DeliveryOutcome::Requeued
        );
        assert_eq!(
            settle(&Err(HandlerError::retry("later")), true),
            DeliveryOutcome::DeadLettered
        );
    }

    #[test]
    fn test_envelope_errors_reject() {
        let err: HandlerError = EnvelopeError::malformed("not json").into();
        assert!(matches!(err, HandlerError::Reject(_)));

        let err: HandlerError = MessagingError::publish("results", "results.done", "blocked").into();
        assert!(matches!(err, HandlerError::Retry(_)));
    }
}
