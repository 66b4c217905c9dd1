//! Shared ack/nack/DLQ harness every stage's handler runs under (§4.1,
//! §5, §7). Handlers themselves are pure functions `Envelope -> Result`;
//! this module is the runtime that wraps them with acknowledgement,
//! deadlines, and failure routing, per §9's "async maps to lightweight
//! tasks" note.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ErrorKind, PipelineError};
use crate::logging::{log_error_chain, log_worker_event};
use crate::pipeline::bus::{Bus, Delivery};
use crate::pipeline::envelope::{Envelope, Failure};

/// After this many delivery attempts a `Logic` error (unexpected panic or
/// uncategorized bug) is promoted to `Permanent` and DLQ'd (§7).
const LOGIC_ERROR_PROMOTION_ATTEMPT: u32 = 3;

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), PipelineError>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), PipelineError> {
        self(envelope).await
    }
}

pub struct WorkerPool {
    bus: Arc<dyn Bus>,
    ack_wait: Duration,
    max_deliveries: u32,
    deadline: Duration,
}

impl WorkerPool {
    pub fn new(bus: Arc<dyn Bus>, ack_wait: Duration, max_deliveries: u32, deadline: Duration) -> Self {
        WorkerPool { bus, ack_wait, max_deliveries, deadline }
    }

    /// Run `concurrency` polling tasks for `(subject, group)` until the
    /// returned handle is aborted. Each task handles at most one message
    /// at a time (§5: "bounded worker pool per subscription").
    pub fn spawn(
        self: Arc<Self>,
        subject: &'static str,
        group: &'static str,
        concurrency: u32,
        handler: Arc<dyn Handler>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..concurrency)
            .map(|_| {
                let pool = self.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        match pool.bus.poll(subject, group, pool.ack_wait).await {
                            Ok(Some(delivery)) => pool.process(delivery, handler.as_ref()).await,
                            Ok(None) => tokio::time::sleep(Duration::from_millis(100)).await,
                            Err(e) => {
                                log::error!("poll failed for {}/{}: {}", subject, group, e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }

    async fn process(&self, delivery: Delivery, handler: &dyn Handler) {
        let envelope = delivery.envelope.clone();
        log_worker_event(
            "received",
            &envelope.subject,
            &envelope.correlation_id,
            envelope.attempt,
            &format!("messageId={}", envelope.message_id),
        );

        let outcome = tokio::time::timeout(self.deadline, handler.handle(envelope.clone())).await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.bus.ack(delivery.delivery_id).await {
                    log::error!("failed to ack delivery {}: {}", delivery.delivery_id, e);
                }
                log_worker_event("acked", &envelope.subject, &envelope.correlation_id, envelope.attempt, "");
            }
            Ok(Err(error)) => self.route_failure(delivery, &envelope, error).await,
            Err(_elapsed) => {
                log_worker_event(
                    "deadline_exceeded",
                    &envelope.subject,
                    &envelope.correlation_id,
                    envelope.attempt,
                    "",
                );
                self.nack_or_dlq(delivery, &envelope, "handler deadline exceeded".to_string()).await;
            }
        }
    }

    async fn route_failure(&self, delivery: Delivery, envelope: &Envelope, error: PipelineError) {
        let kind = error.classify();
        let reason = error.to_string();
        log_error_chain(&format!("{}/{}", envelope.subject, envelope.correlation_id), &error);
        match kind {
            ErrorKind::Permanent => self.dead_letter(delivery, envelope, reason).await,
            ErrorKind::Transient => self.nack_or_dlq(delivery, envelope, reason).await,
            ErrorKind::Logic => {
                if envelope.attempt >= LOGIC_ERROR_PROMOTION_ATTEMPT {
                    self.dead_letter(delivery, envelope, format!("promoted after {} attempts: {}", envelope.attempt, reason)).await;
                } else {
                    self.nack_or_dlq(delivery, envelope, reason).await;
                }
            }
        }
    }

    /// Negative-ack unless this delivery has already exhausted
    /// `maxDeliveries`, in which case it goes straight to the DLQ
    /// (§4.1: "After maxDeliveries the message is routed to dlq.<subject>").
    async fn nack_or_dlq(&self, delivery: Delivery, envelope: &Envelope, reason: String) {
        if envelope.attempt >= self.max_deliveries {
            self.dead_letter(delivery, envelope, format!("max deliveries ({}) exceeded: {}", self.max_deliveries, reason)).await;
            return;
        }
        log_worker_event("nacked", &envelope.subject, &envelope.correlation_id, envelope.attempt, &reason);
        if let Err(e) = self.bus.nack(delivery.delivery_id).await {
            log::error!("failed to nack delivery {}: {}", delivery.delivery_id, e);
        }
    }

    async fn dead_letter(&self, delivery: Delivery, envelope: &Envelope, reason: String) {
        log_worker_event("dead_lettered", &envelope.subject, &envelope.correlation_id, envelope.attempt, &reason);
        let failure = Failure { reason, stack: None, last_attempt: chrono::Utc::now() };
        if let Err(e) = self.bus.dead_letter(delivery.delivery_id, envelope, failure).await {
            log::error!("failed to dead-letter delivery {}: {}", delivery.delivery_id, e);
        }
    }
}
