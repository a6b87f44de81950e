//! Consumer loop: pulls deliveries from the main queue and settles each one.
//!
//! Every delivery is acknowledged only after its follow-up (retry or dead
//! letter) has been published. When that publish fails the delivery is
//! requeued instead, so a message is never lost between queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Semaphore;

use herald_broker::{Broker, BrokerError, Delivery, EnvelopeHeaders, RetryCoordinator, RetryDecision};

use crate::error::WorkerError;
use crate::processor::{DeliveryProcessor, DeliveryState};

/// Running totals exposed on the health endpoint.
#[derive(Debug, Default)]
pub struct Counters {
    received: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Retried { attempt: u32 },
    DeadLettered,
    Requeued,
}

/// Handles one delivery end to end. Cheap to clone; one clone per task.
#[derive(Clone)]
pub struct MessageHandler {
    broker: Arc<dyn Broker>,
    processor: Arc<DeliveryProcessor>,
    coordinator: Arc<RetryCoordinator>,
    counters: Arc<Counters>,
}

impl MessageHandler {
    pub fn new(
        broker: Arc<dyn Broker>,
        processor: Arc<DeliveryProcessor>,
        coordinator: Arc<RetryCoordinator>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            broker,
            processor,
            coordinator,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let retry_count = delivery.headers.retry_count;
        tracing::debug!(retry_count, bytes = delivery.body.len(), "Received delivery");

        let request = match DeliveryProcessor::decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(retry_count, error = %e, "Dropping malformed request to dead-letter queue");
                let headers = delivery.headers.clone();
                return self.dead_letter(&delivery, &headers, &e.to_string()).await;
            }
        };

        let max_retries = self.coordinator.policy().max_retries();
        let mut state = DeliveryState::from_headers(&delivery.headers, max_retries);

        let error = match self.processor.process(&request, &mut state).await {
            Ok(report) => {
                tracing::info!(
                    retry_count,
                    delivered = report.delivered.len(),
                    skipped = report.skipped.len(),
                    "Delivery request completed"
                );
                self.settle(&delivery).await;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                return Outcome::Delivered;
            }
            Err(e) => e,
        };

        let mut headers = delivery.headers.clone();
        state.apply_to(&mut headers);
        let reason = error.to_string();

        if !error.is_retryable() {
            tracing::warn!(retry_count, error = %reason, "Permanent delivery failure");
            return self.dead_letter(&delivery, &headers, &reason).await;
        }

        match self
            .coordinator
            .route_after_failure(self.broker.as_ref(), &delivery.body, &headers, &reason)
            .await
        {
            Ok(RetryDecision::Retry { attempt, .. }) => {
                self.settle(&delivery).await;
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                Outcome::Retried { attempt }
            }
            Ok(RetryDecision::DeadLetter) => {
                self.settle(&delivery).await;
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                Outcome::DeadLettered
            }
            Err(e) => self.requeue(&delivery, e).await,
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, headers: &EnvelopeHeaders, reason: &str) -> Outcome {
        match self
            .coordinator
            .dead_letter(self.broker.as_ref(), &delivery.body, headers, reason)
            .await
        {
            Ok(()) => {
                self.settle(delivery).await;
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                Outcome::DeadLettered
            }
            Err(e) => self.requeue(delivery, e).await,
        }
    }

    async fn settle(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            // The broker redelivers unacknowledged messages once the channel closes.
            tracing::error!(error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn requeue(&self, delivery: &Delivery, cause: BrokerError) -> Outcome {
        tracing::error!(error = %cause, "Follow-up publish failed, requeueing delivery");
        if let Err(e) = delivery.reject(true).await {
            tracing::error!(error = %e, "Failed to requeue delivery");
        }
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        Outcome::Requeued
    }
}

/// Consumes the main queue with bounded concurrency.
pub struct Consumer {
    handler: MessageHandler,
    queue: String,
    prefetch: u16,
    permits: Arc<Semaphore>,
}

impl Consumer {
    pub fn new(handler: MessageHandler, queue: impl Into<String>, prefetch: u16) -> Self {
        Self {
            handler,
            queue: queue.into(),
            prefetch,
            permits: Arc::new(Semaphore::new(Self::slots(prefetch) as usize)),
        }
    }

    fn slots(prefetch: u16) -> u32 {
        u32::from(prefetch.max(1))
    }

    /// Run until the delivery stream ends or fails. Handlers run concurrently,
    /// at most `prefetch` at a time.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut deliveries = self
            .handler
            .broker
            .consume(&self.queue, self.prefetch)
            .await?;

        tracing::info!(
            queue = %self.queue,
            prefetch = self.prefetch,
            "Consumer started"
        );

        while let Some(next) = deliveries.next().await {
            let delivery = match next {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(queue = %self.queue, error = %e, "Delivery stream failed");
                    return Err(e.into());
                }
            };

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::ConsumerClosed)?;
            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                handler.handle(delivery).await;
            });
        }

        tracing::warn!(queue = %self.queue, "Delivery stream ended");
        Err(WorkerError::ConsumerClosed)
    }

    /// Wait for in-flight handlers to settle, then refuse new ones. Call after
    /// `run` has been dropped. Returns `false` if `grace` ran out first.
    pub async fn drain(&self, grace: Duration) -> bool {
        let in_flight = Self::slots(self.prefetch) as usize - self.permits.available_permits();
        tracing::info!(in_flight, grace_secs = grace.as_secs(), "Draining in-flight deliveries");

        let drained = matches!(
            tokio::time::timeout(grace, self.permits.acquire_many(Self::slots(self.prefetch))).await,
            Ok(Ok(_))
        );
        self.permits.close();

        if !drained {
            tracing::warn!("Shutdown grace elapsed with deliveries still in flight");
        }
        drained
    }
}
