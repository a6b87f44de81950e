//! Retry Coordinator: routes a failed message to the next ladder step or to
//! the dead-letter exchange. The body is republished byte-for-byte; only the
//! envelope headers change.

use std::time::Duration;

use herald_common::config::{RetryPolicy, TopologyConfig};

use crate::envelope::truncate_reason;
use crate::{Broker, BrokerError, EnvelopeHeaders, OutboundMessage};

/// How a retry waits out its delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Publish to `E.retry.{n}`; the queue TTL returns it to `E`.
    Ladder,
    /// Sleep in-task for the step's delay, then republish to `E`. Used when
    /// the worker does not own the topology.
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    DeadLetter,
}

pub struct RetryCoordinator {
    topology: TopologyConfig,
    policy: RetryPolicy,
    mode: RetryMode,
}

impl RetryCoordinator {
    pub fn new(topology: TopologyConfig, policy: RetryPolicy, mode: RetryMode) -> Self {
        Self {
            topology,
            policy,
            mode,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn decide(&self, current_retry_count: u32) -> RetryDecision {
        let attempt = current_retry_count.saturating_add(1);
        match self.policy.delay_for(attempt) {
            Some(delay) if current_retry_count < self.policy.max_retries() => {
                RetryDecision::Retry { attempt, delay }
            }
            _ => RetryDecision::DeadLetter,
        }
    }

    /// Route a failed message. `headers` describe the delivery as received
    /// (plus any per-channel progress); the retry count is advanced here.
    pub async fn route_after_failure(
        &self,
        broker: &dyn Broker,
        body: &[u8],
        headers: &EnvelopeHeaders,
        reason: &str,
    ) -> Result<RetryDecision, BrokerError> {
        let decision = self.decide(headers.retry_count);

        match &decision {
            RetryDecision::Retry { attempt, delay } => {
                let mut next = headers.clone();
                next.retry_count = *attempt;
                next.final_failure = false;
                next.failure_reason = Some(truncate_reason(reason));
                let message = OutboundMessage::new(body, next);

                match self.mode {
                    RetryMode::Ladder => {
                        let exchange = self.topology.retry_exchange(*attempt);
                        broker
                            .publish(&exchange, &self.topology.routing_key, message)
                            .await?;
                        tracing::info!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            exchange = %exchange,
                            "Scheduled retry"
                        );
                    }
                    RetryMode::InProcess => {
                        tracing::info!(
                            attempt,
                            delay_secs = delay.as_secs(),
                            "Waiting before in-process retry"
                        );
                        tokio::time::sleep(*delay).await;
                        broker
                            .publish(&self.topology.exchange, &self.topology.routing_key, message)
                            .await?;
                    }
                }
            }
            RetryDecision::DeadLetter => {
                self.dead_letter(broker, body, headers, reason).await?;
            }
        }

        Ok(decision)
    }

    /// Publish to the dead-letter exchange with `x-final-failure` set. The
    /// retry count is kept as received.
    pub async fn dead_letter(
        &self,
        broker: &dyn Broker,
        body: &[u8],
        headers: &EnvelopeHeaders,
        reason: &str,
    ) -> Result<(), BrokerError> {
        let mut last = headers.clone();
        last.final_failure = true;
        last.failure_reason = Some(truncate_reason(reason));

        let exchange = self.topology.dead_letter_exchange();
        broker
            .publish(
                &exchange,
                self.topology.dead_letter_routing_key(),
                OutboundMessage::new(body, last),
            )
            .await?;

        tracing::warn!(
            retry_count = headers.retry_count,
            exchange = %exchange,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }
}
