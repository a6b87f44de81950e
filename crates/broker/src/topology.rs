//! Topology Manager: declares the main, dead-letter and retry entities.
//!
//! For base names `E` (exchange) and `Q` (queue):
//!
//! | Entity | Name | Notes |
//! |---|---|---|
//! | main exchange | `E` | configurable kind |
//! | main queue | `Q` | dead-letters to `E.dlx` |
//! | dead-letter exchange | `E.dlx` | fanout by default |
//! | dead-letter queue | `Q.dlq` | |
//! | retry exchange i | `E.retry.i` | direct |
//! | retry queue i | `Q.retry.i` | TTL = delay i, dead-letters back to `E` |

use std::time::Duration;

use herald_common::config::{ExchangeKind, RetryPolicy, TopologyConfig};

use crate::{Broker, BrokerError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeKind,
}

/// Queue arguments understood by the broker (`x-dead-letter-exchange`,
/// `x-dead-letter-routing-key`, `x-message-ttl`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub message_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDecl {
    pub name: String,
    pub arguments: QueueArguments,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Everything the worker declares, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyPlan {
    pub exchanges: Vec<ExchangeDecl>,
    pub queues: Vec<QueueDecl>,
    pub bindings: Vec<Binding>,
}

pub struct TopologyManager {
    config: TopologyConfig,
    retry: RetryPolicy,
}

impl TopologyManager {
    pub fn new(config: TopologyConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    pub fn plan(&self) -> TopologyPlan {
        let c = &self.config;
        let mut plan = TopologyPlan::default();

        plan.exchanges.push(ExchangeDecl {
            name: c.exchange.clone(),
            kind: c.exchange_kind,
        });
        plan.queues.push(QueueDecl {
            name: c.queue.clone(),
            arguments: QueueArguments {
                dead_letter_exchange: Some(c.dead_letter_exchange()),
                ..Default::default()
            },
        });
        plan.bindings.push(Binding {
            queue: c.queue.clone(),
            exchange: c.exchange.clone(),
            routing_key: c.routing_key.clone(),
        });

        plan.exchanges.push(ExchangeDecl {
            name: c.dead_letter_exchange(),
            kind: c.dead_letter_kind,
        });
        plan.queues.push(QueueDecl {
            name: c.dead_letter_queue(),
            arguments: QueueArguments::default(),
        });
        plan.bindings.push(Binding {
            queue: c.dead_letter_queue(),
            exchange: c.dead_letter_exchange(),
            routing_key: c.dead_letter_routing_key().to_string(),
        });

        for (idx, delay) in self.retry.delays().iter().enumerate() {
            let step = idx as u32 + 1;
            plan.exchanges.push(ExchangeDecl {
                name: c.retry_exchange(step),
                kind: ExchangeKind::Direct,
            });
            plan.queues.push(QueueDecl {
                name: c.retry_queue(step),
                arguments: QueueArguments {
                    dead_letter_exchange: Some(c.exchange.clone()),
                    dead_letter_routing_key: None,
                    message_ttl: Some(*delay),
                },
            });
            plan.bindings.push(Binding {
                queue: c.retry_queue(step),
                exchange: c.retry_exchange(step),
                routing_key: c.routing_key.clone(),
            });
        }

        plan
    }

    /// Declare the whole topology. Idempotent for identical parameters; a
    /// conflicting existing declaration is returned as an error and left as is.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), BrokerError> {
        let plan = self.plan();

        for exchange in &plan.exchanges {
            broker.declare_exchange(exchange).await?;
        }
        for queue in &plan.queues {
            broker.declare_queue(queue).await?;
        }
        for binding in &plan.bindings {
            broker.bind_queue(binding).await?;
        }

        tracing::info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            retry_steps = self.retry.max_retries(),
            "Topology declared"
        );
        Ok(())
    }
}
