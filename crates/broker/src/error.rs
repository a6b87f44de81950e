use thiserror::Error;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Failed to declare {entity}: {message}")]
    Declaration { entity: String, message: String },

    /// An entity already exists with different properties.
    #[error("Conflicting declaration for {entity}: {message}")]
    PreconditionFailed { entity: String, message: String },

    #[error("Publish to exchange '{exchange}' failed: {message}")]
    Publish { exchange: String, message: String },

    #[error("Consume from queue '{queue}' failed: {message}")]
    Consume { queue: String, message: String },

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),
}

impl BrokerError {
    pub fn declaration(entity: impl Into<String>, message: impl ToString) -> Self {
        BrokerError::Declaration {
            entity: entity.into(),
            message: message.to_string(),
        }
    }

    pub fn publish(exchange: &str, message: impl ToString) -> Self {
        BrokerError::Publish {
            exchange: exchange.to_string(),
            message: message.to_string(),
        }
    }

    pub fn consume(queue: &str, message: impl ToString) -> Self {
        BrokerError::Consume {
            queue: queue.to_string(),
            message: message.to_string(),
        }
    }
}
