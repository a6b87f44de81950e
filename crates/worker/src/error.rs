use thiserror::Error;

use herald_broker::BrokerError;

/// Fatal worker errors. Per-message failures never surface here.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Consumer stream ended")]
    ConsumerClosed,

    #[error("Health server error: {0}")]
    Io(#[from] std::io::Error),
}
