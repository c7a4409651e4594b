// The seam between queue adapters and broker SDK clients.
//
// Adapters in this crate own naming, credentials, and lease arithmetic; the
// five operations below are all they ask of the underlying broker. Production
// deployments link a backend crate implementing this trait for their broker;
// the in-tree [`crate::MemoryTransport`] serves tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// One received message plus the receipt used to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: String,
    pub body: Vec<u8>,
}

/// Errors surfaced by a broker transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The named queue does not exist at the broker
    #[error("queue {0:?} does not exist")]
    UnknownQueue(String),

    /// The broker could not be reached or answered with a server error
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The receipt no longer refers to an in-flight message
    #[error("receipt {0:?} is no longer valid")]
    StaleReceipt(String),
}

/// Minimal broker wire protocol consumed by the adapters.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// List the queue names visible with the transport's credentials.
    async fn list_queues(&self) -> Result<Vec<String>, TransportError>;

    /// Receive at most one message, holding it invisible for `lease`.
    /// Waits up to `wait` for a message to arrive before returning `None`.
    async fn receive(
        &self,
        queue: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    /// Restart the message's invisibility window at `lease` from now.
    async fn extend(
        &self,
        queue: &str,
        receipt: &str,
        lease: Duration,
    ) -> Result<(), TransportError>;

    /// Positively settle the message; it will not be redelivered.
    async fn ack(&self, queue: &str, receipt: &str) -> Result<(), TransportError>;

    /// Return the message to the queue for prompt redelivery.
    async fn nack(&self, queue: &str, receipt: &str) -> Result<(), TransportError>;
}
