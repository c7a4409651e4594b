use drover_core::ByteQuantity;
use thiserror::Error;

/// Result type alias for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors raised by the scheduler and its ledgers
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Not enough free disk left above the soft reserve
    #[error("insufficient space left {free} to allocate {requested}")]
    InsufficientSpace {
        free: ByteQuantity,
        requested: ByteQuantity,
    },

    /// A CPU, RAM, or GPU dimension could not be granted
    #[error("insufficient {kind} available")]
    Insufficient { kind: &'static str },

    /// A reservation was released against a device the ledger no longer tracks
    #[error("allocation came from untracked device {device:?}")]
    ForeignDevice { device: String },

    /// The ledger was used before its device was set
    #[error("ledger not initialized")]
    NotInitialized,

    /// Ledger arithmetic overflowed, which indicates corrupted bookkeeping.
    /// This error is fatal and propagates to process shutdown.
    #[error("ledger bookkeeping overflow")]
    LedgerPoisoned,

    /// Filesystem statistics could not be read
    #[error("filesystem probe failed: {0}")]
    Statfs(#[from] nix::errno::Errno),

    /// The named subscription is not in the registry
    #[error("subscription {0:?} was not present")]
    UnknownSubscription(String),

    /// A queue adapter call failed
    #[error(transparent)]
    Queue(#[from] drover_queue::QueueError),
}

impl SchedulerError {
    /// True for errors that must take the whole process down rather than be
    /// absorbed into a queue back-off.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::LedgerPoisoned)
    }
}
