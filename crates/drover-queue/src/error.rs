use std::path::PathBuf;

use thiserror::Error;

use crate::transport::TransportError;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors raised by queue adapters
#[derive(Debug, Error)]
pub enum QueueError {
    /// The broker transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A credential file is missing or unreadable
    #[error("credential file {path} unusable: {source}")]
    CredentialFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The broker URL could not be parsed
    #[error("invalid broker url {url:?}: {reason}")]
    BadUrl { url: String, reason: String },

    /// An AMQP URL arrived without embedded credentials
    #[error("missing credentials in url {0:?}")]
    MissingCredentials(String),

    /// A subscription name did not carry its expected qualifier
    #[error("malformed subscription name {0:?}")]
    BadSubscription(String),

    /// The surrounding context was cancelled before dispatch
    #[error("queue worker cancel received")]
    Cancelled,
}
