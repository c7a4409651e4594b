use thiserror::Error;

/// Result type alias for wire-model operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while parsing or validating wire data
#[derive(Debug, Error)]
pub enum CoreError {
    /// The message payload was not a valid request envelope
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] serde_json::Error),

    /// A size string could not be read as a byte quantity
    #[error("unparseable byte quantity {text:?}")]
    BadByteQuantity { text: String },
}
