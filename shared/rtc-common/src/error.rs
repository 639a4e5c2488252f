//! Common Errors

use thiserror::Error;

/// Errors raised while decoding or encoding wire types.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be decoded into a known message.
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A value outside the protocol vocabulary.
    #[error("Unknown {field}: {value}")]
    UnknownValue {
        /// Field that carried the value.
        field: &'static str,
        /// The offending value.
        value: String,
    },
}

/// Result alias for wire-level operations.
pub type Result<T> = std::result::Result<T, Error>;
