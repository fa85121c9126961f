//! Error types for signalpost-core

use thiserror::Error;

use crate::delivery::DeliveryError;

/// Main error type for the signalpost-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The user hash worker did not complete
    #[error("hash error: {0}")]
    Hash(String),

    /// Delivery to the ingestion endpoint failed
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Result type alias for signalpost-core
pub type Result<T> = std::result::Result<T, Error>;
