use std::io;
use thiserror::Error;

/// Failure to interpret an inbound radio frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {len} bytes, need at least {min}")]
    Malformed { len: usize, min: usize },
    #[error("frame declares {declared} bytes but {len} arrived")]
    Length { declared: u8, len: usize },
}

/// Custom error types for the gateway engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Unknown node: {0}")]
    UnknownNode(u32),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Delivery to {address:#06x} exhausted after {attempts} attempts")]
    DeliveryExhausted { address: u16, attempts: u32 },

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Error::Registry(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Creates a new channel error
    pub fn channel(msg: impl Into<String>) -> Self {
        Error::Channel(msg.into())
    }
}
