use thiserror::Error;

/// Errors that can occur in the SYN cookie node library
#[derive(Error, Debug)]
pub enum SyncookieError {
    /// Low watermark is not below the high watermark
    #[error("Invalid watermarks: lowat {lowat} must be below hiwat {hiwat}")]
    InvalidWatermarks { hiwat: u64, lowat: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment could not be built or transmitted
    #[error("Transmit error: {0}")]
    Transmit(String),

    /// Address family or option not supported by this path
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Result type alias using SyncookieError
pub type Result<T> = std::result::Result<T, SyncookieError>;

impl From<String> for SyncookieError {
    fn from(s: String) -> Self {
        SyncookieError::Other(s)
    }
}

impl From<&str> for SyncookieError {
    fn from(s: &str) -> Self {
        SyncookieError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for SyncookieError {
    fn from(err: serde_json::Error) -> Self {
        SyncookieError::Serialization(err.to_string())
    }
}
