use std::time::Duration;
use thiserror::Error;

/// Connection errors surfaced to whoever called `connect`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection descriptor could not even be prepared
    #[error("Misconfigured connection string: {0}")]
    MisconfiguredConnectionString(String),

    /// The connection was prepared but is not (or no longer) live
    #[error("Not connected to MongoDB: {0}")]
    NotConnectedToMongoDB(String),
}

impl ConnectionError {
    /// Stable numeric code exposed to tool responses
    pub fn error_code(&self) -> i32 {
        match self {
            ConnectionError::NotConnectedToMongoDB(_) => 1_000_000,
            ConnectionError::MisconfiguredConnectionString(_) => 1_000_001,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ConnectionError::MisconfiguredConnectionString(reason)
            | ConnectionError::NotConnectedToMongoDB(reason) => reason,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Requested export has either expired or does not exist.")]
    NotFound,

    #[error("Requested export is still being generated. Try again later.")]
    StillGenerating,

    #[error("Export with same name is either already available or being generated.")]
    AlreadyExists(String),

    #[error("Invalid export name: {0}")]
    InvalidName(String),

    #[error("ExportsManager is shutting down.")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionStoreError {
    #[error("Session {0} already exists")]
    DuplicateSession(String),

    #[error("Session {0} not found")]
    UnknownSession(String),

    #[error("idle timeout ({idle:?}) must be greater than notification timeout ({notification:?}) and both must be greater than 0")]
    InvalidTimeouts {
        idle: Duration,
        notification: Duration,
    },
}
