pub mod config;
pub mod error;
pub mod exports;
pub mod logging;
pub mod session;
pub mod timer;

use thiserror::Error;

pub use error::{ConnectionError, ExportError, SessionStoreError};

#[derive(Error, Debug)]
pub enum MongoMcpError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    SessionStore(#[from] SessionStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MongoMcpError>;

impl MongoMcpError {
    /// Get the numeric error code reported to MCP clients, if this error has one
    pub fn error_code(&self) -> Option<i32> {
        match self {
            MongoMcpError::Connection(e) => Some(e.error_code()),
            _ => None,
        }
    }
}
