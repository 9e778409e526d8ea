//! Error types for signal-store

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The signal table has not been created yet. Recovered inside the
    /// store by creating it and retrying once.
    #[error("signal table not initialized")]
    NotInitialized,

    #[error("invalid signal: {0}")]
    Invalid(&'static str),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] heed::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
