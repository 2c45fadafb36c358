//! Storage error types
//!
//! Defines all errors that can occur while reading or writing the local TSDB.

use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, invalid magic, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Invalid time range (mint > maxt)
    #[error("Invalid time range: mint {mint} is after maxt {maxt}")]
    InvalidTimeRange { mint: i64, maxt: i64 },

    /// Block file format error
    #[error("Invalid block format: {0}")]
    InvalidBlock(String),

    /// WAL format or recovery error
    #[error("WAL error: {0}")]
    WalError(String),

    /// Samples appended out of order for a series
    #[error("Out of order sample for {labels}: {timestamp} <= {last}")]
    OutOfOrder {
        labels: String,
        timestamp: i64,
        last: i64,
    },

    /// The store has been closed
    #[error("Store is closed")]
    Closed,

    /// The store directory is locked by another writer
    #[error("Store is locked: {0}")]
    Locked(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
