use snapkv_common::{Cell, TableRef, Timestamp};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Value already exists: table {table}, cell {cell}, timestamp {timestamp}")]
    KeyAlreadyExists {
        table: TableRef,
        cell: Cell,
        timestamp: Timestamp,
    },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}
