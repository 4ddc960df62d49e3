use crate::key::{FileKey, FileType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cache engine is not initialized")]
    NotInitialized,

    #[error("Invalid file type: {0:?} (expected info, asset or resource)")]
    InvalidType(String),

    #[error("Invalid size: {0} (must be greater than zero)")]
    InvalidSize(i64),

    #[error("Incomplete write for {file_type}: expected {expected} bytes, got {written}")]
    IncompleteWrite {
        file_type: FileType,
        expected: u64,
        written: u64,
    },

    #[error("Entry not found: {0}")]
    NotFound(FileKey),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Wire codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Error discriminant that can cross a process boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    NotInitialized,
    InvalidType,
    InvalidSize,
    IncompleteWrite,
    NotFound,
    Allocation,
    Transaction,
    Cluster,
    Io,
    Serialization,
}

impl CacheError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Config(_) => ErrorKind::Config,
            CacheError::NotInitialized => ErrorKind::NotInitialized,
            CacheError::InvalidType(_) => ErrorKind::InvalidType,
            CacheError::InvalidSize(_) => ErrorKind::InvalidSize,
            CacheError::IncompleteWrite { .. } => ErrorKind::IncompleteWrite,
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::Allocation(_) => ErrorKind::Allocation,
            CacheError::Transaction(_) => ErrorKind::Transaction,
            CacheError::Cluster(_) => ErrorKind::Cluster,
            CacheError::Io(_) => ErrorKind::Io,
            CacheError::Serialization(_) | CacheError::Codec(_) => ErrorKind::Serialization,
        }
    }

    /// Check whether this is a read of an absent key
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ContentHash, Guid};

    #[test]
    fn test_kind_mapping() {
        let key = FileKey::new(
            FileType::Info,
            Guid::from_bytes([1u8; 16]),
            ContentHash::from_bytes([2u8; 16]),
        );
        assert_eq!(CacheError::NotFound(key).kind(), ErrorKind::NotFound);
        assert_eq!(CacheError::InvalidSize(0).kind(), ErrorKind::InvalidSize);
        assert_eq!(
            CacheError::Allocation("full".into()).kind(),
            ErrorKind::Allocation
        );
    }

    #[test]
    fn test_incomplete_write_message() {
        let err = CacheError::IncompleteWrite {
            file_type: FileType::Asset,
            expected: 1024,
            written: 512,
        };
        assert_eq!(
            err.to_string(),
            "Incomplete write for asset: expected 1024 bytes, got 512"
        );
    }
}
