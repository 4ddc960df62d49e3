//! Cluster coordination
//!
//! Only one process owns the arena and its index. Worker processes run a
//! [`ClusterClient`] that forwards commits and reads to the owner over a
//! request/reply channel, so the allocator keeps a single writer across the
//! whole process group.
//!
//! Messages are plain serde types. [`encode_frame`] and [`decode_frame`] turn
//! them into length-prefixed bincode frames for byte-oriented transports.

pub mod channel;
pub mod client;
pub(crate) mod coordinator;

pub use channel::{
    local_channel, CoordinatorChannel, LocalCoordinatorChannel, LocalWorkerChannel, WorkerChannel,
};
pub use client::ClusterClient;

use crate::engine::FileInfo;
use crate::error::{CacheError, ErrorKind, Result};
use crate::key::{ContentHash, FileKey, FileType, Guid};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;

/// Largest frame body accepted by [`decode_frame`]
pub const MAX_FRAME_SIZE: usize = 1 << 30;

const HEADER_LEN: usize = 4;

/// File shipped from a worker to the owner on commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFile {
    pub file_type: FileType,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterOp {
    Commit {
        guid: Guid,
        hash: ContentHash,
        files: Vec<ClusterFile>,
    },
    FileInfo {
        key: FileKey,
    },
    ReadFile {
        key: FileKey,
    },
}

impl ClusterOp {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterOp::Commit { .. } => "commit",
            ClusterOp::FileInfo { .. } => "file-info",
            ClusterOp::ReadFile { .. } => "read-file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub id: u64,
    pub op: ClusterOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterPayload {
    Committed,
    Info(FileInfo),
    Bytes(Vec<u8>),
}

/// Error as it travels back to a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    /// Structured fields of kinds that carry more than a message
    pub detail: Option<RemoteDetail>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteDetail {
    InvalidSize(i64),
    IncompleteWrite {
        file_type: FileType,
        expected: u64,
        written: u64,
    },
    NotFound(FileKey),
}

impl RemoteError {
    pub fn from_error(err: &CacheError) -> Self {
        let message = match err {
            CacheError::Config(detail)
            | CacheError::InvalidType(detail)
            | CacheError::Allocation(detail)
            | CacheError::Transaction(detail)
            | CacheError::Cluster(detail) => detail.clone(),
            other => other.to_string(),
        };

        let detail = match err {
            CacheError::InvalidSize(size) => Some(RemoteDetail::InvalidSize(*size)),
            CacheError::IncompleteWrite {
                file_type,
                expected,
                written,
            } => Some(RemoteDetail::IncompleteWrite {
                file_type: *file_type,
                expected: *expected,
                written: *written,
            }),
            CacheError::NotFound(key) => Some(RemoteDetail::NotFound(key.clone())),
            _ => None,
        };

        RemoteError {
            kind: err.kind(),
            message,
            detail,
        }
    }

    /// Rebuild the error the owner reported
    pub fn into_error(self) -> CacheError {
        match (self.kind, self.detail) {
            (ErrorKind::NotFound, Some(RemoteDetail::NotFound(key))) => CacheError::NotFound(key),
            (ErrorKind::InvalidSize, Some(RemoteDetail::InvalidSize(size))) => {
                CacheError::InvalidSize(size)
            }
            (
                ErrorKind::IncompleteWrite,
                Some(RemoteDetail::IncompleteWrite {
                    file_type,
                    expected,
                    written,
                }),
            ) => CacheError::IncompleteWrite {
                file_type,
                expected,
                written,
            },
            (ErrorKind::Config, _) => CacheError::Config(self.message),
            (ErrorKind::NotInitialized, _) => CacheError::NotInitialized,
            (ErrorKind::InvalidType, _) => CacheError::InvalidType(self.message),
            (ErrorKind::Allocation, _) => CacheError::Allocation(self.message),
            (ErrorKind::Transaction, _) => CacheError::Transaction(self.message),
            (ErrorKind::Cluster, _) => CacheError::Cluster(self.message),
            (ErrorKind::Io, _) => CacheError::Io(io::Error::other(self.message)),
            (ErrorKind::Serialization, _) => {
                CacheError::Serialization(serde::de::Error::custom(self.message))
            }
            // Detail missing for a kind that needs it
            (kind, _) => CacheError::Cluster(format!("{:?}: {}", kind, self.message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReply {
    pub id: u64,
    pub result: std::result::Result<ClusterPayload, RemoteError>,
}

/// Serialize a message as `[u32 big-endian length][bincode body]`
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CacheError::Cluster(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < HEADER_LEN {
        return Err(CacheError::Cluster(format!(
            "frame of {} bytes has no header",
            frame.len()
        )));
    }

    let (header, body) = frame.split_at(HEADER_LEN);
    let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if declared > MAX_FRAME_SIZE || declared != body.len() {
        return Err(CacheError::Cluster(format!(
            "frame declares {} bytes but carries {}",
            declared,
            body.len()
        )));
    }

    Ok(bincode::deserialize(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FileKey {
        FileKey::new(
            FileType::Asset,
            Guid::from_bytes([0xAA; 16]),
            ContentHash::from_bytes([0xBB; 16]),
        )
    }

    #[test]
    fn test_request_frame() {
        let request = ClusterRequest {
            id: 7,
            op: ClusterOp::Commit {
                guid: Guid::from_bytes([1, 2, 3]),
                hash: ContentHash::from_bytes([4, 5]),
                files: vec![ClusterFile {
                    file_type: FileType::Info,
                    bytes: b"payload".to_vec(),
                }],
            },
        };

        let frame = encode_frame(&request).unwrap();
        let decoded: ClusterRequest = decode_frame(&frame).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(&ClusterRequest {
            id: 1,
            op: ClusterOp::ReadFile { key: key() },
        })
        .unwrap();

        let result: Result<ClusterRequest> = decode_frame(&frame[..frame.len() - 1]);
        assert!(matches!(result, Err(CacheError::Cluster(_))));

        let result: Result<ClusterRequest> = decode_frame(&frame[..2]);
        assert!(matches!(result, Err(CacheError::Cluster(_))));
    }

    #[test]
    fn test_remote_not_found_keeps_key() {
        let remote = RemoteError::from_error(&CacheError::NotFound(key()));
        assert_eq!(remote.kind, ErrorKind::NotFound);

        let local = remote.into_error();
        assert!(matches!(local, CacheError::NotFound(k) if k == key()));
    }

    #[test]
    fn test_remote_allocation_message() {
        let remote = RemoteError::from_error(&CacheError::Allocation("arena full".into()));
        assert_eq!(remote.message, "arena full");

        let local = remote.into_error();
        assert_eq!(local.to_string(), "Allocation failed: arena full");
    }

    #[test]
    fn test_every_kind_survives_the_wire() {
        let errors = vec![
            CacheError::Config("bad".into()),
            CacheError::NotInitialized,
            CacheError::InvalidType("zip".into()),
            CacheError::InvalidSize(-3),
            CacheError::IncompleteWrite {
                file_type: FileType::Info,
                expected: 1024,
                written: 512,
            },
            CacheError::NotFound(key()),
            CacheError::Allocation("full".into()),
            CacheError::Transaction("twice".into()),
            CacheError::Cluster("gone".into()),
            CacheError::Io(io::Error::other("disk")),
            CacheError::Serialization(serde::de::Error::custom("broken")),
        ];

        for original in errors {
            let reply = ClusterReply {
                id: 1,
                result: Err(RemoteError::from_error(&original)),
            };
            let decoded: ClusterReply = decode_frame(&encode_frame(&reply).unwrap()).unwrap();
            let rebuilt = decoded.result.unwrap_err().into_error();
            assert_eq!(rebuilt.kind(), original.kind(), "{}", original);
        }

        let rebuilt = RemoteError::from_error(&CacheError::IncompleteWrite {
            file_type: FileType::Asset,
            expected: 10,
            written: 4,
        })
        .into_error();
        assert!(matches!(
            rebuilt,
            CacheError::IncompleteWrite { file_type: FileType::Asset, expected: 10, written: 4 }
        ));
        assert!(matches!(
            RemoteError::from_error(&CacheError::InvalidSize(0)).into_error(),
            CacheError::InvalidSize(0)
        ));
    }
}
