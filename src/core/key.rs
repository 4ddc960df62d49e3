//! Cache keys
//!
//! Every cache entry is addressed by a `(type, guid, hash)` triple. The guid
//! groups related files, the hash disambiguates revisions of one guid, and the
//! type selects one of the three byte streams stored per revision.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role of a stored byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Info,
    Asset,
    Resource,
}

impl FileType {
    /// All file types in canonical order
    pub const ALL: [FileType; 3] = [FileType::Info, FileType::Asset, FileType::Resource];

    /// Parse an exact type code (`info`, `asset` or `resource`)
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "info" => Ok(FileType::Info),
            "asset" => Ok(FileType::Asset),
            "resource" => Ok(FileType::Resource),
            other => Err(CacheError::InvalidType(other.to_string())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FileType::Info => "info",
            FileType::Asset => "asset",
            FileType::Resource => "resource",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for FileType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        FileType::from_code(s)
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Vec<u8>);

        impl $name {
            pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
                $name(bytes.as_ref().to_vec())
            }

            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            /// Lowercase hex rendering, used for on-disk names
            pub fn to_hex(&self) -> String {
                hex::encode(&self.0)
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(bytes: Vec<u8>) -> Self {
                $name(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }
    };
}

opaque_id!(
    /// Opaque identifier grouping related cached files
    Guid
);

opaque_id!(
    /// Content hash disambiguating revisions that share a guid
    ContentHash
);

/// Composite key of one cache entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub file_type: FileType,
    pub guid: Guid,
    pub hash: ContentHash,
}

impl FileKey {
    pub fn new(file_type: FileType, guid: Guid, hash: ContentHash) -> Self {
        FileKey {
            file_type,
            guid,
            hash,
        }
    }

    /// File name used by the filesystem engine: `<guid>-<hash>.<type>`
    pub fn file_name(&self) -> String {
        format!("{}-{}.{}", self.guid, self.hash, self.file_type)
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        for file_type in FileType::ALL {
            assert_eq!(FileType::from_code(file_type.code()).unwrap(), file_type);
        }
    }

    #[test]
    fn test_rejects_unknown_codes() {
        for bad in ["", "i", "a", "Info", "ASSET", "resources", "other"] {
            let err = FileType::from_code(bad).unwrap_err();
            assert!(matches!(err, CacheError::InvalidType(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_guid_equality_is_bytewise() {
        let a = Guid::from_bytes([0xAB, 0xCD]);
        let b = Guid::from(vec![0xAB, 0xCD]);
        let c = Guid::from_bytes([0xAB, 0xCE]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_key_display() {
        let key = FileKey::new(
            FileType::Resource,
            Guid::from_bytes([0x01, 0xff]),
            ContentHash::from_bytes([0x10]),
        );
        assert_eq!(key.to_string(), "01ff-10.resource");
    }
}
