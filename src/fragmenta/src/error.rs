//! Error kinds surfaced to callers (§6, §7).
//!
//! Errors carry a kind, an optional underlying cause, and (where useful)
//! the block/tag the failure concerns. User errors and corruption are
//! returned as-is and never retried internally; environmental errors
//! (`Io`, `StorageLimitExceeded`, `AlreadyOpenElsewhere`) are safe for a
//! caller to retry.

use std::io;

pub type Result<T> = std::result::Result<T, FragmentaError>;

#[derive(Debug, thiserror::Error)]
pub enum FragmentaError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported version {version:#06x} (supported {min:#06x}..={max:#06x})")]
    UnsupportedVersion { version: u16, min: u16, max: u16 },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("metadata tag {tag:#06x} not found")]
    MetadataNotFound { tag: u16 },

    #[error("block {block_id} not found")]
    BlockNotFound { block_id: u32 },

    #[error("metadata tag {tag:#06x} is protected and cannot be deleted")]
    ProtectedMetadata { tag: u16 },

    #[error("checksum mismatch for block {block_id}")]
    ChecksumMismatch { block_id: u32 },

    #[error("store is read-only")]
    ReadOnly,

    #[error("storage limit exceeded: {0}")]
    StorageLimitExceeded(String),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("store is already open elsewhere")]
    AlreadyOpenElsewhere,

    #[error("decode error at offset {offset}: {reason}")]
    Decode { reason: String, offset: u64 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FragmentaError {
    pub fn invalid_format(reason: impl Into<String>) -> Self {
        Self::InvalidFormat(reason.into())
    }

    pub fn decode(reason: impl Into<String>, offset: u64) -> Self {
        Self::Decode {
            reason: reason.into(),
            offset,
        }
    }

    /// User errors: the caller violated the contract. Never retried by the core.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_)
                | Self::InvalidOperation(_)
                | Self::ProtectedMetadata { .. }
                | Self::ReadOnly
                | Self::MetadataNotFound { .. }
                | Self::BlockNotFound { .. }
                | Self::InvalidQuery(_)
        )
    }

    /// Corruption: returned to the caller, the core does not self-heal.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat(_)
                | Self::UnsupportedVersion { .. }
                | Self::ChecksumMismatch { .. }
                | Self::IndexCorruption(_)
                | Self::Decode { .. }
        )
    }

    /// Environmental: a caller may retry.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::StorageLimitExceeded(_) | Self::AlreadyOpenElsewhere
        )
    }
}
