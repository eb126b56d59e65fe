//! Error types for TierKV operations
//!
//! Every failure in the engine is a `TierError`. Variants carry enough
//! context (paths, offsets, sizes) to diagnose a problem from a log line
//! alone. The request-level taxonomy (`NotFound`, `AllocationExhausted`,
//! `DeviceIo`, `OffloadDisabled`, `Timeout`) is what completion callbacks
//! report; the remaining variants come from pool files and configuration.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Direction of a block device operation, used in error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Read,
    Write,
}

impl fmt::Display for IoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoKind::Read => f.write_str("read"),
            IoKind::Write => f.write_str("write"),
        }
    }
}

/// TierKV error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum TierError {
    /// I/O operation on a pool or device file failed
    #[error("I/O error{}: {message} ({kind})", fmt_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Pool journal is structurally damaged (bad record encoding)
    #[error("journal corrupted in {} at offset {offset}: {reason}", .path.display())]
    JournalCorrupted {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    /// CRC32C of a journal frame did not match its payload
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
        offset: u64,
    },

    /// Journal frame extends past the end of the file (crash mid-append)
    #[error("torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        path: PathBuf,
        expected_size: u32,
        available_bytes: u64,
        offset: u64,
    },

    /// Frame magic not found where a frame must start
    #[error("magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
            .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3])]
    NoMagicFound {
        path: PathBuf,
        offset: u64,
        found_bytes: [u8; 4],
    },

    /// Pool file was created for a different structure
    #[error("pool {} has layout '{found}', expected '{expected}'", .path.display())]
    LayoutMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    /// Key length differs from the store's uniform key size
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    /// Value does not fit in one allocation unit
    #[error("value of {size} bytes exceeds limit of {max} bytes")]
    OversizedValue { size: usize, max: usize },

    /// LBA outside `[0, max_lba)` handed to the free list
    #[error("LBA {lba} outside device range [0, {max_lba})")]
    InvalidLba { lba: u64, max_lba: u64 },

    /// Key has no value (location is EMPTY, or not served by this tier)
    #[error("key not found")]
    NotFound,

    /// LBA space or persistent pool capacity is used up
    #[error("{resource} exhausted (limit {limit})")]
    AllocationExhausted { resource: &'static str, limit: u64 },

    /// Block device rejected or failed an operation
    #[error("device {op} failed at block {block_offset}: {message}")]
    DeviceIo {
        op: IoKind,
        block_offset: u64,
        message: String,
    },

    /// No block device is attached, so values cannot leave PMEM
    #[error("offload disabled: no block device attached")]
    OffloadDisabled,

    /// Caller gave up waiting; the completion may still arrive later
    #[error("timed out after {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    /// Another transition on the same record has not finished
    #[error("a location transition is already pending for this key")]
    TransitionPending,

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The offload poller is gone and can no longer accept requests
    #[error("offload request queue closed")]
    QueueClosed,
}

fn fmt_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl TierError {
    /// Wrap an `std::io::Error` with the file it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        TierError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for the errors a completion callback is expected to see.
    pub fn is_request_level(&self) -> bool {
        matches!(
            self,
            TierError::NotFound
                | TierError::AllocationExhausted { .. }
                | TierError::DeviceIo { .. }
                | TierError::OffloadDisabled
                | TierError::Timeout { .. }
        )
    }
}

/// Convert std::io::Error to TierError::Io
impl From<std::io::Error> for TierError {
    fn from(err: std::io::Error) -> Self {
        TierError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for TierKV operations
pub type TierResult<T> = Result<T, TierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TierError::ChecksumMismatch {
            path: PathBuf::from("/tmp/index.pool"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let tier_err: TierError = io_err.into();

        match tier_err {
            TierError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_at_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = TierError::io_at("/pool/freelist.pool", io_err, "open failed");
        let display = err.to_string();
        assert!(display.contains("/pool/freelist.pool"));
        assert!(display.contains("open failed"));
    }

    #[test]
    fn test_request_level_taxonomy() {
        assert!(TierError::NotFound.is_request_level());
        assert!(TierError::OffloadDisabled.is_request_level());
        assert!(TierError::AllocationExhausted { resource: "lba", limit: 4 }.is_request_level());
        assert!(!TierError::QueueClosed.is_request_level());
        assert!(!TierError::InvalidConfig("x".into()).is_request_level());
    }

    #[test]
    fn test_device_error_names_direction() {
        let err = TierError::DeviceIo {
            op: IoKind::Write,
            block_offset: 32,
            message: "media error".into(),
        };
        assert_eq!(err.to_string(), "device write failed at block 32: media error");
    }
}
