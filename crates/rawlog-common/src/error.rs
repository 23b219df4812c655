//! Error types for rawlog
//!
//! Every engine operation reports failure through [`Error`]; nothing is
//! swallowed and there are no silent partial successes.

use thiserror::Error;

/// Common result type for rawlog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for rawlog
#[derive(Debug, Error)]
pub enum Error {
    // Bootstrap errors
    #[error("failed to open device {path}: {source}")]
    DeviceOpenFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device header I/O failed: {0}")]
    HeaderIoFailed(#[source] std::io::Error),

    #[error("device too small: {capacity} bytes cannot hold header, index and data")]
    DeviceTooSmall { capacity: u64 },

    #[error("failed to allocate in-memory index of {entries} entries")]
    AllocationFailed { entries: u32 },

    // Allocator errors
    #[error("segment index is full: slot {slot} >= capacity {capacity}")]
    IndexFull { slot: u32, capacity: u32 },

    #[error("device is full: append {append} + {requested} bytes >= capacity {capacity}")]
    DeviceFull {
        append: u64,
        requested: u64,
        capacity: u64,
    },

    // File errors
    #[error("invalid log name: {0}")]
    InvalidName(String),

    #[error("log {0} is open")]
    FileOpen(u32),

    #[error("invalid log handle: {0}")]
    InvalidHandle(u32),

    #[error("range {pos}+{length} exceeds log capacity {capacity}")]
    OutOfRange { pos: u64, length: u64, capacity: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Device errors
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt device state: {0}")]
    Corrupt(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceFull {
            append: 4096,
            requested: 8192,
            capacity: 10000,
        };
        assert_eq!(
            err.to_string(),
            "device is full: append 4096 + 8192 bytes >= capacity 10000"
        );
    }
}
