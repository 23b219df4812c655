//! Core type definitions for rawlog
//!
//! Handles and log classifications shared by the engine and its callers.

use std::fmt;

/// Handle of an open logical file
///
/// The handle is the index of the file's chain-head descriptor in the
/// segment index. It stays valid until the file is removed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogHandle(u32);

impl LogHandle {
    /// Create a handle from a descriptor slot index
    #[must_use]
    pub const fn new(slot: u32) -> Self {
        Self(slot)
    }

    /// Slot index of the chain-head descriptor
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogHandle({})", self.0)
    }
}

impl fmt::Display for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of logical file, derived from its name at creation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogType {
    /// Primary log: one fixed extent
    Primary,
    /// Secondary log: one fixed extent
    Secondary,
    /// Version log: a chain of extents that grows on demand
    Version,
}

impl LogType {
    /// On-device type code
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Primary => b'p',
            Self::Secondary => b's',
            Self::Version => b'v',
        }
    }

    /// Parse an on-device type code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            b'p' => Some(Self::Primary),
            b's' => Some(Self::Secondary),
            b'v' => Some(Self::Version),
            _ => None,
        }
    }

    /// Whether files of this type may span several extents
    #[must_use]
    pub const fn is_chained(self) -> bool {
        matches!(self, Self::Version)
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Version => "version",
        };
        f.pad(s)
    }
}
