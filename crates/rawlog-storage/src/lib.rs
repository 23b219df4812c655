//! rawlog Storage Engine - Raw partition log storage
//!
//! This crate implements a log store directly on a raw block device:
//! - Raw device access (O_SYNC, O_DIRECT / F_NOCACHE)
//! - Fixed-capacity segment index persisted block by block
//! - Append-only extent allocation
//! - Extent chains for growable version logs
//! - Unaligned reads and writes over block-aligned I/O

pub mod aligned;
pub mod alloc;
pub mod chain;
pub mod descriptor;
pub mod engine;
pub mod index;
pub mod layout;
pub mod raw_io;

// Re-exports
pub use aligned::{AlignedWindow, IoBuffer};
pub use alloc::{Allocator, Reservation};
pub use chain::{ChainWalker, Piece, Window};
pub use descriptor::{DESCRIPTOR_SIZE, Descriptor, LogName, NAME_CAPACITY, Status};
pub use engine::{BootstrapMode, EngineStats, LogDevice, Segment};
pub use index::SegmentIndex;
pub use layout::{DeviceHeader, FORMAT_VERSION, MAGIC};
pub use raw_io::{AlignedBuffer, RawFile};
