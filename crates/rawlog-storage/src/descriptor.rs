//! Segment descriptors and their on-device record format
//!
//! Record layout (little-endian, [`DESCRIPTOR_SIZE`] bytes):
//! ```text
//! 0   version u8      1   status u8      2   type u8      3  reserved
//! 4   next u32        8   first u32      12  reserved u32
//! 16  begin u64       24  part_length u64                 32 cur_length u64
//! 40  name [u8; 40]   (NUL-terminated, at most 36 bytes)
//! 80  crc32c u32      over bytes 0..80
//! 84  zero padding
//! ```
//!
//! An all-zero record is a slot that was never handed out. A chain tail
//! stores its own index in `next`.

use bytes::{Buf, BufMut};
use rawlog_common::{Error, LogType, Result};
use std::fmt;

/// Encoded size of one descriptor record
pub const DESCRIPTOR_SIZE: usize = 128;

/// Maximum number of name bytes kept per descriptor
pub const NAME_CAPACITY: usize = 36;

const NAME_FIELD: usize = 40;
const RECORD_VERSION: u8 = 1;
const CHECKSUM_OFFSET: usize = 80;

/// Descriptor status bits
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Status(u8);

impl Status {
    /// Slot in use
    pub const EXISTS: u8 = 0b001;
    /// File currently open; volatile, never persisted
    pub const OPEN: u8 = 0b010;
    /// Logically deleted
    pub const DELETED: u8 = 0b100;

    /// Status of a freshly created descriptor
    #[must_use]
    pub const fn live() -> Self {
        Self(Self::EXISTS)
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn exists(self) -> bool {
        self.0 & Self::EXISTS != 0
    }

    #[must_use]
    pub const fn is_open(self) -> bool {
        self.0 & Self::OPEN != 0
    }

    #[must_use]
    pub const fn is_deleted(self) -> bool {
        self.0 & Self::DELETED != 0
    }

    pub fn set_open(&mut self, open: bool) {
        if open {
            self.0 |= Self::OPEN;
        } else {
            self.0 &= !Self::OPEN;
        }
    }

    /// Flag as deleted and no longer in use
    pub fn mark_deleted(&mut self) {
        self.0 = (self.0 | Self::DELETED) & !Self::EXISTS;
    }

    /// Bits that survive a restart
    #[must_use]
    pub const fn persistent(self) -> Self {
        Self(self.0 & !Self::OPEN)
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status({:#05b})", self.0)
    }
}

/// Fixed-capacity log name
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LogName {
    bytes: [u8; NAME_CAPACITY],
    len: u8,
}

impl LogName {
    /// Build a name, truncating to [`NAME_CAPACITY`] bytes on a char boundary
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(NAME_CAPACITY);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; NAME_CAPACITY];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            bytes,
            len: end as u8,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only constructed from &str or validated UTF-8.
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }

    fn decode(field: &[u8]) -> Result<Self> {
        let len = field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::corrupt("log name is not terminated"))?;
        if len > NAME_CAPACITY {
            return Err(Error::corrupt("log name exceeds capacity"));
        }
        let name = std::str::from_utf8(&field[..len])
            .map_err(|_| Error::corrupt("log name is not UTF-8"))?;
        Ok(Self::new(name))
    }
}

impl fmt::Debug for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for LogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical extent of a logical file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub status: Status,
    pub log_type: LogType,
    /// Block-aligned device offset of the extent
    pub begin: u64,
    /// Extent capacity in bytes
    pub part_length: u64,
    /// Logical file length; only meaningful on the chain head
    pub cur_length: u64,
    /// Next extent of the chain, `None` at the tail
    pub next: Option<u32>,
    /// Slot of the chain head
    pub first: u32,
    pub name: LogName,
}

impl Descriptor {
    /// Chain head of a new logical file living in `slot`
    #[must_use]
    pub fn head(slot: u32, log_type: LogType, name: LogName, begin: u64, part_length: u64) -> Self {
        Self {
            status: Status::live(),
            log_type,
            begin,
            part_length,
            cur_length: 0,
            next: None,
            first: slot,
            name,
        }
    }

    /// New tail link for the chain headed by `head_slot`
    #[must_use]
    pub fn link(head_slot: u32, head: &Self, begin: u64, part_length: u64) -> Self {
        Self {
            status: Status::live(),
            log_type: head.log_type,
            begin,
            part_length,
            cur_length: 0,
            next: None,
            first: head_slot,
            name: head.name,
        }
    }

    #[must_use]
    pub const fn is_head(&self, slot: u32) -> bool {
        self.first == slot
    }

    /// End of the extent on the device (exclusive), `None` if it wraps
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.begin.checked_add(self.part_length)
    }

    /// Encode the descriptor stored in `slot` into `out`
    pub fn encode(&self, slot: u32, out: &mut [u8]) {
        debug_assert_eq!(out.len(), DESCRIPTOR_SIZE);
        out.fill(0);
        let mut buf = &mut out[..];

        buf.put_u8(RECORD_VERSION);
        buf.put_u8(self.status.persistent().bits());
        buf.put_u8(self.log_type.code());
        buf.put_u8(0);
        buf.put_u32_le(self.next.unwrap_or(slot));
        buf.put_u32_le(self.first);
        buf.put_u32_le(0);
        buf.put_u64_le(self.begin);
        buf.put_u64_le(self.part_length);
        buf.put_u64_le(self.cur_length);

        let mut name = [0u8; NAME_FIELD];
        let bytes = self.name.as_str().as_bytes();
        name[..bytes.len()].copy_from_slice(bytes);
        buf.put_slice(&name);

        let crc = crc32c::crc32c(&out[..CHECKSUM_OFFSET]);
        out[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Decode the record of `slot`; `None` for a never-used slot
    pub fn decode(slot: u32, data: &[u8]) -> Result<Option<Self>> {
        if data.len() < DESCRIPTOR_SIZE {
            return Err(Error::corrupt(format!("descriptor {slot} truncated")));
        }
        if data[..DESCRIPTOR_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let stored = u32::from_le_bytes([
            data[CHECKSUM_OFFSET],
            data[CHECKSUM_OFFSET + 1],
            data[CHECKSUM_OFFSET + 2],
            data[CHECKSUM_OFFSET + 3],
        ]);
        if crc32c::crc32c(&data[..CHECKSUM_OFFSET]) != stored {
            return Err(Error::corrupt(format!("descriptor {slot} checksum mismatch")));
        }

        let mut buf = data;
        let version = buf.get_u8();
        if version != RECORD_VERSION {
            return Err(Error::corrupt(format!(
                "descriptor {slot} has unsupported version {version}"
            )));
        }
        let status = Status::from_bits(buf.get_u8()).persistent();
        if !status.exists() && !status.is_deleted() {
            return Err(Error::corrupt(format!("descriptor {slot} has no status")));
        }
        let log_type = LogType::from_code(buf.get_u8())
            .ok_or_else(|| Error::corrupt(format!("descriptor {slot} has unknown type")))?;
        buf.advance(1);
        let next = buf.get_u32_le();
        let first = buf.get_u32_le();
        buf.advance(4);
        let begin = buf.get_u64_le();
        let part_length = buf.get_u64_le();
        let cur_length = buf.get_u64_le();
        let name = LogName::decode(&buf[..NAME_FIELD])?;

        Ok(Some(Self {
            status,
            log_type,
            begin,
            part_length,
            cur_length,
            next: (next != slot).then_some(next),
            first,
            name,
        }))
    }
}
