//! Device layout definitions
//!
//! Device Layout:
//! ```text
//! +------------------+  Block 0 (offset 0)
//! |   Device Header  |  one block - magic, geometry, checksum
//! +------------------+  index_start (= block size)
//! |   Index Region   |  index_length descriptors, block-grouped
//! +------------------+  data_start
//! |   Data Region    |  log extents, allocated append-only
//! +------------------+  device_length (aligned down to block size)
//! ```

use crate::descriptor::DESCRIPTOR_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use rawlog_common::config::MIN_BLOCK_SIZE;
use rawlog_common::{EngineConfig, Error, Result};

/// Magic number for the rawlog device format
pub const MAGIC: [u8; 8] = *b"RAWLOGDV";

/// Current device format version
pub const FORMAT_VERSION: u32 = 1;

/// Round `value` up to the next multiple of `block`
#[inline]
#[must_use]
pub const fn align_up(value: u64, block: u64) -> u64 {
    value.div_ceil(block) * block
}

/// Round `value` down to a multiple of `block`
#[inline]
#[must_use]
pub const fn align_down(value: u64, block: u64) -> u64 {
    value - value % block
}

/// Header stored in the first block of the device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHeader {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Usable device length (aligned down to the block size)
    pub device_length: u64,
    /// Block size in bytes
    pub block_size: u32,
    /// Byte offset of the index region
    pub index_start: u64,
    /// Number of descriptor slots in the index region
    pub index_length: u32,
    /// Byte offset of the data region
    pub data_start: u64,
    /// Encoded size of one descriptor
    pub descriptor_size: u32,
    /// Descriptors packed into one block
    pub descriptors_per_block: u32,
    /// Extent size used to grow version logs
    pub growth_unit: u64,
    /// Checksum of header (excluding this field)
    pub checksum: u32,
}

impl DeviceHeader {
    /// Offset of the checksum field: magic(8) + version(4) +
    /// device_length(8) + block_size(4) + index_start(8) + index_length(4) +
    /// data_start(8) + descriptor_size(4) + descriptors_per_block(4) +
    /// growth_unit(8) = 60
    const CHECKSUM_OFFSET: usize = 60;

    /// Encoded header size before block padding
    pub const ENCODED_SIZE: usize = Self::CHECKSUM_OFFSET + 4;

    /// Plan the geometry of a fresh device of `raw_capacity` bytes
    ///
    /// The index holds `(capacity / secondary_log_size) * index_factor`
    /// entries, rounded up to a whole block of descriptors.
    pub fn plan(raw_capacity: u64, config: &EngineConfig) -> Result<Self> {
        let block = u64::from(config.block_size);
        let device_length = align_down(raw_capacity, block);

        let per_block = config.block_size / DESCRIPTOR_SIZE as u32;
        let wanted = (device_length / config.secondary_log_size)
            .saturating_mul(config.index_factor)
            .max(1);
        let max_entries = u64::from(u32::MAX - u32::MAX % per_block);
        let index_length = align_up(wanted, u64::from(per_block)).min(max_entries);

        let index_start = block;
        let data_start = index_start + index_length * DESCRIPTOR_SIZE as u64;
        if data_start + block > device_length {
            return Err(Error::DeviceTooSmall {
                capacity: device_length,
            });
        }

        let mut header = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            device_length,
            block_size: config.block_size,
            index_start,
            index_length: index_length as u32,
            data_start,
            descriptor_size: DESCRIPTOR_SIZE as u32,
            descriptors_per_block: per_block,
            growth_unit: config.growth_unit,
            checksum: 0,
        };
        header.checksum = header.compute_checksum();
        Ok(header)
    }

    /// Serialize the header into one zero-padded block
    pub fn to_block(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.block_size as usize);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.device_length);
        buf.put_u32_le(self.block_size);
        buf.put_u64_le(self.index_start);
        buf.put_u32_le(self.index_length);
        buf.put_u64_le(self.data_start);
        buf.put_u32_le(self.descriptor_size);
        buf.put_u32_le(self.descriptors_per_block);
        buf.put_u64_le(self.growth_unit);
        buf.put_u32_le(self.checksum);

        buf.resize(self.block_size as usize, 0);
        buf
    }

    /// Whether `data` starts with the rawlog signature
    #[must_use]
    pub fn has_signature(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() && data[..MAGIC.len()] == MAGIC
    }

    /// Parse and validate a header from the first block of the device
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(Error::corrupt("device header too small"));
        }
        if !Self::has_signature(data) {
            return Err(Error::corrupt("invalid device header magic"));
        }

        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported format version: {version}"
            )));
        }

        let header = Self {
            magic,
            version,
            device_length: buf.get_u64_le(),
            block_size: buf.get_u32_le(),
            index_start: buf.get_u64_le(),
            index_length: buf.get_u32_le(),
            data_start: buf.get_u64_le(),
            descriptor_size: buf.get_u32_le(),
            descriptors_per_block: buf.get_u32_le(),
            growth_unit: buf.get_u64_le(),
            checksum: buf.get_u32_le(),
        };

        if header.compute_checksum() != header.checksum {
            return Err(Error::corrupt("device header checksum mismatch"));
        }
        header.validate()?;
        Ok(header)
    }

    /// Compute checksum of the header (CRC32C)
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_block();
        crc32c::crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Validate header consistency
    pub fn validate(&self) -> Result<()> {
        let block = u64::from(self.block_size);
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(Error::corrupt(format!(
                "invalid block size {}",
                self.block_size
            )));
        }
        if self.descriptor_size as usize != DESCRIPTOR_SIZE
            || self.descriptors_per_block != self.block_size / self.descriptor_size
        {
            return Err(Error::corrupt("descriptor geometry mismatch"));
        }
        if self.index_start != block
            || self.index_length == 0
            || self.index_length % self.descriptors_per_block != 0
        {
            return Err(Error::corrupt("invalid index region"));
        }
        if self.data_start != self.index_start + self.index_region_len()
            || self.data_start >= self.device_length
        {
            return Err(Error::corrupt("data region exceeds device length"));
        }
        if self.growth_unit == 0 || self.growth_unit % block != 0 {
            return Err(Error::corrupt("invalid growth unit"));
        }
        Ok(())
    }

    /// Size of the index region in bytes
    #[must_use]
    pub fn index_region_len(&self) -> u64 {
        u64::from(self.index_length) * u64::from(self.descriptor_size)
    }

    /// Device offset of the index block holding `slot`
    #[must_use]
    pub fn index_block_offset(&self, slot: u32) -> u64 {
        let group = slot / self.descriptors_per_block;
        self.index_start + u64::from(group) * u64::from(self.block_size)
    }

    /// Bytes available for log extents
    #[must_use]
    pub fn data_capacity(&self) -> u64 {
        self.device_length - self.data_start
    }
}
