//! Block-aligned staging for unaligned reads and writes
//!
//! The device only accepts whole, aligned blocks. A write of `length` bytes
//! at logical position `pos` therefore covers the aligned window around it,
//! and the bytes of that window which are not part of the write must be
//! read back from the device first so they survive.
//!
//! [`IoBuffer`] is the caller-facing write buffer. Its payload is preceded
//! by one guard block, which receives the device block in front of an
//! unaligned `pos` without touching the caller's bytes.

use crate::chain::Window;
use crate::layout::align_down;
use crate::raw_io::AlignedBuffer;
use rawlog_common::{Error, Result};
use std::ops::Range;

/// Aligned window covering `length` bytes at logical position `pos`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlignedWindow {
    /// Bytes between the window start and `pos`
    pub head: u64,
    /// Aligned logical start
    pub start: u64,
    /// Aligned length
    pub len: u64,
    /// Requested length
    pub length: u64,
}

impl AlignedWindow {
    /// Window of `length` bytes at `pos`, or `OutOfRange` when its aligned
    /// end is not addressable
    pub fn new(pos: u64, length: u64, block: u64) -> Result<Self> {
        let head = pos % block;
        let start = pos - head;
        let len = head
            .checked_add(length)
            .and_then(|n| n.checked_next_multiple_of(block))
            .filter(|&len| start.checked_add(len).is_some())
            .ok_or_else(|| Error::OutOfRange {
                pos,
                length,
                capacity: align_down(u64::MAX, block),
            })?;
        Ok(Self {
            head,
            start,
            len,
            length,
        })
    }

    /// Bytes of the last block that follow the requested range
    #[must_use]
    pub const fn tail(&self) -> u64 {
        self.len - self.head - self.length
    }

    #[must_use]
    pub const fn span(&self) -> Window {
        Window {
            start: self.start,
            len: self.len,
        }
    }
}

/// Write buffer with a guard block in front of the payload
pub struct IoBuffer {
    buf: AlignedBuffer,
    block: usize,
    capacity: usize,
}

impl IoBuffer {
    /// Buffer for up to `capacity` payload bytes on a device with
    /// `block_size` blocks
    pub fn new(capacity: usize, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        // guard block + payload + one slack block
        let size = block_size + capacity.div_ceil(block_size) * block_size + block_size;
        let buf = AlignedBuffer::try_new(size, block_size).ok_or_else(|| out_of_memory(size))?;
        Ok(Self {
            buf,
            block: block_size,
            capacity,
        })
    }

    /// Usable payload bytes
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.block..self.block + self.capacity]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.block..self.block + self.capacity]
    }

    /// Copy `data` into the payload at `offset`
    pub fn fill(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        self.payload_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// `offset..offset + length` must lie within the payload
    pub fn check(&self, offset: usize, length: usize) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(Error::invalid_argument(format!(
                "range {offset}+{length} exceeds buffer capacity {}",
                self.capacity
            ))),
        }
    }

    /// Lay out the payload range `offset..offset + length` as the aligned
    /// `window` and return its position in the raw buffer
    ///
    /// `read_block(at, dst)` must fill `dst` with the device block at
    /// window-relative offset `at`. It is called for the first block when
    /// `pos` is unaligned and for the last block when the write ends inside
    /// it. The payload bytes are moved in place; the caller's content is
    /// not preserved beyond the write.
    pub(crate) fn stage<F>(
        &mut self,
        offset: usize,
        window: &AlignedWindow,
        mut read_block: F,
    ) -> Result<Range<usize>>
    where
        F: FnMut(u64, &mut [u8]) -> Result<()>,
    {
        let length = window.length as usize;
        self.check(offset, length)?;

        let block = self.block;
        let head = window.head as usize;
        let len = window.len as usize;
        let src = block + offset;

        let start = if head > 0 {
            // The block in front of the data: never overlaps it.
            let start = align_down(src as u64, block as u64) as usize - block;
            read_block(0, &mut self.buf[start..start + block])?;
            start
        } else {
            align_down(src as u64, block as u64) as usize
        };
        if start + head != src {
            self.buf.copy_within(src..src + length, start + head);
        }

        // A single block with a head was read whole above.
        if window.tail() > 0 && !(head > 0 && len == block) {
            let mut scratch =
                AlignedBuffer::try_new(block, block).ok_or_else(|| out_of_memory(block))?;
            let last = len - block;
            read_block(last as u64, &mut scratch)?;
            let keep = (head + length) % block;
            self.buf[start + last + keep..start + len].copy_from_slice(&scratch[keep..]);
        }

        Ok(start..start + len)
    }

    pub(crate) fn raw(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("capacity", &self.capacity)
            .field("block", &self.block)
            .finish()
    }
}

pub(crate) fn out_of_memory(size: usize) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::OutOfMemory,
        format!("failed to allocate {size} byte aligned buffer"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: usize = 512;

    /// Device content where every byte encodes its own offset
    fn device_byte(at: usize) -> u8 {
        (at % 251) as u8
    }

    fn fake_device(base: u64) -> impl FnMut(u64, &mut [u8]) -> Result<()> {
        move |at, dst| {
            for (i, b) in dst.iter_mut().enumerate() {
                *b = device_byte((base + at) as usize + i);
            }
            Ok(())
        }
    }

    #[test]
    fn test_window_math() {
        let w = AlignedWindow::new(100, 50, 4096).unwrap();
        assert_eq!((w.start, w.head, w.len, w.tail()), (0, 100, 4096, 3946));

        let w = AlignedWindow::new(8192, 4096, 4096).unwrap();
        assert_eq!((w.start, w.head, w.len, w.tail()), (8192, 0, 4096, 0));

        let w = AlignedWindow::new(4000, 200, 4096).unwrap();
        assert_eq!((w.start, w.len), (0, 8192));
        assert_eq!(w.span(), Window { start: 0, len: 8192 });
    }

    #[test]
    fn test_window_end_must_be_addressable() {
        assert!(matches!(
            AlignedWindow::new(u64::MAX - 4095, 4096, 4096),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            AlignedWindow::new(100, u64::MAX - 50, 4096),
            Err(Error::OutOfRange { .. })
        ));

        let last = AlignedWindow::new(u64::MAX - 8191, 4096, 4096).unwrap();
        assert_eq!(last.span().end(), Some(u64::MAX - 4095));
    }

    #[test]
    fn test_capacity_check() {
        let mut buf = IoBuffer::new(1000, B).unwrap();
        assert_eq!(buf.payload().len(), 1000);
        assert!(buf.check(0, 1000).is_ok());
        assert!(matches!(buf.check(1, 1000), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            buf.check(usize::MAX, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(buf.fill(990, &[0u8; 20]).is_err());
        assert!(IoBuffer::new(1000, 1000).is_err());
    }

    #[test]
    fn test_stage_aligned_is_in_place() {
        let mut buf = IoBuffer::new(2 * B, B).unwrap();
        buf.fill(0, &[7u8; 2 * B]).unwrap();
        let window = AlignedWindow::new(0, 2 * B as u64, B as u64).unwrap();

        let range = buf
            .stage(0, &window, |_, _| panic!("no device read needed"))
            .unwrap();
        assert_eq!(range, B..3 * B);
        assert!(buf.raw()[range].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_stage_unaligned_pos_keeps_neighbours() {
        let mut buf = IoBuffer::new(B, B).unwrap();
        buf.fill(0, &[0xAA; 50]).unwrap();
        let window = AlignedWindow::new(100, 50, B as u64).unwrap();

        let range = buf.stage(0, &window, fake_device(0)).unwrap();
        assert_eq!(range.len(), B);
        let staged = &buf.raw()[range];
        for (i, &b) in staged.iter().enumerate() {
            if (100..150).contains(&i) {
                assert_eq!(b, 0xAA);
            } else {
                assert_eq!(b, device_byte(i), "byte {i}");
            }
        }
    }

    #[test]
    fn test_stage_unaligned_offset_shifts_down() {
        let mut buf = IoBuffer::new(3 * B, B).unwrap();
        let data: Vec<u8> = (0..B).map(|i| (i % 7) as u8 + 1).collect();
        buf.fill(300, &data).unwrap();
        let window = AlignedWindow::new(B as u64, B as u64, B as u64).unwrap();

        let range = buf
            .stage(300, &window, |_, _| panic!("no device read needed"))
            .unwrap();
        assert_eq!(range.start % B, 0);
        assert_eq!(&buf.raw()[range], &data[..]);
    }

    #[test]
    fn test_stage_spanning_blocks_reads_both_ends() {
        let mut buf = IoBuffer::new(4 * B, B).unwrap();
        buf.fill(10, &[0x55; 600]).unwrap();
        // pos 1000 .. 1600 touches blocks 1, 2 and 3
        let window = AlignedWindow::new(1000, 600, B as u64).unwrap();
        assert_eq!((window.start, window.len), (B as u64, 3 * B as u64));

        let mut reads = Vec::new();
        let mut device = fake_device(window.start);
        let range = buf
            .stage(10, &window, |at, dst| {
                reads.push(at);
                device(at, dst)
            })
            .unwrap();
        assert_eq!(reads, vec![0, 2 * B as u64]);

        let staged = &buf.raw()[range];
        let head = window.head as usize;
        for (i, &b) in staged.iter().enumerate() {
            if (head..head + 600).contains(&i) {
                assert_eq!(b, 0x55);
            } else {
                assert_eq!(b, device_byte(B + i), "byte {i}");
            }
        }
    }

    #[test]
    fn test_stage_short_aligned_write_reads_tail() {
        let mut buf = IoBuffer::new(B, B).unwrap();
        buf.fill(0, &[1u8; 10]).unwrap();
        let window = AlignedWindow::new(0, 10, B as u64).unwrap();

        let range = buf.stage(0, &window, fake_device(0)).unwrap();
        let staged = &buf.raw()[range];
        assert!(staged[..10].iter().all(|&b| b == 1));
        assert_eq!(staged[10], device_byte(10));
        assert_eq!(staged[B - 1], device_byte(B - 1));
    }

    #[test]
    fn test_stage_propagates_read_failure() {
        let mut buf = IoBuffer::new(B, B).unwrap();
        let window = AlignedWindow::new(1, 1, B as u64).unwrap();
        let err = buf
            .stage(0, &window, |_, _| Err(Error::corrupt("boom")))
            .unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
