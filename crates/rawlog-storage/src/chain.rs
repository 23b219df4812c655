//! Mapping logical byte windows onto extents
//!
//! A primary or secondary log lives in one extent. A version log is a
//! singly linked chain of extents starting at its head descriptor; walking
//! it while summing `part_length` yields the logical offset of each extent.
//! Writes may extend the chain with new extents of a whole number of growth
//! units, reads never do.
//!
//! Everything here runs under the engine lock. The returned [`Piece`]s stay
//! valid after the lock is dropped because extents are never moved or
//! resized once created.

use crate::descriptor::Descriptor;
use crate::index::SegmentIndex;
use crate::raw_io::RawFile;
use rawlog_common::{Error, LogHandle, Result};
use tracing::debug;

/// Part of an aligned window that lives in one extent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    /// Device offset of the first byte
    pub device_offset: u64,
    /// Offset of the first byte within the window
    pub window_offset: u64,
    pub len: u64,
}

/// Block-aligned logical byte range `[start, start + len)` of one file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub len: u64,
}

impl Window {
    /// Exclusive end, `None` when it is not addressable
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        self.start.checked_add(self.len)
    }

    fn out_of_range(self, capacity: u64) -> Error {
        Error::OutOfRange {
            pos: self.start,
            length: self.len,
            capacity,
        }
    }
}

/// Walks and extends extent chains of one segment index
pub struct ChainWalker<'a> {
    index: &'a mut SegmentIndex,
    file: &'a RawFile,
    growth_unit: u64,
}

impl<'a> ChainWalker<'a> {
    pub fn new(index: &'a mut SegmentIndex, file: &'a RawFile, growth_unit: u64) -> Self {
        Self {
            index,
            file,
            growth_unit,
        }
    }

    /// Map `window` of the file behind `handle` to device pieces
    ///
    /// Single-extent files must hold the whole window. Chained files are
    /// walked from the head; with `grow` set, missing tail capacity is
    /// allocated, otherwise a window past the chain end is `OutOfRange`.
    pub fn map(&mut self, handle: LogHandle, window: Window, grow: bool) -> Result<Vec<Piece>> {
        let head = self.index.head(handle)?;
        let Some(end) = window.end() else {
            return Err(window.out_of_range(head.part_length));
        };
        if !head.log_type.is_chained() {
            return Self::map_single(head, window, end);
        }
        self.map_chain(handle.slot(), window, end, grow)
    }

    fn map_single(desc: &Descriptor, window: Window, end: u64) -> Result<Vec<Piece>> {
        if end > desc.part_length {
            return Err(window.out_of_range(desc.part_length));
        }
        let device_offset = desc
            .begin
            .checked_add(window.start)
            .ok_or_else(|| window.out_of_range(desc.part_length))?;
        Ok(vec![Piece {
            device_offset,
            window_offset: 0,
            len: window.len,
        }])
    }

    fn map_chain(&mut self, head: u32, window: Window, end: u64, grow: bool) -> Result<Vec<Piece>> {
        let mut pieces = Vec::new();
        let mut slot = head;
        let mut logical = 0u64;
        let mut steps = 0u32;

        loop {
            steps += 1;
            if steps > self.index.capacity() {
                return Err(Error::corrupt(format!("chain of {head} does not terminate")));
            }
            let (begin, part_length, next) = {
                let desc = self.link(head, slot)?;
                (desc.begin, desc.part_length, desc.next)
            };

            let extent_start = logical;
            let extent_end = logical.checked_add(part_length).ok_or_else(|| {
                Error::corrupt(format!("chain of {head} exceeds the logical address space"))
            })?;
            if extent_end > window.start && extent_start < end {
                let from = window.start.max(extent_start);
                let to = end.min(extent_end);
                pieces.push(Piece {
                    device_offset: begin + (from - extent_start),
                    window_offset: from - window.start,
                    len: to - from,
                });
            }
            logical = extent_end;
            if logical >= end {
                return Ok(pieces);
            }

            slot = match next {
                Some(next) => next,
                None if grow => self.extend(head, slot, end - logical)?,
                None => return Err(window.out_of_range(logical)),
            };
        }
    }

    /// Chain member `slot` of the chain headed by `head`
    fn link(&self, head: u32, slot: u32) -> Result<&Descriptor> {
        match self.index.get(slot) {
            Some(desc) if desc.first == head && desc.status.exists() => Ok(desc),
            Some(_) => Err(Error::corrupt(format!(
                "slot {slot} linked from chain {head} belongs elsewhere"
            ))),
            None => Err(Error::corrupt(format!(
                "chain {head} links to empty slot {slot}"
            ))),
        }
    }

    /// Append a new extent of at least `missing` bytes after `tail`
    ///
    /// The new descriptor is persisted before the tail is relinked to it.
    fn extend(&mut self, head: u32, tail: u32, missing: u64) -> Result<u32> {
        let alloc = self.index.allocator();
        let length = missing
            .checked_next_multiple_of(self.growth_unit)
            .ok_or_else(|| Error::DeviceFull {
                append: alloc.append(),
                requested: missing,
                capacity: alloc.append() + alloc.free_space(),
            })?;
        let head_desc = self.link(head, head)?.clone();

        let reservation = self.index.create(self.file, length, |r| {
            Descriptor::link(head, &head_desc, r.begin, r.length)
        })?;
        let slot = reservation.slot;

        if let Err(e) = self.index.update(self.file, tail, |d| d.next = Some(slot)) {
            self.index.retire(self.file, slot);
            return Err(e);
        }

        debug!(
            "extended chain {} with slot {} ({} bytes at {})",
            head, slot, length, reservation.begin
        );
        Ok(slot)
    }

    /// Slots of the chain headed by `handle`, head first
    pub fn slots(&self, handle: LogHandle) -> Result<Vec<u32>> {
        self.index.head(handle)?;
        let head = handle.slot();
        let mut slots = vec![head];
        let mut slot = head;
        while let Some(next) = self.link(head, slot)?.next {
            if slots.len() as u32 >= self.index.capacity() {
                return Err(Error::corrupt(format!("chain of {head} does not terminate")));
            }
            slots.push(next);
            slot = next;
        }
        Ok(slots)
    }
}
