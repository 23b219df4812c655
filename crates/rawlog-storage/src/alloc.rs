//! Append-only extent and slot allocation
//!
//! The allocator owns the two cursors of the device: the append cursor in
//! the data region and the next free descriptor slot. Space and slots only
//! move forward; deleted logs keep both forever.
//!
//! Callers hold the index lock around [`Allocator::reserve`] and whatever
//! they do with the reservation, so the capacity check and the cursor
//! update are one atomic step.

use crate::descriptor::Descriptor;
use crate::layout::DeviceHeader;
use rawlog_common::{Error, Result};

/// A slot and device range handed out by [`Allocator::reserve`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub slot: u32,
    pub begin: u64,
    pub length: u64,
}

/// Device append cursor and descriptor slot cursor
#[derive(Clone, Debug)]
pub struct Allocator {
    append: u64,
    next_free: u32,
    device_length: u64,
    capacity: u32,
}

impl Allocator {
    /// Cursors of a freshly formatted device
    #[must_use]
    pub fn new(header: &DeviceHeader) -> Self {
        Self {
            append: header.data_start,
            next_free: 0,
            device_length: header.device_length,
            capacity: header.index_length,
        }
    }

    /// Recover the cursors from a loaded index
    ///
    /// The slot cursor lands after the last slot ever handed out, deleted
    /// ones included; the append cursor lands after the furthest extent.
    pub fn recover(header: &DeviceHeader, slots: &[Option<Descriptor>]) -> Result<Self> {
        let mut alloc = Self::new(header);
        for (slot, desc) in slots.iter().enumerate() {
            let Some(desc) = desc else { continue };
            let end = desc
                .end()
                .filter(|&end| desc.begin >= header.data_start && end <= header.device_length)
                .ok_or_else(|| {
                    Error::corrupt(format!(
                        "descriptor {slot} extent of {} bytes at {} outside data region",
                        desc.part_length, desc.begin
                    ))
                })?;
            alloc.next_free = slot as u32 + 1;
            alloc.append = alloc.append.max(end);
        }
        Ok(alloc)
    }

    /// Next byte offset an extent would be placed at
    #[must_use]
    pub const fn append(&self) -> u64 {
        self.append
    }

    /// Next descriptor slot to be handed out
    #[must_use]
    pub const fn next_free(&self) -> u32 {
        self.next_free
    }

    /// Bytes still available below the device end
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        self.device_length - self.append
    }

    /// Check capacity for `length` bytes and a slot, then advance both cursors
    pub fn reserve(&mut self, length: u64) -> Result<Reservation> {
        if self.next_free >= self.capacity {
            return Err(Error::IndexFull {
                slot: self.next_free,
                capacity: self.capacity,
            });
        }
        if self.append.saturating_add(length) >= self.device_length {
            return Err(Error::DeviceFull {
                append: self.append,
                requested: length,
                capacity: self.device_length,
            });
        }

        let reservation = Reservation {
            slot: self.next_free,
            begin: self.append,
            length,
        };
        self.next_free += 1;
        self.append += length;
        Ok(reservation)
    }

    /// Give back the space of the latest reservation; its slot stays used
    pub fn release_space(&mut self, reservation: Reservation) {
        if reservation.begin + reservation.length == self.append {
            self.append = reservation.begin;
        }
    }
}
