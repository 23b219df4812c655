//! In-memory segment index mirrored to the device
//!
//! The index is a fixed-capacity table of [`Descriptor`] slots. Every change
//! is written back by rewriting the whole index block containing the slot,
//! since the device does not accept sub-block writes.
//!
//! Not synchronized on its own: the engine keeps it behind its single lock
//! and persistence happens while that lock is held.

use crate::aligned::out_of_memory;
use crate::alloc::{Allocator, Reservation};
use crate::descriptor::{DESCRIPTOR_SIZE, Descriptor, LogName};
use crate::layout::DeviceHeader;
use crate::raw_io::{AlignedBuffer, RawFile};
use rawlog_common::{Error, LogHandle, Result};
use tracing::{debug, warn};

/// Descriptor table plus the allocator cursors it is consistent with
pub struct SegmentIndex {
    slots: Vec<Option<Descriptor>>,
    alloc: Allocator,
    header: DeviceHeader,
}

impl SegmentIndex {
    /// Empty index for a freshly formatted device
    pub fn format(header: &DeviceHeader) -> Result<Self> {
        let slots = Self::allocate_slots(header.index_length)?;
        Ok(Self {
            slots,
            alloc: Allocator::new(header),
            header: header.clone(),
        })
    }

    /// Decode the index region read from the device
    pub fn load(header: &DeviceHeader, region: &[u8]) -> Result<Self> {
        let mut slots = Self::allocate_slots(header.index_length)?;
        for (slot, record) in region
            .chunks_exact(DESCRIPTOR_SIZE)
            .take(header.index_length as usize)
            .enumerate()
        {
            slots[slot] = Descriptor::decode(slot as u32, record)?;
        }
        let alloc = Allocator::recover(header, &slots)?;
        Ok(Self {
            slots,
            alloc,
            header: header.clone(),
        })
    }

    fn allocate_slots(entries: u32) -> Result<Vec<Option<Descriptor>>> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(entries as usize)
            .map_err(|_| Error::AllocationFailed { entries })?;
        slots.resize(entries as usize, None);
        Ok(slots)
    }

    /// Number of descriptor slots
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.header.index_length
    }

    /// Allocator cursors
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    /// Descriptor stored in `slot`, if the slot was ever handed out
    #[must_use]
    pub fn get(&self, slot: u32) -> Option<&Descriptor> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    /// Chain head behind a caller handle
    pub fn head(&self, handle: LogHandle) -> Result<&Descriptor> {
        match self.get(handle.slot()) {
            Some(desc) if desc.status.exists() && desc.is_head(handle.slot()) => Ok(desc),
            _ => Err(Error::InvalidHandle(handle.slot())),
        }
    }

    /// Find the live chain head called `name`
    #[must_use]
    pub fn find(&self, name: &LogName) -> Option<LogHandle> {
        (0..self.alloc.next_free())
            .find(|&slot| {
                self.get(slot).is_some_and(|desc| {
                    desc.status.exists() && desc.is_head(slot) && desc.name == *name
                })
            })
            .map(LogHandle::new)
    }

    /// All slots handed out so far, in slot order
    pub fn used(&self) -> impl Iterator<Item = (u32, &Descriptor)> {
        (0..self.alloc.next_free())
            .filter_map(move |slot| self.get(slot).map(|desc| (slot, desc)))
    }

    /// Live chain heads in slot order
    pub fn heads(&self) -> impl Iterator<Item = (u32, &Descriptor)> {
        self.used()
            .filter(|(slot, desc)| desc.status.exists() && desc.is_head(*slot))
    }

    /// Flip the volatile open flag; nothing is persisted
    pub fn set_open(&mut self, handle: LogHandle, open: bool) -> Result<()> {
        self.head(handle)?;
        if let Some(Some(desc)) = self.slots.get_mut(handle.slot() as usize) {
            desc.status.set_open(open);
        }
        Ok(())
    }

    /// Reserve space and a slot, store the descriptor built by `make` and
    /// persist it
    ///
    /// If persisting fails the slot is left empty (and lost) and the space
    /// is handed back.
    pub fn create(
        &mut self,
        file: &RawFile,
        length: u64,
        make: impl FnOnce(Reservation) -> Descriptor,
    ) -> Result<Reservation> {
        let reservation = self.alloc.reserve(length)?;
        let slot = reservation.slot;
        self.slots[slot as usize] = Some(make(reservation));

        if let Err(e) = self.persist(file, slot) {
            warn!("failed to persist new descriptor {}: {}", slot, e);
            self.slots[slot as usize] = None;
            self.alloc.release_space(reservation);
            return Err(e);
        }
        Ok(reservation)
    }

    /// Apply `change` to an existing descriptor and persist it
    ///
    /// If persisting fails the previous in-memory value is restored.
    pub fn update(
        &mut self,
        file: &RawFile,
        slot: u32,
        change: impl FnOnce(&mut Descriptor),
    ) -> Result<()> {
        let Some(Some(desc)) = self.slots.get_mut(slot as usize) else {
            return Err(Error::corrupt(format!("update of empty slot {slot}")));
        };
        let previous = desc.clone();
        change(desc);

        if let Err(e) = self.persist(file, slot) {
            warn!("failed to persist descriptor {}: {}", slot, e);
            self.slots[slot as usize] = Some(previous);
            return Err(e);
        }
        Ok(())
    }

    /// Mark a descriptor that never became reachable as deleted
    ///
    /// Its record may already be on the device, so the slot must stay taken
    /// across restarts. The tombstone is written now if possible, otherwise
    /// with the next write of its index block.
    pub(crate) fn retire(&mut self, file: &RawFile, slot: u32) {
        let Some(Some(desc)) = self.slots.get_mut(slot as usize) else {
            return;
        };
        desc.status.mark_deleted();
        if let Err(e) = self.persist(file, slot) {
            warn!("failed to persist tombstone {}: {}", slot, e);
        }
    }

    /// Write the index block holding `slot` back to the device
    fn persist(&self, file: &RawFile, slot: u32) -> Result<()> {
        let per_block = self.header.descriptors_per_block;
        let first = slot - slot % per_block;
        let block_size = self.header.block_size as usize;
        let mut block =
            AlignedBuffer::try_new(block_size, block_size).ok_or_else(|| out_of_memory(block_size))?;

        for (i, record) in block.chunks_exact_mut(DESCRIPTOR_SIZE).enumerate() {
            let s = first + i as u32;
            if let Some(desc) = self.get(s) {
                desc.encode(s, record);
            }
        }

        let offset = self.header.index_block_offset(slot);
        debug!("persisting index block {} at {}", slot / per_block, offset);
        file.write_all_at(offset, &block)
    }
}
