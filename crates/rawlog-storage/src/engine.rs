//! Log device engine
//!
//! [`LogDevice`] is the engine context for one raw partition. It owns the
//! device handle, the header and the segment index, and exposes the logical
//! file operations: open, close, remove, write, read, length and listing.
//!
//! One mutex guards the index table and both allocator cursors and is held
//! while descriptors are persisted. Bulk data transfer runs without it;
//! callers must serialize writers of the same logical file.

use crate::aligned::{AlignedWindow, IoBuffer, out_of_memory};
use crate::chain::{ChainWalker, Piece};
use crate::descriptor::{Descriptor, LogName};
use crate::index::SegmentIndex;
use crate::layout::DeviceHeader;
use crate::raw_io::{AlignedBuffer, RawFile};
use parking_lot::Mutex;
use rawlog_common::{EngineConfig, Error, LogHandle, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Largest chunk used to zero the index region while formatting
const FORMAT_CHUNK: u64 = 1024 * 1024;

/// How [`LogDevice::bootstrap`] treats existing device content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapMode {
    /// Always lay out a fresh, empty device
    Format,
    /// Resume a formatted device; format when no signature is found
    Resume,
    /// Resume a formatted device; a missing signature is an error
    Existing,
}

/// Device I/O statistics
#[derive(Debug, Default)]
pub struct EngineStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Snapshot of one used descriptor slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub slot: u32,
    pub descriptor: Descriptor,
}

/// Engine context for one raw log partition
pub struct LogDevice {
    file: RawFile,
    header: DeviceHeader,
    config: EngineConfig,
    index: Mutex<SegmentIndex>,
    stats: EngineStats,
}

impl LogDevice {
    /// Open the device at `path` and either resume or format it
    ///
    /// Resuming a device whose signature is present but whose header fails
    /// validation is an error, never a silent reformat.
    pub fn bootstrap(
        path: impl AsRef<Path>,
        mode: BootstrapMode,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let mut file = RawFile::open(&path, config.block_size, config.direct_io)?;

        let block = config.block_size as usize;
        let mut first = AlignedBuffer::try_new(block, block).ok_or_else(|| out_of_memory(block))?;
        file.read_exact_at(0, &mut first).map_err(header_io)?;

        let signed = DeviceHeader::has_signature(&first);
        let (header, index) = match mode {
            BootstrapMode::Resume | BootstrapMode::Existing if signed => {
                Self::resume(&mut file, &first)?
            }
            BootstrapMode::Existing => {
                return Err(Error::corrupt(format!(
                    "{} is not a formatted log device",
                    file.path()
                )));
            }
            BootstrapMode::Resume | BootstrapMode::Format => Self::format(&file, &config)?,
        };

        Ok(Self {
            file,
            header,
            config,
            index: Mutex::new(index),
            stats: EngineStats::default(),
        })
    }

    fn resume(file: &mut RawFile, first: &[u8]) -> Result<(DeviceHeader, SegmentIndex)> {
        let header = DeviceHeader::from_bytes(first)?;
        if header.device_length > file.size() {
            return Err(Error::corrupt(format!(
                "header describes {} bytes, device has {}",
                header.device_length,
                file.size()
            )));
        }
        file.set_block_size(header.block_size);

        let region_len = header.index_region_len() as usize;
        let mut region = AlignedBuffer::try_new(region_len, header.block_size as usize)
            .ok_or(Error::AllocationFailed {
                entries: header.index_length,
            })?;
        file.read_exact_at(header.index_start, &mut region)?;
        let index = SegmentIndex::load(&header, &region)?;

        let alloc = index.allocator();
        info!(
            "resumed log device {}: {} slots used of {}, append at {}",
            file.path(),
            alloc.next_free(),
            header.index_length,
            alloc.append()
        );
        Ok((header, index))
    }

    fn format(file: &RawFile, config: &EngineConfig) -> Result<(DeviceHeader, SegmentIndex)> {
        let header = DeviceHeader::plan(file.size(), config)?;
        let index = SegmentIndex::format(&header)?;
        let block = header.block_size as usize;

        // Index first: a torn format never leaves a valid signature behind.
        let region_len = header.index_region_len();
        let chunk_len = region_len.min(FORMAT_CHUNK);
        let zeros = AlignedBuffer::try_new(chunk_len as usize, block).ok_or(
            Error::AllocationFailed {
                entries: header.index_length,
            },
        )?;
        let mut done = 0;
        while done < region_len {
            let len = (region_len - done).min(chunk_len) as usize;
            file.write_all_at(header.index_start + done, &zeros[..len])?;
            done += len as u64;
        }

        let mut first = AlignedBuffer::try_new(block, block).ok_or_else(|| out_of_memory(block))?;
        first.copy_from(&header.to_block());
        file.write_all_at(0, &first).map_err(header_io)?;

        info!(
            "formatted log device {}: {} bytes, {} index slots, data at {}",
            file.path(),
            header.device_length,
            header.index_length,
            header.data_start
        );
        Ok((header, index))
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        self.file.path()
    }

    /// Device header in effect
    pub fn header(&self) -> &DeviceHeader {
        &self.header
    }

    /// Engine configuration the device was bootstrapped with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get statistics
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Bytes still available for new extents
    pub fn free_space(&self) -> u64 {
        self.index.lock().allocator().free_space()
    }

    fn block_size(&self) -> u64 {
        u64::from(self.header.block_size)
    }

    /// Open the logical file `name`, creating it when no live file of that
    /// name exists
    ///
    /// A new file gets one extent of `size_hint` bytes rounded up to whole
    /// blocks, or one growth unit without a hint. Opening an already open
    /// file returns the same handle.
    pub fn open(&self, name: &str, size_hint: Option<u64>) -> Result<LogHandle> {
        let log_name = LogName::new(name);
        let mut index = self.index.lock();

        if let Some(handle) = index.find(&log_name) {
            index.set_open(handle, true)?;
            return Ok(handle);
        }

        let log_type = self.config.markers.classify(name)?;
        let length = match size_hint {
            Some(hint) if hint > 0 => hint
                .checked_next_multiple_of(self.block_size())
                .ok_or_else(|| Error::DeviceFull {
                    append: index.allocator().append(),
                    requested: hint,
                    capacity: self.header.device_length,
                })?,
            _ => self.header.growth_unit,
        };
        let reservation = index.create(&self.file, length, |r| {
            let mut desc = Descriptor::head(r.slot, log_type, log_name, r.begin, r.length);
            desc.status.set_open(true);
            desc
        })?;

        info!(
            "created {} log {:?} in slot {} ({} bytes at {})",
            log_type, log_name, reservation.slot, reservation.length, reservation.begin
        );
        Ok(LogHandle::new(reservation.slot))
    }

    /// Handle of the live file called `name`, without opening or creating it
    pub fn find(&self, name: &str) -> Option<LogHandle> {
        self.index.lock().find(&LogName::new(name))
    }

    /// Mark the file closed; nothing is persisted
    pub fn close(&self, handle: LogHandle) -> Result<()> {
        self.index.lock().set_open(handle, false)
    }

    /// Delete a closed file
    ///
    /// Its slots and extents are never reused; a later open of the same
    /// name creates a new file.
    pub fn remove(&self, handle: LogHandle) -> Result<()> {
        let mut index = self.index.lock();
        if index.head(handle)?.status.is_open() {
            return Err(Error::FileOpen(handle.slot()));
        }
        index.update(&self.file, handle.slot(), |d| d.status.mark_deleted())?;
        info!("removed log in slot {}", handle.slot());
        Ok(())
    }

    /// Current logical length of the file
    pub fn length(&self, handle: LogHandle) -> Result<u64> {
        Ok(self.index.lock().head(handle)?.cur_length)
    }

    /// Names of all live files, each followed by a newline
    pub fn list_files(&self) -> String {
        let index = self.index.lock();
        let mut out = String::new();
        for (_, desc) in index.heads() {
            out.push_str(desc.name.as_str());
            out.push('\n');
        }
        out
    }

    /// Snapshot of every used descriptor slot, in slot order
    pub fn segments(&self) -> Vec<Segment> {
        self.index
            .lock()
            .used()
            .map(|(slot, desc)| Segment {
                slot,
                descriptor: desc.clone(),
            })
            .collect()
    }

    /// Slots of the extent chain behind `handle`, head first
    pub fn chain(&self, handle: LogHandle) -> Result<Vec<u32>> {
        let mut index = self.index.lock();
        ChainWalker::new(&mut index, &self.file, self.header.growth_unit).slots(handle)
    }

    /// Write `length` payload bytes of `buf` starting at `offset` to logical
    /// position `pos`
    ///
    /// Device bytes around an unaligned range are preserved. Version logs
    /// grow as needed; primary and secondary logs must already hold the
    /// range. With `finalize_length` the file length becomes `length`, the
    /// requested byte count, whatever `pos` is. The payload of `buf` is
    /// rearranged in the process.
    pub fn write(
        &self,
        handle: LogHandle,
        buf: &mut IoBuffer,
        offset: usize,
        length: usize,
        pos: u64,
        finalize_length: bool,
    ) -> Result<usize> {
        buf.check(offset, length)?;
        if buf.block_size() as u64 != self.block_size() {
            return Err(Error::invalid_argument(format!(
                "buffer block size {} does not match device block size {}",
                buf.block_size(),
                self.block_size()
            )));
        }

        let window = AlignedWindow::new(pos, length as u64, self.block_size())?;
        if length > 0 {
            let pieces = {
                let mut index = self.index.lock();
                ChainWalker::new(&mut index, &self.file, self.header.growth_unit).map(
                    handle,
                    window.span(),
                    true,
                )?
            };

            if let Err(e) = self.write_pieces(buf, offset, &window, &pieces) {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bytes_written
                .fetch_add(window.len, Ordering::Relaxed);
        }

        let mut index = self.index.lock();
        index.head(handle)?;
        if finalize_length {
            let cur_length = length as u64;
            index.update(&self.file, handle.slot(), |d| d.cur_length = cur_length)?;
            debug!("log {} length set to {}", handle, cur_length);
        }
        Ok(length)
    }

    fn write_pieces(
        &self,
        buf: &mut IoBuffer,
        offset: usize,
        window: &AlignedWindow,
        pieces: &[Piece],
    ) -> Result<()> {
        let range = buf.stage(offset, window, |at, dst| {
            self.file.read_exact_at(locate(pieces, at)?, dst)
        })?;
        let staged = &buf.raw()[range];
        for piece in pieces {
            let from = piece.window_offset as usize;
            let to = from + piece.len as usize;
            self.file.write_all_at(piece.device_offset, &staged[from..to])?;
        }
        Ok(())
    }

    /// Read `length` bytes at logical position `pos` into
    /// `buf[offset..offset + length]`
    pub fn read(
        &self,
        handle: LogHandle,
        buf: &mut [u8],
        offset: usize,
        length: usize,
        pos: u64,
    ) -> Result<usize> {
        if offset.checked_add(length).is_none_or(|end| end > buf.len()) {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{length} exceeds buffer of {} bytes",
                buf.len()
            )));
        }

        let window = AlignedWindow::new(pos, length as u64, self.block_size())?;
        let pieces = {
            let mut index = self.index.lock();
            if length == 0 {
                index.head(handle)?;
                return Ok(0);
            }
            ChainWalker::new(&mut index, &self.file, self.header.growth_unit).map(
                handle,
                window.span(),
                false,
            )?
        };

        let block = self.header.block_size as usize;
        let mut stage = AlignedBuffer::try_new(window.len as usize, block)
            .ok_or_else(|| out_of_memory(window.len as usize))?;
        for piece in &pieces {
            let from = piece.window_offset as usize;
            let to = from + piece.len as usize;
            if let Err(e) = self.file.read_exact_at(piece.device_offset, &mut stage[from..to]) {
                self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(window.len, Ordering::Relaxed);

        let head = window.head as usize;
        buf[offset..offset + length].copy_from_slice(&stage[head..head + length]);
        Ok(length)
    }
}

/// Device offset of the window-relative block at `at`
fn locate(pieces: &[Piece], at: u64) -> Result<u64> {
    pieces
        .iter()
        .find(|p| p.window_offset <= at && at < p.window_offset + p.len)
        .map(|p| p.device_offset + (at - p.window_offset))
        .ok_or_else(|| Error::corrupt(format!("window offset {at} is not mapped")))
}

/// Header block failures are reported as such
fn header_io(err: Error) -> Error {
    match err {
        Error::Io(e) => Error::HeaderIoFailed(e),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    const MIB: u64 = 1024 * 1024;
    const B: usize = 4096;

    fn scratch(size: u64) -> NamedTempFile {
        let temp = NamedTempFile::new().unwrap();
        temp.as_file().set_len(size).unwrap();
        temp
    }

    fn format(temp: &NamedTempFile) -> LogDevice {
        LogDevice::bootstrap(temp.path(), BootstrapMode::Format, EngineConfig::buffered()).unwrap()
    }

    fn resume(temp: &NamedTempFile) -> LogDevice {
        LogDevice::bootstrap(temp.path(), BootstrapMode::Resume, EngineConfig::buffered()).unwrap()
    }

    fn write_bytes(dev: &LogDevice, h: LogHandle, data: &[u8], pos: u64, finalize: bool) {
        let mut buf = IoBuffer::new(data.len(), B).unwrap();
        buf.fill(0, data).unwrap();
        assert_eq!(
            dev.write(h, &mut buf, 0, data.len(), pos, finalize).unwrap(),
            data.len()
        );
    }

    fn read_bytes(dev: &LogDevice, h: LogHandle, pos: u64, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        assert_eq!(dev.read(h, &mut out, 0, length, pos).unwrap(), length);
        out
    }

    fn random(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn test_sixteen_mib_scenario() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);

        let primary = dev.open("primary-0", None).unwrap();
        write_bytes(&dev, primary, &[0xAB; B], 0, false);
        assert!(read_bytes(&dev, primary, 0, B).iter().all(|&b| b == 0xAB));

        let version = dev.open("version-7", Some(4096)).unwrap();
        let data = random(10000);
        write_bytes(&dev, version, &data, 0, true);
        assert_eq!(dev.length(version).unwrap(), 10000);
        assert_eq!(read_bytes(&dev, version, 0, 10000), data);
        assert_eq!(dev.chain(version).unwrap().len(), 2);
    }

    #[test]
    fn test_unaligned_write_preserves_neighbours() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-a", None).unwrap();

        let background = random(2 * B);
        write_bytes(&dev, h, &background, 0, false);
        write_bytes(&dev, h, &[0x11; 50], 100, false);

        let block = read_bytes(&dev, h, 0, 2 * B);
        assert_eq!(&block[..100], &background[..100]);
        assert!(block[100..150].iter().all(|&b| b == 0x11));
        assert_eq!(&block[150..], &background[150..]);
    }

    #[test]
    fn test_write_across_block_boundary() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("sec-1", None).unwrap();

        let background = random(3 * B);
        write_bytes(&dev, h, &background, 0, false);
        let data = random(B + 500);
        write_bytes(&dev, h, &data, 3000, false);

        let all = read_bytes(&dev, h, 0, 3 * B);
        assert_eq!(&all[..3000], &background[..3000]);
        assert_eq!(&all[3000..3000 + data.len()], &data[..]);
        assert_eq!(&all[3000 + data.len()..], &background[3000 + data.len()..]);
    }

    #[test]
    fn test_buffer_offset_and_partial_read() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-a", None).unwrap();

        let data = random(B);
        let mut buf = IoBuffer::new(3 * B, B).unwrap();
        buf.fill(777, &data).unwrap();
        dev.write(h, &mut buf, 777, B, 2 * B as u64, false).unwrap();

        let mut out = vec![0u8; 100];
        dev.read(h, &mut out, 10, 80, 2 * B as u64 + 5).unwrap();
        assert_eq!(&out[10..90], &data[5..85]);
        assert!(out[..10].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_open_is_idempotent() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let a = dev.open("prim-a", None).unwrap();
        let again = dev.open("prim-a", Some(123)).unwrap();
        assert_eq!(a, again);
        assert_eq!(dev.segments().len(), 1);
        assert_eq!(dev.list_files(), "prim-a\n");
    }

    #[test]
    fn test_remove_semantics() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-a", None).unwrap();

        assert!(matches!(dev.remove(h), Err(Error::FileOpen(0))));
        dev.close(h).unwrap();
        dev.remove(h).unwrap();
        assert!(matches!(dev.length(h), Err(Error::InvalidHandle(0))));
        assert_eq!(dev.list_files(), "");

        let reopened = dev.open("prim-a", None).unwrap();
        assert_eq!(reopened.slot(), 1);
        assert_eq!(dev.segments().len(), 2);
    }

    #[test]
    fn test_invalid_name() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        assert!(matches!(
            dev.open("journal", None),
            Err(Error::InvalidName(_))
        ));
        assert!(dev.segments().is_empty());
    }

    #[test]
    fn test_index_full() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        assert_eq!(dev.header().index_length, 32);
        for i in 0..32 {
            dev.open(&format!("prim-{i}"), Some(4096)).unwrap();
        }
        assert!(matches!(
            dev.open("prim-32", Some(4096)),
            Err(Error::IndexFull { slot: 32, capacity: 32 })
        ));
    }

    #[test]
    fn test_device_full() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let free = dev.free_space();

        assert!(matches!(
            dev.open("prim-big", Some(free)),
            Err(Error::DeviceFull { .. })
        ));
        assert_eq!(dev.free_space(), free);
        assert!(dev.segments().is_empty());

        dev.open("prim-fits", Some(free - 4096)).unwrap();
        assert_eq!(dev.free_space(), 4096);
    }

    #[test]
    fn test_primary_write_out_of_range() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-small", Some(4096)).unwrap();

        let mut buf = IoBuffer::new(100, B).unwrap();
        assert!(matches!(
            dev.write(h, &mut buf, 0, 100, 4050, false),
            Err(Error::OutOfRange { .. })
        ));
        let mut out = [0u8; 10];
        assert!(matches!(
            dev.read(h, &mut out, 0, 10, 4095),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_finalize_records_requested_length() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("ver-1", Some(4096)).unwrap();

        write_bytes(&dev, h, &[1u8; 100], 4096, true);
        assert_eq!(dev.length(h).unwrap(), 100);
        write_bytes(&dev, h, &[2u8; 300], 0, false);
        assert_eq!(dev.length(h).unwrap(), 100);

        drop(dev);
        assert_eq!(resume(&temp).length(h).unwrap(), 100);
    }

    #[test]
    fn test_top_of_address_space_is_out_of_range() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let a = dev.open("prim-a", Some(4096)).unwrap();
        let b = dev.open("prim-b", Some(4096)).unwrap();
        let v = dev.open("ver-1", Some(4096)).unwrap();
        write_bytes(&dev, a, &[0x11; B], 0, false);
        let top = u64::MAX - 4095;

        for h in [b, v] {
            let mut buf = IoBuffer::new(B, B).unwrap();
            buf.fill(0, &[0xEE; B]).unwrap();
            assert!(matches!(
                dev.write(h, &mut buf, 0, B, top, true),
                Err(Error::OutOfRange { .. })
            ));
            let mut out = vec![0u8; B];
            assert!(matches!(
                dev.read(h, &mut out, 0, B, top),
                Err(Error::OutOfRange { .. })
            ));
            assert_eq!(dev.length(h).unwrap(), 0);
        }

        assert!(read_bytes(&dev, a, 0, B).iter().all(|&x| x == 0x11));
        assert_eq!(dev.chain(v).unwrap(), vec![v.slot()]);
        assert_eq!(dev.segments().len(), 3);
        assert!(matches!(
            dev.open("prim-huge", Some(u64::MAX)),
            Err(Error::DeviceFull { .. })
        ));
    }

    #[test]
    fn test_growth_index_full_keeps_descriptors() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let v = dev.open("ver-1", Some(4096)).unwrap();
        for i in 1..dev.header().index_length {
            let h = dev.open(&format!("prim-{i}"), Some(4096)).unwrap();
            dev.close(h).unwrap();
        }
        dev.close(v).unwrap();
        let before = dev.segments();

        let data = random(2 * B);
        let mut buf = IoBuffer::new(data.len(), B).unwrap();
        buf.fill(0, &data).unwrap();
        assert!(matches!(
            dev.write(v, &mut buf, 0, data.len(), 0, true),
            Err(Error::IndexFull { slot: 32, capacity: 32 })
        ));
        assert_eq!(dev.segments(), before);
        assert_eq!(dev.chain(v).unwrap(), vec![v.slot()]);
        assert_eq!(dev.length(v).unwrap(), 0);

        drop(dev);
        let dev = resume(&temp);
        assert_eq!(dev.segments(), before);
        assert_eq!(dev.segments()[0].descriptor.next, None);
    }

    #[test]
    fn test_failed_persist_changes_nothing() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-a", None).unwrap();
        write_bytes(&dev, h, &[3u8; B], 0, true);
        dev.close(h).unwrap();
        let free = dev.free_space();

        dev.file.fail_writes_after(0);
        assert!(matches!(dev.open("prim-b", None), Err(Error::Io(_))));
        assert_eq!(dev.find("prim-b"), None);
        assert_eq!(dev.free_space(), free);
        assert!(matches!(dev.remove(h), Err(Error::Io(_))));
        assert_eq!(dev.list_files(), "prim-a\n");

        // the data block lands, the length update does not
        dev.file.fail_writes_after(1);
        let mut buf = IoBuffer::new(B, B).unwrap();
        buf.fill(0, &[4u8; B]).unwrap();
        assert!(matches!(
            dev.write(h, &mut buf, 0, 10, 0, true),
            Err(Error::Io(_))
        ));
        assert_eq!(dev.length(h).unwrap(), B as u64);

        dev.file.fail_writes_after(usize::MAX);
        drop(dev);
        let dev = resume(&temp);
        assert_eq!(dev.list_files(), "prim-a\n");
        assert_eq!(dev.length(h).unwrap(), B as u64);
        assert_eq!(dev.open("prim-b", None).unwrap().slot(), 1);
    }

    #[test]
    fn test_version_read_past_end() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("ver-1", Some(4096)).unwrap();
        let mut out = vec![0u8; 2 * B];
        assert!(matches!(
            dev.read(h, &mut out, 0, 2 * B, 0),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_argument_checks() {
        let temp = scratch(16 * MIB);
        let dev = format(&temp);
        let h = dev.open("prim-a", None).unwrap();

        let mut buf = IoBuffer::new(100, B).unwrap();
        assert!(matches!(
            dev.write(h, &mut buf, 50, 51, 0, false),
            Err(Error::InvalidArgument(_))
        ));
        let mut small = IoBuffer::new(100, 512).unwrap();
        assert!(matches!(
            dev.write(h, &mut small, 0, 10, 0, false),
            Err(Error::InvalidArgument(_))
        ));
        let mut out = [0u8; 10];
        assert!(matches!(
            dev.read(h, &mut out, 5, 6, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.read(LogHandle::new(9), &mut out, 0, 1, 0),
            Err(Error::InvalidHandle(9))
        ));
    }

    #[test]
    fn test_resume_after_reopen() {
        let temp = scratch(16 * MIB);
        let data = random(3 * MIB as usize / 2);
        let (version, removed_next) = {
            let dev = format(&temp);
            let p = dev.open("prim-a", None).unwrap();
            write_bytes(&dev, p, &[7u8; 64], 0, true);
            let v = dev.open("ver-2", Some(4096)).unwrap();
            write_bytes(&dev, v, &data, 0, true);
            let gone = dev.open("sec-x", Some(4096)).unwrap();
            dev.close(gone).unwrap();
            dev.remove(gone).unwrap();
            (v, dev.segments().len())
        };

        let dev = resume(&temp);
        assert_eq!(dev.list_files(), "prim-a\nver-2\n");
        assert_eq!(dev.length(LogHandle::new(0)).unwrap(), 64);
        assert_eq!(dev.length(version).unwrap(), data.len() as u64);
        assert_eq!(read_bytes(&dev, version, 0, data.len()), data);
        assert_eq!(dev.chain(version).unwrap().len(), 2);

        // the deleted slot keeps its place
        let next = dev.open("prim-b", Some(4096)).unwrap();
        assert_eq!(next.slot() as usize, removed_next);
        // reopened files start closed
        dev.remove(LogHandle::new(0)).unwrap();
    }

    #[test]
    fn test_resume_blank_device_formats() {
        let temp = scratch(16 * MIB);
        let dev = resume(&temp);
        assert_eq!(dev.header().index_length, 32);
        assert!(dev.segments().is_empty());
    }

    #[test]
    fn test_existing_requires_signature() {
        let temp = scratch(16 * MIB);
        assert!(matches!(
            LogDevice::bootstrap(temp.path(), BootstrapMode::Existing, EngineConfig::buffered()),
            Err(Error::Corrupt(_))
        ));

        {
            let dev = format(&temp);
            dev.open("prim-a", None).unwrap();
        }
        let dev =
            LogDevice::bootstrap(temp.path(), BootstrapMode::Existing, EngineConfig::buffered())
                .unwrap();
        assert_eq!(dev.find("prim-a"), Some(LogHandle::new(0)));
        assert_eq!(dev.find("prim-b"), None);
        assert_eq!(dev.segments().len(), 1);
    }

    #[test]
    fn test_format_discards_content() {
        let temp = scratch(16 * MIB);
        {
            let dev = format(&temp);
            dev.open("prim-a", None).unwrap();
        }
        let dev = format(&temp);
        assert_eq!(dev.list_files(), "");
    }

    #[test]
    fn test_tampered_header_is_corrupt() {
        let temp = scratch(16 * MIB);
        drop(format(&temp));

        let mut bytes = std::fs::read(temp.path()).unwrap();
        bytes[20] ^= 0xFF;
        std::fs::write(temp.path(), &bytes).unwrap();

        assert!(matches!(
            LogDevice::bootstrap(temp.path(), BootstrapMode::Resume, EngineConfig::buffered()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_tampered_descriptor_is_corrupt() {
        let temp = scratch(16 * MIB);
        let index_start = {
            let dev = format(&temp);
            dev.open("prim-a", None).unwrap();
            dev.header().index_start as usize
        };

        let mut bytes = std::fs::read(temp.path()).unwrap();
        bytes[index_start + 20] ^= 0x01;
        std::fs::write(temp.path(), &bytes).unwrap();

        assert!(matches!(
            LogDevice::bootstrap(temp.path(), BootstrapMode::Resume, EngineConfig::buffered()),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_device_too_small() {
        let temp = scratch(8192);
        assert!(matches!(
            LogDevice::bootstrap(temp.path(), BootstrapMode::Format, EngineConfig::buffered()),
            Err(Error::DeviceTooSmall { .. })
        ));
    }

    #[test]
    fn test_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LogDevice::bootstrap(
                dir.path().join("absent"),
                BootstrapMode::Resume,
                EngineConfig::buffered()
            ),
            Err(Error::DeviceOpenFailed { .. })
        ));
    }

    #[test]
    fn test_concurrent_files() {
        let temp = scratch(64 * MIB);
        let dev = Arc::new(format(&temp));

        let workers: Vec<_> = (0..8)
            .map(|t| {
                let dev = Arc::clone(&dev);
                std::thread::spawn(move || {
                    let h = dev.open(&format!("ver-{t}"), Some(4096)).unwrap();
                    let data = vec![t as u8; 3 * B + 17];
                    for round in 0..4u64 {
                        let pos = round * data.len() as u64;
                        write_bytes(&dev, h, &data, pos, true);
                    }
                    (h, data)
                })
            })
            .collect();

        for worker in workers {
            let (h, data) = worker.join().unwrap();
            let total = 4 * data.len();
            // the length records the last finalizing write only
            assert_eq!(dev.length(h).unwrap(), data.len() as u64);
            let back = read_bytes(&dev, h, 0, total);
            assert!(back.iter().all(|&b| b == data[0]));
        }
        assert_eq!(dev.list_files().lines().count(), 8);
        assert_eq!(dev.stats().writes.load(Ordering::Relaxed), 32);
    }
}
