//! Platform-specific raw device I/O
//!
//! Provides durable, cache-bypassing access to the log partition:
//! - every device is opened `O_SYNC`, so a returned write is persisted
//! - Linux: `O_DIRECT` when requested
//! - macOS: `F_NOCACHE` when requested
//!
//! All transfers are positional (`pread`/`pwrite`) so the handle can be
//! shared between threads without a seek lock.

use rawlog_common::{Error, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;

/// Raw device handle with synchronous, positional I/O
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    block_size: u64,
    #[cfg(test)]
    writes_left: std::sync::atomic::AtomicUsize,
}

impl RawFile {
    /// Open an existing device or file for raw I/O
    ///
    /// `block_size` is the alignment every offset and length must honour.
    pub fn open(path: impl AsRef<Path>, block_size: u32, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true);

        #[cfg(target_os = "linux")]
        {
            let mut flags = libc::O_SYNC;
            if direct_io {
                flags |= libc::O_DIRECT;
            }
            options.custom_flags(flags);
        }

        #[cfg(not(target_os = "linux"))]
        {
            options.custom_flags(libc::O_SYNC);
        }

        let file = options.open(&path).map_err(|source| Error::DeviceOpenFailed {
            path: path_str.clone(),
            source,
        })?;

        #[cfg(target_os = "macos")]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fcntl on a descriptor we own, no pointers involved.
            if direct_io && unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
                return Err(Error::DeviceOpenFailed {
                    path: path_str,
                    source: std::io::Error::last_os_error(),
                });
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        let _ = direct_io;

        let size = if Self::is_block_device(&path) {
            Self::get_block_device_size(&file)?
        } else {
            file.metadata()?.len()
        };

        Ok(Self {
            file,
            path: path_str,
            size,
            block_size: u64::from(block_size),
            #[cfg(test)]
            writes_left: std::sync::atomic::AtomicUsize::new(usize::MAX),
        })
    }

    /// Check if path is a block device
    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false)
    }

    /// Get block device size using ioctl
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKGETSIZE64 ioctl
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes exactly one u64 through the pointer.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(size)
    }

    /// Get block device size (non-Linux fallback)
    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        let size = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(0))?;
        Ok(size)
    }

    /// Raw device size in bytes, before any block alignment
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Alignment enforced on offsets and lengths
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Re-target the alignment after reading the block size from the header
    pub(crate) fn set_block_size(&mut self, block_size: u32) {
        self.block_size = u64::from(block_size);
    }

    /// Fill `buf` from `offset`
    ///
    /// Short reads are continued until the buffer is full; reaching the end
    /// of the device first is an error.
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!(
                            "read at {} on {} ended after {} of {} bytes",
                            offset,
                            self.path,
                            done,
                            buf.len()
                        ),
                    )));
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Write all of `buf` at `offset`
    ///
    /// Short writes are continued with the remaining length and offset.
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        #[cfg(test)]
        self.take_write()?;

        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(Error::Io(std::io::Error::new(
                        ErrorKind::WriteZero,
                        format!("write at {} on {} made no progress", offset, self.path),
                    )));
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Let the next `writes` writes through and fail every later one
    #[cfg(test)]
    pub(crate) fn fail_writes_after(&self, writes: usize) {
        self.writes_left.store(writes, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_write(&self) -> Result<()> {
        use std::sync::atomic::Ordering;
        self.writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(drop)
            .map_err(|_| Error::Io(std::io::Error::other("write refused")))
    }

    /// Check alignment requirements
    fn check_alignment(&self, offset: u64, size: usize) -> Result<()> {
        if offset % self.block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "offset {} is not aligned to {}",
                offset, self.block_size
            )));
        }
        if size as u64 % self.block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "size {} is not aligned to {}",
                size, self.block_size
            )));
        }
        Ok(())
    }
}

/// Zeroed, block-aligned heap buffer for direct I/O
///
/// With `O_DIRECT` the memory address must be aligned as well as the device
/// offset, so the allocation is made with an explicit [`Layout`].
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `size` bytes (rounded up to `alignment`), or `None` when the
    /// allocator refuses
    pub fn try_new(size: usize, alignment: usize) -> Option<Self> {
        let aligned_size = size.div_ceil(alignment).max(1) * alignment;
        let layout = Layout::from_size_align(aligned_size, alignment).ok()?;
        // SAFETY: layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    /// Allocate `size` bytes rounded up to `alignment`
    ///
    /// # Panics
    ///
    /// Panics if the allocation fails or the alignment is not a power of two.
    pub fn new(size: usize, alignment: usize) -> Self {
        Self::try_new(size, alignment).expect("failed to allocate aligned buffer")
    }

    /// Get the buffer size
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Check if buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy data into the buffer (pads with zeros if source is smaller)
    pub fn copy_from(&mut self, src: &[u8]) {
        let copy_len = src.len().min(self.len());
        self[..copy_len].copy_from_slice(&src[..copy_len]);
        self[copy_len..].fill(0);
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid and uniquely borrowed through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in try_new with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}
