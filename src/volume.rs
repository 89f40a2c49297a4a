//! # Volumes
//!
//! A `Volume` is a growable random-access byte buffer backing one half of
//! a store. Every store owns two of them: the *index* volume (fixed
//! header plus one 8-byte slot per recid) and the *phys* volume (record
//! payloads and long-stack pages).
//!
//! ## Access model
//!
//! All methods take `&self`; each implementation supplies its own
//! interior mutability so that concurrent record operations can touch the
//! same volume without an external lock. The volume lock is a leaf lock:
//! it is acquired and released inside a single read or write call and is
//! never held across calls into other store machinery.
//!
//! ## Growth
//!
//! `ensure_available(len)` grows the volume so that at least `len` bytes
//! are addressable. Growth is zero-filling and never shrinks; callers
//! rely on freshly grown regions reading back as zeroes (an index slot of
//! zero means "empty"). The file-backed volume grows in 64 KiB steps to
//! keep remap traffic down, so its physical length may exceed the
//! logical sizes the store records in its header.
//!
//! ## Implementations
//!
//! - [`FileVolume`]: memory-mapped file via `memmap2`. Growing flushes
//!   the old mapping, extends the file with `set_len`, and remaps. An
//!   empty file carries no mapping until the first grow.
//! - [`MemVolume`]: a plain `Vec<u8>`, used by tests and throwaway
//!   stores. Memory-backed stores cannot be compacted since there is no
//!   file to swap.
//!
//! ## Encoding
//!
//! Multi-byte reads and writes are little-endian. The 6-byte accessors
//! carry the 48-bit values used by long-stack pages.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;

/// Segmentation granularity of a volume. A single physical extent must
/// not straddle a boundary between two `VOLUME_BUF_SIZE` regions, so the
/// allocator skips to the next boundary when an extent would cross one.
pub const VOLUME_BUF_SIZE: u64 = 1 << 30;

/// Step size for growing file-backed volumes.
const FILE_GROW_CHUNK: u64 = 64 * 1024;

pub trait Volume: Send + Sync {
    fn read_u64(&self, offset: u64) -> Result<u64>;
    fn write_u64(&self, offset: u64, value: u64) -> Result<()>;

    /// Reads the 6-byte little-endian value at `offset`.
    fn read_u48(&self, offset: u64) -> Result<u64>;

    /// Writes the low 48 bits of `value` at `offset`.
    fn write_u48(&self, offset: u64, value: u64) -> Result<()>;

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Grows the volume so at least `len` bytes are addressable. New
    /// space reads as zeroes. Never shrinks.
    fn ensure_available(&self, len: u64) -> Result<()>;

    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sync(&self) -> Result<()>;

    /// Backing file path, `None` for memory volumes.
    fn path(&self) -> Option<&Path>;
}

/// Creates the index/phys volume pair for a store. The factory fixes the
/// naming convention: the index volume lives at `<base>` and the phys
/// volume at `<base>.p`.
pub trait VolumeFactory {
    fn create_index_volume(&self) -> Result<Box<dyn Volume>>;
    fn create_phys_volume(&self) -> Result<Box<dyn Volume>>;
}

/// File name extension of the physical file, appended to the base path.
pub const PHYS_FILE_EXT: &str = ".p";

pub fn phys_file_path(base: &Path) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(PHYS_FILE_EXT);
    PathBuf::from(name)
}

// ---------------------------------------------------------------------
// File-backed volume
// ---------------------------------------------------------------------

struct FileVolumeInner {
    file: File,
    mmap: Option<MmapMut>,
    len: u64,
}

pub struct FileVolume {
    path: PathBuf,
    inner: RwLock<FileVolumeInner>,
}

impl FileVolume {
    /// Opens the file at `path`, creating it empty if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileVolume> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open volume file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat volume file '{}'", path.display()))?
            .len();

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files invalidate the mapping. This is safe because:
        // 1. Store files are owned by a single process for their lifetime
        // 2. The mapping lives inside FileVolumeInner and is replaced only
        //    under the inner write lock, never observed mid-swap
        // 3. Every access bounds-checks against the tracked length
        let mmap = if len > 0 {
            Some(unsafe {
                MmapMut::map_mut(&file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
            })
        } else {
            None
        };

        Ok(FileVolume {
            path,
            inner: RwLock::new(FileVolumeInner { file, mmap, len }),
        })
    }

    fn with_slice<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if len == 0 {
            return Ok(f(&[]));
        }
        let inner = self.inner.read();
        ensure!(
            offset + len as u64 <= inner.len,
            "read of {} bytes at {} beyond end of volume '{}' (len {})",
            len,
            offset,
            self.path.display(),
            inner.len
        );
        let mmap = inner
            .mmap
            .as_ref()
            .ok_or_else(|| eyre::eyre!("volume '{}' has no mapping", self.path.display()))?;
        Ok(f(&mmap[offset as usize..offset as usize + len]))
    }

    fn with_slice_mut<R>(
        &self,
        offset: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        if len == 0 {
            return Ok(f(&mut []));
        }
        let mut inner = self.inner.write();
        ensure!(
            offset + len as u64 <= inner.len,
            "write of {} bytes at {} beyond end of volume '{}' (len {})",
            len,
            offset,
            self.path.display(),
            inner.len
        );
        let mmap = inner
            .mmap
            .as_mut()
            .ok_or_else(|| eyre::eyre!("volume '{}' has no mapping", self.path.display()))?;
        Ok(f(&mut mmap[offset as usize..offset as usize + len]))
    }
}

impl Volume for FileVolume {
    fn read_u64(&self, offset: u64) -> Result<u64> {
        self.with_slice(offset, 8, |s| u64::from_le_bytes(s.try_into().unwrap()))
    }

    fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.with_slice_mut(offset, 8, |s| s.copy_from_slice(&value.to_le_bytes()))
    }

    fn read_u48(&self, offset: u64) -> Result<u64> {
        self.with_slice(offset, 6, |s| {
            let mut b = [0u8; 8];
            b[..6].copy_from_slice(s);
            u64::from_le_bytes(b)
        })
    }

    fn write_u48(&self, offset: u64, value: u64) -> Result<()> {
        self.with_slice_mut(offset, 6, |s| {
            s.copy_from_slice(&value.to_le_bytes()[..6]);
        })
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_slice(offset, buf.len(), |s| buf.copy_from_slice(s))
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_slice_mut(offset, data.len(), |s| s.copy_from_slice(data))
    }

    fn ensure_available(&self, len: u64) -> Result<()> {
        if len <= self.inner.read().len {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if len <= inner.len {
            return Ok(());
        }

        if let Some(mmap) = inner.mmap.as_ref() {
            mmap.flush_async().wrap_err("failed to flush mmap before grow")?;
        }

        let new_len = len.div_ceil(FILE_GROW_CHUNK) * FILE_GROW_CHUNK;
        inner
            .file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to extend '{}' to {} bytes", self.path.display(), new_len))?;

        // SAFETY: the old mapping becomes invalid once replaced. This is
        // safe because the swap happens under the inner write lock, so no
        // reader holds a slice into the old mapping, and the file was
        // extended to new_len before remapping.
        inner.mmap = Some(unsafe {
            MmapMut::map_mut(&inner.file)
                .wrap_err_with(|| format!("failed to remap '{}' after grow", self.path.display()))?
        });
        inner.len = new_len;

        Ok(())
    }

    fn len(&self) -> u64 {
        self.inner.read().len
    }

    fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        if let Some(mmap) = inner.mmap.as_ref() {
            mmap.flush()
                .wrap_err_with(|| format!("failed to sync volume '{}'", self.path.display()))?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

pub struct FileVolumeFactory {
    base: PathBuf,
}

impl FileVolumeFactory {
    pub fn new<P: AsRef<Path>>(base: P) -> FileVolumeFactory {
        FileVolumeFactory {
            base: base.as_ref().to_path_buf(),
        }
    }
}

impl VolumeFactory for FileVolumeFactory {
    fn create_index_volume(&self) -> Result<Box<dyn Volume>> {
        Ok(Box::new(FileVolume::open(&self.base)?))
    }

    fn create_phys_volume(&self) -> Result<Box<dyn Volume>> {
        Ok(Box::new(FileVolume::open(phys_file_path(&self.base))?))
    }
}

// ---------------------------------------------------------------------
// Memory-backed volume
// ---------------------------------------------------------------------

#[derive(Default)]
pub struct MemVolume {
    data: RwLock<Vec<u8>>,
}

impl MemVolume {
    pub fn new() -> MemVolume {
        MemVolume::default()
    }

    fn with_slice<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let data = self.data.read();
        ensure!(
            offset + len as u64 <= data.len() as u64,
            "read of {} bytes at {} beyond end of memory volume (len {})",
            len,
            offset,
            data.len()
        );
        Ok(f(&data[offset as usize..offset as usize + len]))
    }

    fn with_slice_mut<R>(
        &self,
        offset: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let mut data = self.data.write();
        ensure!(
            offset + len as u64 <= data.len() as u64,
            "write of {} bytes at {} beyond end of memory volume (len {})",
            len,
            offset,
            data.len()
        );
        Ok(f(&mut data[offset as usize..offset as usize + len]))
    }
}

impl Volume for MemVolume {
    fn read_u64(&self, offset: u64) -> Result<u64> {
        self.with_slice(offset, 8, |s| u64::from_le_bytes(s.try_into().unwrap()))
    }

    fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.with_slice_mut(offset, 8, |s| s.copy_from_slice(&value.to_le_bytes()))
    }

    fn read_u48(&self, offset: u64) -> Result<u64> {
        self.with_slice(offset, 6, |s| {
            let mut b = [0u8; 8];
            b[..6].copy_from_slice(s);
            u64::from_le_bytes(b)
        })
    }

    fn write_u48(&self, offset: u64, value: u64) -> Result<()> {
        self.with_slice_mut(offset, 6, |s| {
            s.copy_from_slice(&value.to_le_bytes()[..6]);
        })
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_slice(offset, buf.len(), |s| buf.copy_from_slice(s))
    }

    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_slice_mut(offset, data.len(), |s| s.copy_from_slice(data))
    }

    fn ensure_available(&self, len: u64) -> Result<()> {
        let mut data = self.data.write();
        if len as usize > data.len() {
            data.resize(len as usize, 0);
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        None
    }
}

/// Builds a pair of in-memory volumes. Each call to the factory methods
/// returns a fresh, independent volume, so a factory instance describes
/// exactly one store.
#[derive(Default)]
pub struct MemVolumeFactory;

impl VolumeFactory for MemVolumeFactory {
    fn create_index_volume(&self) -> Result<Box<dyn Volume>> {
        Ok(Box::new(MemVolume::new()))
    }

    fn create_phys_volume(&self) -> Result<Box<dyn Volume>> {
        Ok(Box::new(MemVolume::new()))
    }
}
