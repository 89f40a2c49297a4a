//! # Store
//!
//! An embedded record store mapping stable integer identifiers (recids)
//! to opaque byte payloads, persisted across two files:
//!
//! ```text
//! <base>      index file: header, free-pool heads, one 8-byte slot per recid
//! <base>.p    phys file:  record payloads and long-stack pages
//! ```
//!
//! ## Index file layout
//!
//! Each slot is 8 bytes, so slot `n` lives at byte offset `n * 8`:
//!
//! ```text
//! slot 0          magic word
//! slot 1          allocated index file length in bytes
//! slot 2          allocated phys file length in bytes
//! slot 3          bytes of tracked free physical space
//! slots 4..14     reserved
//! slot 15         long-stack head: freed recids
//! slots 16..4111  long-stack heads: free extents, one per 16-byte size class
//! slot 4112       recid 0 (reserved, never handed out)
//! slot 4113..     user records, recid r at slot 4112 + r
//! ```
//!
//! A user slot holds a packed physical pointer ([`crate::pointer`]), or
//! zero when the recid is empty. The phys file starts with the same
//! magic word; payload allocation begins at offset 16.
//!
//! ## Concurrency
//!
//! Record operations take one of 16 striped read-write locks chosen by a
//! hash of the recid. Allocator state (the three size counters, every
//! long-stack head and page, both free pools) sits behind a single
//! structural mutex; record operations hold it only for the few slot
//! reads and writes an allocation needs, never while moving payload
//! bytes. The ordering is fixed: a recid lock may be held when the
//! structural lock is taken, never the reverse.
//!
//! `close` and `compact` take `&mut self`, so exclusive access is
//! enforced at compile time rather than by collecting every lock.
//!
//! ## Durability
//!
//! The store is durable but not transactional: `commit` persists the
//! header counters and syncs both volumes, and that is the only
//! durability point. There is no journal, no rollback, and no crash
//! recovery; a process killed between mutations and `commit` may leave
//! the files inconsistent.

pub(crate) mod alloc;
mod header;
pub(crate) mod longstack;
mod records;

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use crate::pointer::MAX_REC_SIZE;
use crate::scratch::ScratchPool;
use crate::volume::{phys_file_path, FileVolumeFactory, Volume, VolumeFactory};

use alloc::{round_to_16, size_to_bucket_slot, AllocState, SpaceManager};
use header::IndexHeader;
use longstack::long_stack_entries;

/// Magic word at offset 0 of both files.
pub const STORE_MAGIC: u64 = 0x7D54_B70D_34A1_FA5A;

pub(crate) const IO_INDEX_SIZE: u64 = 8;
pub(crate) const IO_PHYS_SIZE: u64 = 16;
pub(crate) const IO_FREE_SIZE: u64 = 24;

/// Head slot of the freed-recid long stack.
pub(crate) const IO_FREE_RECID: u64 = 15 * 8;

/// Number of free-extent size classes (16-byte granularity up to the
/// maximal extent size).
pub(crate) const PHYS_FREE_SLOTS_COUNT: u64 = 4096;

/// Byte offset of the first recid slot.
pub(crate) const IO_USER_START: u64 = IO_FREE_RECID + PHYS_FREE_SLOTS_COUNT * 8 + 8;

pub(crate) const LONG_STACK_PREF_COUNT: u64 = 204;

/// Allocation size of a long-stack page: an 8-byte header plus 204
/// 6-byte value slots.
pub(crate) const LONG_STACK_PREF_SIZE: u64 = 8 + LONG_STACK_PREF_COUNT * 6;

/// Number of striped recid locks. Must be a power of two.
const RECID_LOCK_COUNT: usize = 16;

pub(crate) fn io_recid_for(recid: u64) -> u64 {
    IO_USER_START + recid * 8
}

fn recid_lock_slot(recid: u64) -> usize {
    // Fibonacci hashing spreads sequential recids across the stripes
    let mut h = recid.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h ^= h >> 32;
    h as usize & (RECID_LOCK_COUNT - 1)
}

/// Store construction parameters.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub read_only: bool,
    /// Remove both files when the store is closed.
    pub delete_files_after_close: bool,
    /// 0 disables free-space accounting entirely, 1..=2 track freed
    /// space without reusing it, 3..=5 track and reuse.
    pub space_reclaim_mode: u8,
    /// Skip the volume sync on `commit` (header slots are still
    /// written).
    pub sync_on_commit_disabled: bool,
    /// Hard cap on the phys file length in bytes, 0 = unlimited.
    pub size_limit: u64,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            read_only: false,
            delete_files_after_close: false,
            space_reclaim_mode: 5,
            sync_on_commit_disabled: false,
            size_limit: 0,
        }
    }
}

pub struct Store {
    index: Option<Box<dyn Volume>>,
    phys: Option<Box<dyn Volume>>,
    alloc: Mutex<AllocState>,
    locks: [RwLock<()>; RECID_LOCK_COUNT],
    scratch: ScratchPool,
    read_only: bool,
    delete_files_after_close: bool,
    sync_on_commit_disabled: bool,
    reclaim_track: bool,
    reclaim_reuse: bool,
    size_limit: u64,
}

impl Store {
    /// Opens a store over the factory's volume pair, creating the
    /// on-disk structure when the index volume is empty.
    pub fn open(factory: &dyn VolumeFactory, options: StoreOptions) -> Result<Store> {
        ensure!(
            options.space_reclaim_mode <= 5,
            "space reclaim mode out of range: {}",
            options.space_reclaim_mode
        );

        let index = factory.create_index_volume()?;
        let phys = factory.create_phys_volume()?;

        let state = if index.is_empty() {
            ensure!(
                !options.read_only,
                "cannot create a new store in read-only mode"
            );
            let state = create_structure(&*index, &*phys)?;
            debug!(index_size = state.index_size, "created store structure");
            state
        } else {
            let state = open_existing(&*index, &*phys)?;
            debug!(
                index_size = state.index_size,
                phys_size = state.phys_size,
                free_size = state.free_size,
                "opened existing store"
            );
            state
        };

        Ok(Store {
            index: Some(index),
            phys: Some(phys),
            alloc: Mutex::new(state),
            locks: Default::default(),
            scratch: ScratchPool::new(),
            read_only: options.read_only,
            delete_files_after_close: options.delete_files_after_close,
            sync_on_commit_disabled: options.sync_on_commit_disabled,
            reclaim_track: options.space_reclaim_mode > 0,
            reclaim_reuse: options.space_reclaim_mode > 2,
            size_limit: options.size_limit,
        })
    }

    pub(crate) fn index(&self) -> Result<&dyn Volume> {
        self.index.as_deref().ok_or_else(|| eyre!("store is closed"))
    }

    pub(crate) fn phys(&self) -> Result<&dyn Volume> {
        self.phys.as_deref().ok_or_else(|| eyre!("store is closed"))
    }

    pub(crate) fn lock_for(&self, recid: u64) -> &RwLock<()> {
        &self.locks[recid_lock_slot(recid)]
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        ensure!(!self.read_only, "store is read-only");
        Ok(())
    }

    pub(crate) fn space_manager<'a>(
        &'a self,
        state: &'a mut AllocState,
    ) -> Result<SpaceManager<'a>> {
        Ok(SpaceManager {
            index: self.index()?,
            phys: self.phys()?,
            state,
            track: self.reclaim_track,
            reuse: self.reclaim_reuse,
            size_limit: self.size_limit,
        })
    }

    /// Persists the header counters; syncs both volumes unless disabled.
    /// This is the store's only durability point.
    pub fn commit(&self) -> Result<()> {
        let index = self.index()?;
        if !self.read_only {
            let state = self.alloc.lock();
            write_size_slots(index, &state)?;
            debug!(
                index_size = state.index_size,
                phys_size = state.phys_size,
                free_size = state.free_size,
                "commit"
            );
        }
        if !self.sync_on_commit_disabled {
            index.sync()?;
            self.phys()?.sync()?;
        }
        Ok(())
    }

    /// Unsupported: this store keeps no journal.
    pub fn rollback(&self) -> Result<()> {
        bail!("rollback not supported: store has no write-ahead journal");
    }

    pub fn can_rollback(&self) -> bool {
        false
    }

    /// There is no cache at this layer.
    pub fn clear_cache(&self) {}

    /// Writes headers, syncs and releases both volumes. Further record
    /// operations fail. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        let (Some(index), Some(phys)) = (self.index.take(), self.phys.take()) else {
            return Ok(());
        };

        if !self.read_only {
            let state = self.alloc.lock();
            write_size_slots(&*index, &state)?;
        }
        index.sync()?;
        phys.sync()?;

        let index_path = index.path().map(Path::to_path_buf);
        let phys_path = phys.path().map(Path::to_path_buf);
        drop(index);
        drop(phys);

        if self.delete_files_after_close {
            for path in [index_path, phys_path].into_iter().flatten() {
                fs::remove_file(&path)
                    .wrap_err_with(|| format!("failed to delete '{}'", path.display()))?;
            }
        }
        debug!("store closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.index.is_none()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Highest recid handed out so far (0 when none).
    pub fn max_recid(&self) -> Result<u64> {
        self.index()?;
        let state = self.alloc.lock();
        Ok((state.index_size - IO_USER_START) / 8 - 1)
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Current allocated length of the phys file.
    pub fn curr_size(&self) -> Result<u64> {
        self.index()?;
        Ok(self.alloc.lock().phys_size)
    }

    /// Bytes of freed physical space currently tracked by the pools.
    pub fn free_size(&self) -> Result<u64> {
        self.index()?;
        Ok(self.alloc.lock().free_size)
    }

    /// Recids waiting for reuse, most recently freed first. Does not
    /// modify the pool.
    pub fn free_recids(&self) -> Result<Vec<u64>> {
        let _state = self.alloc.lock();
        let entries = long_stack_entries(self.index()?, self.phys()?, IO_FREE_RECID)?;
        Ok(entries
            .into_iter()
            .map(|io_recid| (io_recid - IO_USER_START) / 8)
            .collect())
    }

    /// Human-readable usage report: size counters plus the occupancy of
    /// every non-empty free-extent bucket.
    pub fn statistics(&self) -> Result<String> {
        let state = self.alloc.lock();
        let index = self.index()?;
        let phys = self.phys()?;

        let mut out = String::new();
        let _ = writeln!(out, "record store");
        let _ = writeln!(out, "index_size={}", state.index_size);
        let _ = writeln!(out, "phys_size={}", state.phys_size);
        let _ = writeln!(out, "free_size={}", state.free_size);

        let free_recids = long_stack_entries(index, phys, IO_FREE_RECID)?.len();
        let _ = writeln!(out, "free_recids={}", free_recids);

        let mut total = 0u64;
        let mut size = 16u32;
        while size <= MAX_REC_SIZE + 1 {
            let count = long_stack_entries(index, phys, size_to_bucket_slot(size))?.len() as u64;
            if count > 0 {
                let bytes = count * size as u64;
                total += bytes;
                let _ = writeln!(out, "free extents (size<={}): {} = {} bytes", size, count, bytes);
            }
            size += 16;
        }
        let _ = writeln!(out, "free extent bytes total={}", total);
        Ok(out)
    }

    /// Rewrites both files densely, dropping every freed extent, while
    /// preserving recids and the freed-recid pool. Only file-backed
    /// stores can be compacted.
    pub fn compact(&mut self) -> Result<()> {
        self.check_writable()?;
        let index_path = self
            .index()?
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| eyre!("compact not supported for memory-backed stores"))?;
        let phys_path = self
            .phys()?
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| eyre!("compact not supported for memory-backed stores"))?;

        let phys_size_before = self.curr_size()?;

        {
            let state = self.alloc.lock();
            write_size_slots(self.index()?, &state)?;
        }

        let compact_base = path_with_suffix(&index_path, ".compact");
        let compact_phys = phys_file_path(&compact_base);
        remove_stale(&compact_base)?;
        remove_stale(&compact_phys)?;

        let factory = FileVolumeFactory::new(&compact_base);
        let mut target = Store::open(&factory, StoreOptions::default())?;

        let (index_size, phys_size_after) = {
            let mut state = self.alloc.lock();
            let index_size = state.index_size;
            let mut source = self.space_manager(&mut state)?;

            let mut target_state = target.alloc.lock();
            let mut dest = target.space_manager(&mut target_state)?;

            // carry the freed-recid pool over; the pop/push round trip
            // reverses its order
            loop {
                let io_recid = source.long_stack_pop(IO_FREE_RECID)?;
                if io_recid == 0 {
                    break;
                }
                dest.long_stack_push(IO_FREE_RECID, io_recid)?;
            }

            dest.state.index_size = index_size;
            target.index()?.ensure_available(index_size)?;

            let mut io_recid = IO_USER_START;
            while io_recid < index_size {
                match self.read_payload(io_recid)? {
                    None => target.index()?.write_u64(io_recid, 0)?,
                    Some(payload) => {
                        let pps = dest.phys_allocate(payload.len(), true)?;
                        target.write_record(io_recid, &pps, &payload)?;
                    }
                }
                io_recid += 8;
            }

            (index_size, dest.state.phys_size)
        };

        target.close()?;

        // swap the compacted files into place, keeping timestamped
        // backups until the swap is complete
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .wrap_err("system clock before epoch")?
            .as_millis();
        let index_backup = path_with_suffix(&index_path, &format!("_{ts}_orig"));
        let phys_backup = path_with_suffix(&phys_path, &format!("_{ts}_orig"));

        self.index = None;
        self.phys = None;

        fs::rename(&index_path, &index_backup).wrap_err("failed to move index file aside")?;
        fs::rename(&phys_path, &phys_backup).wrap_err("failed to move phys file aside")?;
        fs::rename(&compact_base, &index_path).wrap_err("failed to install compacted index")?;
        fs::rename(&compact_phys, &phys_path).wrap_err("failed to install compacted phys")?;
        fs::remove_file(&index_backup).wrap_err("failed to delete index backup")?;
        fs::remove_file(&phys_backup).wrap_err("failed to delete phys backup")?;

        let factory = FileVolumeFactory::new(&index_path);
        self.index = Some(factory.create_index_volume()?);
        self.phys = Some(factory.create_phys_volume()?);

        {
            let mut state = self.alloc.lock();
            state.index_size = index_size;
            state.phys_size = phys_size_after;
            // free pools were not migrated, nothing is tracked anymore
            state.free_size = 0;
            write_size_slots(self.index()?, &state)?;
        }

        info!(
            phys_size_before,
            phys_size_after,
            "compaction complete"
        );
        Ok(())
    }
}

fn write_size_slots(index: &dyn Volume, state: &AllocState) -> Result<()> {
    index.write_u64(IO_INDEX_SIZE, state.index_size)?;
    index.write_u64(IO_PHYS_SIZE, state.phys_size)?;
    index.write_u64(IO_FREE_SIZE, state.free_size)?;
    Ok(())
}

fn create_structure(index: &dyn Volume, phys: &dyn Volume) -> Result<AllocState> {
    // header region, pool heads, and the reserved recid-0 slot; grown
    // space reads as zeroes so only the header needs explicit writes
    let index_size = IO_USER_START + 8;
    index.ensure_available(index_size)?;
    let header = IndexHeader::new(index_size, 16, 0);
    index.write_bytes(0, header.as_bytes())?;

    phys.ensure_available(16)?;
    phys.write_u64(0, STORE_MAGIC)?;

    Ok(AllocState {
        index_size,
        phys_size: 16,
        free_size: 0,
    })
}

fn open_existing(index: &dyn Volume, phys: &dyn Volume) -> Result<AllocState> {
    let mut buf = [0u8; 120];
    index
        .read_bytes(0, &mut buf)
        .wrap_err("index file too short for a store header")?;
    let header = IndexHeader::from_bytes(&buf)?;

    ensure!(
        phys.read_u64(0)? == STORE_MAGIC,
        "storage has invalid header: phys magic mismatch"
    );

    let state = AllocState {
        index_size: header.index_size(),
        phys_size: header.phys_size(),
        free_size: header.free_size(),
    };
    ensure!(
        state.index_size >= IO_USER_START + 8 && state.index_size % 8 == 0,
        "corrupt index size: {}",
        state.index_size
    );
    ensure!(
        state.phys_size >= 16 && state.phys_size == round_to_16(state.phys_size),
        "corrupt phys size: {}",
        state.phys_size
    );
    Ok(state)
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_stale(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).wrap_err_with(|| format!("failed to remove stale '{}'", path.display())),
    }
}
