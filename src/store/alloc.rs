//! # Free Space Management and Physical Allocation
//!
//! Two pools recycle space freed by deletes and updates:
//!
//! - the *free-recid* pool, one long stack holding index-slot offsets of
//!   deleted records, popped LIFO by the next `put`;
//! - the *free-extent* pools, one long stack per 16-byte size class
//!   (4096 buckets covering extents of 1..=65536 bytes), holding the
//!   physical offsets of freed extents.
//!
//! When a pool is empty, allocation falls back to appending: the recid
//! allocator extends the index file by one slot, and the extent
//! allocator bumps the physical tail (skipping ahead when an extent
//! would straddle a volume segment boundary, and keeping the tail
//! 16-byte aligned).
//!
//! `phys_allocate` sits on top: requests smaller than an extent get one
//! extent, larger requests get a chain where every extent but the last
//! donates its first 8 bytes to the next-extent pointer.
//!
//! All of this state is guarded by the store's structural lock: the
//! `SpaceManager` borrows the allocator counters out of the lock guard,
//! so constructing one is only possible while the lock is held.

use eyre::{bail, ensure, Result};
use smallvec::{smallvec, SmallVec};

use crate::pointer::{PhysPtr, MAX_REC_SIZE};
use crate::volume::{Volume, VOLUME_BUF_SIZE};

use super::IO_FREE_RECID;

/// The persisted size counters. Lives inside the structural mutex;
/// holding a `&mut AllocState` *is* holding the structural lock.
#[derive(Debug)]
pub(crate) struct AllocState {
    /// Allocated length of the index file in bytes.
    pub index_size: u64,
    /// Allocated length of the phys file in bytes.
    pub phys_size: u64,
    /// Bytes of freed physical space currently tracked by the pools.
    pub free_size: u64,
}

/// A borrowed view over everything the allocators may touch.
pub(crate) struct SpaceManager<'a> {
    pub index: &'a dyn Volume,
    pub phys: &'a dyn Volume,
    pub state: &'a mut AllocState,
    /// Freed space is recorded in the pools.
    pub track: bool,
    /// Recorded free space is reused by later allocations.
    pub reuse: bool,
    /// Hard cap on the phys file length, 0 = unlimited.
    pub size_limit: u64,
}

pub(crate) fn round_to_16(value: u64) -> u64 {
    (value + 15) & !15
}

/// Head-slot offset of the free-extent stack for `size`-byte extents.
pub(crate) fn size_to_bucket_slot(size: u32) -> u64 {
    debug_assert!(size >= 1 && size <= MAX_REC_SIZE + 1);
    IO_FREE_RECID + 8 + ((size as u64 - 1) / 16) * 8
}

impl SpaceManager<'_> {
    /// Records a deleted recid slot for reuse.
    pub fn free_io_recid_put(&mut self, io_recid: u64) -> Result<()> {
        if self.track {
            self.long_stack_push(IO_FREE_RECID, io_recid)?;
        }
        Ok(())
    }

    /// Produces an index slot for a new record: a recycled one when the
    /// free-recid stack has any, otherwise a freshly appended slot.
    pub fn free_io_recid_take(&mut self, ensure_avail: bool) -> Result<u64> {
        if self.track {
            let io_recid = self.long_stack_pop(IO_FREE_RECID)?;
            if io_recid != 0 {
                return Ok(io_recid);
            }
        }
        self.state.index_size += 8;
        if ensure_avail {
            self.index.ensure_available(self.state.index_size)?;
        }
        Ok(self.state.index_size - 8)
    }

    /// Returns a freed extent to its size-class pool.
    pub fn free_phys_put(&mut self, pp: PhysPtr) -> Result<()> {
        let size = pp.size();
        if !self.track || size == 0 {
            return Ok(());
        }
        self.state.free_size += round_to_16(size as u64);
        self.long_stack_push(size_to_bucket_slot(size), pp.offset())
    }

    /// Produces the offset of a `size`-byte extent: recycled from the
    /// matching pool when reuse is enabled, otherwise appended at the
    /// physical tail.
    pub fn free_phys_take(&mut self, size: u32, ensure_avail: bool) -> Result<u64> {
        ensure!(
            size >= 1 && size <= MAX_REC_SIZE,
            "invalid extent size: {}",
            size
        );

        if self.reuse {
            let offset = self.long_stack_pop(size_to_bucket_slot(size))?;
            if offset != 0 {
                self.state.free_size -= round_to_16(size as u64);
                return Ok(offset);
            }
        }

        // an extent must not straddle a volume segment boundary
        if self.state.phys_size % VOLUME_BUF_SIZE + size as u64 > VOLUME_BUF_SIZE {
            self.state.phys_size += VOLUME_BUF_SIZE - self.state.phys_size % VOLUME_BUF_SIZE;
        }

        let offset = self.state.phys_size;
        let new_size = round_to_16(self.state.phys_size + size as u64);
        if self.size_limit != 0 && new_size > self.size_limit {
            bail!(
                "store size limit reached: {} > {}",
                new_size,
                self.size_limit
            );
        }
        self.state.phys_size = new_size;
        if ensure_avail {
            self.phys.ensure_available(self.state.phys_size)?;
        }
        Ok(offset)
    }

    /// Allocates the extents for a `size`-byte payload. A single extent
    /// for small payloads; otherwise a chain where every extent except
    /// the last starts with an 8-byte pointer to its successor, so each
    /// carries `size - 8` payload bytes.
    pub fn phys_allocate(
        &mut self,
        size: usize,
        ensure_avail: bool,
    ) -> Result<SmallVec<[PhysPtr; 2]>> {
        if size == 0 {
            return Ok(smallvec![PhysPtr::NULL]);
        }

        if size < MAX_REC_SIZE as usize {
            let offset = self.free_phys_take(size as u32, ensure_avail)?;
            return Ok(smallvec![PhysPtr::new(size as u32, offset)]);
        }

        let mut pps = SmallVec::new();
        let mut remaining = size;
        let mut c = 8usize;
        while remaining > 0 {
            let alloc_size = remaining.min(MAX_REC_SIZE as usize) as u32;
            remaining -= alloc_size as usize - c;

            let offset = self.free_phys_take(alloc_size, ensure_avail)?;
            let mut pp = PhysPtr::new(alloc_size, offset);
            if c != 0 {
                pp = pp.with_linked();
            }
            pps.push(pp);

            c = if remaining <= MAX_REC_SIZE as usize { 0 } else { 8 };
        }
        Ok(pps)
    }
}
