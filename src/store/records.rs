//! # Record Operations
//!
//! The CRUD surface over recids. Every operation resolves the recid to
//! its index slot, takes the striped lock for that recid (readers share,
//! writers exclude), and touches the allocator only inside a short
//! structural-lock window:
//!
//! - `put` allocates a recid and extents under the structural lock, then
//!   releases it before writing the payload; the fresh extents are
//!   invisible to other threads until the index slot is published.
//! - `update` / `compare_and_swap` free the old extents and allocate the
//!   new ones in one structural window, again writing payload after.
//! - `delete` zeroes the slot first, then records the recid and extents
//!   as free.
//!
//! The index-slot write is the linearization point: payloads always hit
//! the phys file before the slot that points at them.

use eyre::{ensure, Result};

use crate::pointer::PhysPtr;
use crate::serializer::Serializer;

use super::{io_recid_for, Store, IO_USER_START};

impl Store {
    /// Stores a new record and returns its recid.
    pub fn put<A, S: Serializer<A>>(&self, value: &A, serializer: &S) -> Result<u64> {
        self.check_writable()?;
        let buf = self.serialize(value, serializer)?;

        let (io_recid, pps) = {
            let mut state = self.alloc.lock();
            let mut space = self.space_manager(&mut state)?;
            let io_recid = space.free_io_recid_take(true)?;
            let pps = space.phys_allocate(buf.len(), true)?;
            (io_recid, pps)
        };

        self.write_record(io_recid, &pps, &buf)?;
        self.scratch.offer(buf);
        Ok((io_recid - IO_USER_START) / 8)
    }

    /// Reads a record, or `None` when the recid holds nothing.
    pub fn get<A, S: Serializer<A>>(&self, recid: u64, serializer: &S) -> Result<Option<A>> {
        let io_recid = io_recid_for(recid);
        let _guard = self.lock_for(recid).read();
        self.get_locked(io_recid, serializer)
    }

    /// Replaces the record at `recid`, reclaiming its old extents.
    pub fn update<A, S: Serializer<A>>(&self, recid: u64, value: &A, serializer: &S) -> Result<()> {
        self.check_writable()?;
        let buf = self.serialize(value, serializer)?;

        let io_recid = io_recid_for(recid);
        let _guard = self.lock_for(recid).write();
        self.update_locked(io_recid, &buf)?;
        self.scratch.offer(buf);
        Ok(())
    }

    /// Atomically replaces the record iff its current value equals
    /// `expected` (`None` matches an absent record). Returns whether the
    /// swap happened; on `false` nothing is modified or freed.
    pub fn compare_and_swap<A, S>(
        &self,
        recid: u64,
        expected: Option<&A>,
        new_value: &A,
        serializer: &S,
    ) -> Result<bool>
    where
        A: PartialEq,
        S: Serializer<A>,
    {
        self.check_writable()?;
        let io_recid = io_recid_for(recid);
        let _guard = self.lock_for(recid).write();

        let current = self.get_locked(io_recid, serializer)?;
        let matches = match (&current, expected) {
            (Some(current), Some(expected)) => current == expected,
            (None, None) => true,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        let buf = self.serialize(new_value, serializer)?;
        self.update_locked(io_recid, &buf)?;
        self.scratch.offer(buf);
        Ok(true)
    }

    /// Removes the record and recycles its recid and extents.
    pub fn delete(&self, recid: u64) -> Result<()> {
        self.check_writable()?;
        let io_recid = io_recid_for(recid);
        let _guard = self.lock_for(recid).write();

        let index = self.index()?;
        let old = PhysPtr::from_raw(index.read_u64(io_recid)?);
        index.write_u64(io_recid, PhysPtr::NULL.with_archive().raw())?;

        if !self.reclaim_track {
            return Ok(());
        }

        let chain = self.linked_chain(old)?;
        let mut state = self.alloc.lock();
        let mut space = self.space_manager(&mut state)?;
        space.free_io_recid_put(io_recid)?;
        space.free_phys_put(old)?;
        for pp in &chain {
            space.free_phys_put(*pp)?;
        }
        Ok(())
    }

    /// Reads the raw payload bytes of a record.
    pub fn get_raw(&self, recid: u64) -> Result<Option<Vec<u8>>> {
        let io_recid = io_recid_for(recid);
        let _guard = self.lock_for(recid).read();
        self.read_payload(io_recid)
    }

    /// Replaces the record with raw bytes, growing the index when
    /// `recid` lies beyond every slot handed out so far. `None` stores
    /// an empty record.
    pub fn update_raw(&self, recid: u64, data: Option<&[u8]>) -> Result<()> {
        self.check_writable()?;
        let io_recid = io_recid_for(recid);

        {
            let mut state = self.alloc.lock();
            if io_recid + 8 > state.index_size {
                state.index_size = io_recid + 8;
                self.index()?.ensure_available(state.index_size)?;
            }
        }

        let _guard = self.lock_for(recid).write();
        self.update_locked(io_recid, data.unwrap_or(&[]))
    }

    fn serialize<A, S: Serializer<A>>(&self, value: &A, serializer: &S) -> Result<Vec<u8>> {
        let mut buf = self.scratch.take();
        serializer.serialize(&mut buf, value)?;
        Ok(buf)
    }

    /// Read path shared by `get` and `compare_and_swap`; caller holds
    /// the recid lock.
    fn get_locked<A, S: Serializer<A>>(
        &self,
        io_recid: u64,
        serializer: &S,
    ) -> Result<Option<A>> {
        let Some(payload) = self.read_payload(io_recid)? else {
            return Ok(None);
        };
        let mut input = payload.as_slice();
        let value = serializer.deserialize(&mut input)?;
        ensure!(
            input.is_empty(),
            "serializer left {} bytes of the record at index offset {} unread",
            input.len(),
            io_recid
        );
        Ok(Some(value))
    }

    /// Write path shared by `update`, `compare_and_swap` and
    /// `update_raw`; caller holds the recid write lock.
    fn update_locked(&self, io_recid: u64, payload: &[u8]) -> Result<()> {
        let old = PhysPtr::from_raw(self.index()?.read_u64(io_recid)?);
        let chain = if self.reclaim_track {
            self.linked_chain(old)?
        } else {
            Vec::new()
        };

        let pps = {
            let mut state = self.alloc.lock();
            let mut space = self.space_manager(&mut state)?;
            if self.reclaim_track {
                space.free_phys_put(old)?;
                for pp in &chain {
                    space.free_phys_put(*pp)?;
                }
            }
            space.phys_allocate(payload.len(), true)?
        };

        self.write_record(io_recid, &pps, payload)
    }

    /// Collects the descriptors of every follow-up extent of a linked
    /// record, in chain order. Empty for unlinked records.
    pub(crate) fn linked_chain(&self, pp: PhysPtr) -> Result<Vec<PhysPtr>> {
        let mut chain = Vec::new();
        if !pp.is_linked() {
            return Ok(chain);
        }
        let phys = self.phys()?;
        let mut next = PhysPtr::from_raw(phys.read_u64(pp.offset())?);
        loop {
            chain.push(next);
            if !next.is_linked() {
                return Ok(chain);
            }
            next = PhysPtr::from_raw(phys.read_u64(next.offset())?);
        }
    }

    /// Reads the full payload addressed by a record's index slot,
    /// following the chain for linked records. `None` for empty slots.
    pub(crate) fn read_payload(&self, io_recid: u64) -> Result<Option<Vec<u8>>> {
        let pp = PhysPtr::from_raw(self.index()?.read_u64(io_recid)?);
        if pp.is_null() {
            return Ok(None);
        }
        let phys = self.phys()?;

        if !pp.is_linked() {
            let mut buf = vec![0u8; pp.size() as usize];
            phys.read_bytes(pp.offset(), &mut buf)?;
            return Ok(Some(buf));
        }

        let mut buf = Vec::with_capacity(pp.size() as usize);
        let mut offset = pp.offset();
        let mut size = pp.size() as usize;
        let mut header = 8usize;
        loop {
            ensure!(
                size >= header,
                "linked extent at {} too small for its header: {}",
                offset,
                size
            );
            let start = buf.len();
            buf.resize(start + size - header, 0);
            phys.read_bytes(offset + header as u64, &mut buf[start..])?;
            if header == 0 {
                return Ok(Some(buf));
            }
            let next = PhysPtr::from_raw(phys.read_u64(offset)?);
            offset = next.offset();
            size = next.size() as usize;
            header = if next.is_linked() { 8 } else { 0 };
        }
    }

    /// Writes a payload into freshly allocated extents and publishes the
    /// head pointer in the record's index slot. The slot write comes
    /// last so readers of other snapshots never see a half-written
    /// record.
    pub(crate) fn write_record(
        &self,
        io_recid: u64,
        pps: &[PhysPtr],
        payload: &[u8],
    ) -> Result<()> {
        let phys = self.phys()?;

        if pps.len() == 1 && !pps[0].is_linked() {
            if !pps[0].is_null() {
                phys.write_bytes(pps[0].offset(), payload)?;
            }
        } else {
            let mut written = 0usize;
            for (i, pp) in pps.iter().enumerate() {
                let last = i + 1 == pps.len();
                ensure!(
                    pp.is_linked() != last,
                    "extent {} of {} has a mismatched link flag",
                    i,
                    pps.len()
                );
                let header = if last { 0usize } else { 8 };
                let take = pp.size() as usize - header;
                phys.write_bytes(pp.offset() + header as u64, &payload[written..written + take])?;
                written += take;
                if !last {
                    phys.write_u64(pp.offset(), pps[i + 1].raw())?;
                }
            }
            ensure!(
                written == payload.len(),
                "extent chain covers {} bytes of a {}-byte payload",
                written,
                payload.len()
            );
        }

        self.index()?
            .write_u64(io_recid, pps[0].with_archive().raw())?;
        Ok(())
    }
}
