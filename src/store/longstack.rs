//! # Long Stacks
//!
//! A long stack is an intrusive LIFO of 48-bit values used by both
//! free-space pools. The stack itself lives in the phys file as a chain
//! of pages; the only external state is one index-file head slot packing
//! `(pos << 48) | head_page_offset`, where `pos` is the byte offset of
//! the next value to pop within the head page.
//!
//! ## Page layout
//!
//! ```text
//! bytes 0..8    (page_size << 48) | previous_page_offset
//! bytes 8..14   value          <- pos = 8, bottom of this page
//! bytes 14..20  value
//! ...           6-byte stride up to page_size
//! ```
//!
//! Pages are allocated at the preferred size (8 + 204*6 = 1232 bytes)
//! through the free-extent pools themselves, and an emptied page is
//! returned to them. The resulting mutual recursion is bounded: a pop
//! frees at most one page, and the push that records it targets the
//! 1232-byte bucket rather than the stack being popped (the 1232-byte
//! bucket can reach itself, but never deeper than one hop since its
//! freed page satisfies the pending allocation).
//!
//! Both operations require the structural lock, which the borrow on
//! [`SpaceManager`] guarantees.

use eyre::{ensure, Result};

use crate::pointer::{PhysPtr, MASK_OFFSET};
use crate::volume::Volume;

use super::alloc::SpaceManager;
use super::{IO_FREE_RECID, IO_USER_START, LONG_STACK_PREF_SIZE};

fn check_head_slot(head_slot: u64) -> Result<()> {
    ensure!(
        (IO_FREE_RECID..IO_USER_START).contains(&head_slot) && head_slot % 8 == 0,
        "invalid long stack head slot: {}",
        head_slot
    );
    Ok(())
}

impl SpaceManager<'_> {
    /// Pops the most recently pushed value, or 0 when the stack is
    /// empty. Frees the head page once its last value is taken.
    pub fn long_stack_pop(&mut self, head_slot: u64) -> Result<u64> {
        check_head_slot(head_slot)?;

        let head = self.index.read_u64(head_slot)?;
        let data_offset = head & MASK_OFFSET;
        if data_offset == 0 {
            return Ok(0);
        }
        let pos = head >> 48;
        ensure!(
            pos >= 8 && (pos - 8) % 6 == 0,
            "long stack head slot {} has corrupt position {}",
            head_slot,
            pos
        );

        let ret = self.phys.read_u48(data_offset + pos)?;

        if pos == 8 {
            // page exhausted, unlink it and hand it back to the pools
            let header = self.phys.read_u64(data_offset)?;
            let page_size = header >> 48;
            let prev = header & MASK_OFFSET;
            if prev != 0 {
                let prev_size = self.phys.read_u64(prev)? >> 48;
                ensure!(
                    prev_size >= 14 && (prev_size - 8) % 6 == 0,
                    "long stack page at {} has corrupt size {}",
                    prev,
                    prev_size
                );
                self.index
                    .write_u64(head_slot, ((prev_size - 6) << 48) | prev)?;
            } else {
                self.index.write_u64(head_slot, 0)?;
            }
            self.free_phys_put(PhysPtr::from_raw((page_size << 48) | data_offset))?;
        } else {
            self.index
                .write_u64(head_slot, ((pos - 6) << 48) | data_offset)?;
        }

        Ok(ret)
    }

    /// Pushes a 48-bit value, growing the page chain when the head page
    /// is full.
    pub fn long_stack_push(&mut self, head_slot: u64, value: u64) -> Result<()> {
        ensure!(value >> 48 == 0, "long stack value out of range: {}", value);
        check_head_slot(head_slot)?;

        let head = self.index.read_u64(head_slot)?;
        let pos = head >> 48;
        let data_offset = head & MASK_OFFSET;

        if data_offset == 0 {
            let page = self.free_phys_take(LONG_STACK_PREF_SIZE as u32, true)?;
            ensure!(page != 0, "allocator returned null long stack page");
            self.phys.write_u64(page, LONG_STACK_PREF_SIZE << 48)?;
            self.phys.write_u48(page + 8, value)?;
            self.index.write_u64(head_slot, (8 << 48) | page)?;
            return Ok(());
        }

        let page_size = self.phys.read_u64(data_offset)? >> 48;
        if pos + 6 == page_size {
            // head page full, chain a new one in front of it
            let page = self.free_phys_take(LONG_STACK_PREF_SIZE as u32, true)?;
            ensure!(page != 0, "allocator returned null long stack page");
            self.phys
                .write_u64(page, (LONG_STACK_PREF_SIZE << 48) | data_offset)?;
            self.phys.write_u48(page + 8, value)?;
            self.index.write_u64(head_slot, (8 << 48) | page)?;
        } else {
            let pos = pos + 6;
            self.phys.write_u48(data_offset + pos, value)?;
            self.index.write_u64(head_slot, (pos << 48) | data_offset)?;
        }
        Ok(())
    }
}

/// Walks a long stack without mutating it, yielding values from the top
/// of the stack downwards. Used by the free-recid listing and the
/// statistics report.
pub(crate) fn long_stack_entries(
    index: &dyn Volume,
    phys: &dyn Volume,
    head_slot: u64,
) -> Result<Vec<u64>> {
    check_head_slot(head_slot)?;

    let mut entries = Vec::new();
    let head = index.read_u64(head_slot)?;
    let mut offset = head & MASK_OFFSET;
    let mut pos = head >> 48;

    while offset != 0 {
        ensure!(
            pos >= 8 && (pos - 8) % 6 == 0,
            "long stack page at {} has corrupt position {}",
            offset,
            pos
        );
        let mut p = pos;
        loop {
            entries.push(phys.read_u48(offset + p)?);
            if p == 8 {
                break;
            }
            p -= 6;
        }

        let next = phys.read_u64(offset)? & MASK_OFFSET;
        if next != 0 {
            // pages below the head were full when the head was pushed
            let next_size = phys.read_u64(next)? >> 48;
            ensure!(
                next_size >= 14 && (next_size - 8) % 6 == 0,
                "long stack page at {} has corrupt size {}",
                next,
                next_size
            );
            pos = next_size - 6;
        }
        offset = next;
    }

    Ok(entries)
}
