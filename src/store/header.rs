//! # Index File Header
//!
//! The first fifteen 8-byte slots of the index file form the store
//! header: a magic word, the three persisted size counters, and reserved
//! slots for future metadata. The long-stack head slots (free recids and
//! the free-extent buckets) follow immediately after, so the struct size
//! is pinned to `IO_FREE_RECID` at compile time.
//!
//! All fields are little-endian and the struct is `Unaligned`, so it can
//! be read straight out of an arbitrary byte offset.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{IO_FREE_RECID, STORE_MAGIC};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct IndexHeader {
    magic: U64,
    index_size: U64,
    phys_size: U64,
    free_size: U64,
    reserved: [U64; 11],
}

const _: () = assert!(std::mem::size_of::<IndexHeader>() as u64 == IO_FREE_RECID);

impl IndexHeader {
    pub fn new(index_size: u64, phys_size: u64, free_size: u64) -> IndexHeader {
        IndexHeader {
            magic: U64::new(STORE_MAGIC),
            index_size: U64::new(index_size),
            phys_size: U64::new(phys_size),
            free_size: U64::new(free_size),
            reserved: [U64::new(0); 11],
        }
    }

    /// Parses and validates a header read from the start of the index
    /// file.
    pub fn from_bytes(bytes: &[u8]) -> Result<IndexHeader> {
        ensure!(
            bytes.len() >= std::mem::size_of::<IndexHeader>(),
            "buffer too small for IndexHeader: {} < {}",
            bytes.len(),
            std::mem::size_of::<IndexHeader>()
        );

        let header = IndexHeader::read_from_bytes(&bytes[..std::mem::size_of::<IndexHeader>()])
            .map_err(|e| eyre::eyre!("failed to parse IndexHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == STORE_MAGIC,
            "storage has invalid header: magic {:#018x}",
            header.magic.get()
        );

        Ok(header)
    }

    pub fn index_size(&self) -> u64 {
        self.index_size.get()
    }

    pub fn phys_size(&self) -> u64 {
        self.phys_size.get()
    }

    pub fn free_size(&self) -> u64 {
        self.free_size.get()
    }
}
