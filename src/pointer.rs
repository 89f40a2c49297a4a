//! # Physical Pointer Codec
//!
//! An index slot holds a single 64-bit word describing where a record
//! lives in the physical file. The word packs three things:
//!
//! ```text
//! bits 48..63   record size in bytes (0..65535)
//! bits  4..47   physical offset (always a multiple of 16)
//! bit   3       LINKED   - more extents follow this one
//! bit   2       DISCARD  - drop this record next time the store is offline
//! bit   1       ARCHIVE  - modified since the last backup
//! bit   0       unused
//! ```
//!
//! Because physical offsets are 16-byte aligned, their low four bits are
//! always zero and can carry the flags. A raw value of zero (size 0,
//! offset 0) means "no record here".

pub const MASK_OFFSET: u64 = 0x0000_FFFF_FFFF_FFF0;

const MASK_LINKED: u64 = 0x8;
const MASK_DISCARD: u64 = 0x4;
const MASK_ARCHIVE: u64 = 0x2;

/// Largest extent a single physical pointer can describe.
pub const MAX_REC_SIZE: u32 = 65_535;

/// A packed size/offset/flags word stored in an index slot or in the
/// 8-byte header of a linked extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PhysPtr(u64);

impl PhysPtr {
    /// The "no record" pointer.
    pub const NULL: PhysPtr = PhysPtr(0);

    /// Packs a size and a 16-byte-aligned physical offset.
    #[inline]
    pub fn new(size: u32, offset: u64) -> PhysPtr {
        debug_assert!(size <= MAX_REC_SIZE, "extent size {size} exceeds 16 bits");
        debug_assert!(offset % 16 == 0, "physical offset {offset} not 16-byte aligned");
        debug_assert!(offset & !MASK_OFFSET == 0, "physical offset {offset} out of range");
        PhysPtr(((size as u64) << 48) | (offset & MASK_OFFSET))
    }

    #[inline]
    pub fn from_raw(raw: u64) -> PhysPtr {
        PhysPtr(raw)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn size(self) -> u32 {
        (self.0 >> 48) as u32
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 & MASK_OFFSET
    }

    /// True when the pointer carries neither a size nor an offset,
    /// regardless of flag bits. Such a slot holds no record.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 & !(MASK_LINKED | MASK_DISCARD | MASK_ARCHIVE) == 0
    }

    #[inline]
    pub fn is_linked(self) -> bool {
        self.0 & MASK_LINKED != 0
    }

    #[inline]
    pub fn with_linked(self) -> PhysPtr {
        PhysPtr(self.0 | MASK_LINKED)
    }

    #[inline]
    pub fn is_discarded(self) -> bool {
        self.0 & MASK_DISCARD != 0
    }

    #[inline]
    pub fn with_discard(self) -> PhysPtr {
        PhysPtr(self.0 | MASK_DISCARD)
    }

    #[inline]
    pub fn is_archived(self) -> bool {
        self.0 & MASK_ARCHIVE != 0
    }

    #[inline]
    pub fn with_archive(self) -> PhysPtr {
        PhysPtr(self.0 | MASK_ARCHIVE)
    }
}
