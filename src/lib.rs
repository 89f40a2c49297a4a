//! # recstore - Embedded Record Store
//!
//! recstore maps stable integer record identifiers (recids) to opaque
//! variable-length byte payloads, persisted across two files. It is the
//! storage engine you embed *under* richer layers (maps, trees, codecs,
//! caches); none of those live here.
//!
//! ## Quick Start
//!
//! ```ignore
//! use recstore::{BytesSerializer, FileVolumeFactory, Store, StoreOptions};
//!
//! let factory = FileVolumeFactory::new("./data/records");
//! let mut store = Store::open(&factory, StoreOptions::default())?;
//!
//! let recid = store.put(&payload, &BytesSerializer)?;
//! let back = store.get(recid, &BytesSerializer)?;
//! store.commit()?;
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Record API (put/get/update/cas)    │
//! ├──────────────────────────────────────┤
//! │  Physical allocator │ Free-space     │
//! │  (extent chains)    │ pools          │
//! ├─────────────────────┴────────────────┤
//! │     Long stacks (intrusive LIFO)     │
//! ├──────────────────────────────────────┤
//! │  Volumes (mmap file / memory)        │
//! └──────────────────────────────────────┘
//! ```
//!
//! Two files back every store: the *index* file translates each recid
//! into a packed 64-bit physical pointer, and the *phys* file holds the
//! payload bytes. Payloads beyond the single-extent limit (just under
//! 64 KiB) become chains of linked extents.
//! Freed recids and freed extents are recycled through intrusive
//! "long stacks" stored in the phys file itself.
//!
//! ## Durability Model
//!
//! Writes reach the OS through a memory mapping and become durable at
//! `commit`/`close`, which persist the header counters and sync both
//! files. There is no write-ahead log, no rollback, and no crash
//! recovery. A store that was not closed cleanly may be unreadable.
//!
//! ## Module Overview
//!
//! - [`store`]: record engine, free-space management, lifecycle
//! - [`volume`]: growable byte buffers over mmap files or memory
//! - [`pointer`]: the packed size/offset/flags word
//! - [`serializer`]: payload conversion at the API boundary

pub mod pointer;
mod scratch;
pub mod serializer;
pub mod store;
pub mod volume;

pub use pointer::{PhysPtr, MAX_REC_SIZE};
pub use serializer::{BytesSerializer, Serializer, StrSerializer, U64Serializer};
pub use store::{Store, StoreOptions, STORE_MAGIC};
pub use volume::{
    FileVolume, FileVolumeFactory, MemVolume, MemVolumeFactory, Volume, VolumeFactory,
    VOLUME_BUF_SIZE,
};
