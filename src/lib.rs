//! # burrow - Embedded Copy-on-Write Key/Value Store
//!
//! burrow is an embedded, append-only, log-structured key/value store built
//! around a versioned copy-on-write B-tree. All data lives in one file of
//! immutable chunks; every commit appends a new chunk and never rewrites an
//! old one, so readers are lock-free over stable snapshots and a crash can
//! only lose the tail that was being written.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use burrow::{Store, StrType, U64Type};
//!
//! # fn main() -> eyre::Result<()> {
//! let store = Store::builder()
//!     .path("./data.db")
//!     .compression_level(1)
//!     .open()?;
//!
//! let map = store.open_map(1, Arc::new(U64Type), Arc::new(StrType))?;
//! map.put(1, "hello".to_owned())?;
//! map.put(2, "world".to_owned())?;
//! store.commit()?;
//!
//! assert_eq!(map.get(&1)?.as_deref(), Some("hello"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Map<K, V>  (B-tree)          │
//! ├─────────────────────────────────────┤
//! │  Page<K, V>  (COW node + codec)     │
//! ├───────────────────┬─────────────────┤
//! │    PageCache      │   Compressor    │
//! ├───────────────────┴─────────────────┤
//! │   Store  (chunks, commit, roots)    │
//! ├─────────────────────────────────────┤
//! │   FileStore  (append-only file)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! The page is the unit of everything: it is a B-tree node (leaf or
//! internal), a memory-accounted cache entry, and a self-describing record
//! in a chunk. Mutations copy pages to the current store version rather
//! than updating them, so older roots keep serving readers until nothing
//! references them.
//!
//! ## Durability Model
//!
//! Mutations accumulate in memory (tracked by the store's unsaved-memory
//! estimate) until `Store::commit` serializes every changed subtree into
//! one chunk, fsyncs it, and then atomically rolls the store header
//! forward. Pages reference each other by packed 64-bit positions; the
//! two-phase write-out resolves the chicken-and-egg between parents and
//! children within a single buffer pass.
//!
//! ## Module Overview
//!
//! - [`btree`]: versioned pages, the map container, GC projections
//! - [`storage`]: chunk file, headers, page cache, compression, the store
//! - [`encoding`]: varints, buffers, packed page positions
//! - [`types`]: the `DataType` codec trait and stock implementations
//! - [`config`]: tuning constants

pub mod btree;
pub mod config;
pub mod encoding;
pub mod storage;
pub mod types;

pub use btree::{Cursor, Map, Page, PageChildren, PageRef, SearchResult};
pub use encoding::{ByteReader, WriteBuffer};
pub use storage::{Chunk, Compressor, FileStore, PageCache, Store, StoreBuilder};
pub use types::{BytesType, DataType, StrType, U64Type};
