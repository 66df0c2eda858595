//! # Storage Module
//!
//! Everything below the B-tree: the append-only chunk file, its headers,
//! page payload compression, the memory-costed page cache, and the `Store`
//! that ties them together and drives commits.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Store (commit protocol)      │
//! ├──────────┬──────────┬───────────────┤
//! │ PageCache│  Chunk   │  Compressor   │
//! │  (SIEVE) │ registry │ (deflate f/h) │
//! ├──────────┴──────────┴───────────────┤
//! │     headers (zerocopy, CRC-32)      │
//! ├─────────────────────────────────────┤
//! │     FileStore (positioned I/O)      │
//! └─────────────────────────────────────┘
//! ```
//!
//! The B-tree layer above hands fully serialized pages down through
//! `Store::commit` and pulls framed page bytes back up through the read
//! path; nothing in this module understands page contents beyond the frame.
//!
//! ## Module Organization
//!
//! - `file_store`: positioned read/write/sync over the store file
//! - `headers`: zerocopy store/chunk headers and root-table entries
//! - `chunk`: per-chunk page and live-byte accounting
//! - `cache`: SIEVE page cache with lock sharding
//! - `compress`: the `Compressor` trait and deflate profiles
//! - `store`: `Store`, `StoreBuilder`, and the commit protocol

mod cache;
mod chunk;
mod compress;
mod file_store;
mod headers;
mod store;

pub use cache::PageCache;
pub use chunk::Chunk;
pub use compress::{Compressor, Deflate};
pub use file_store::FileStore;
pub use headers::{
    ChunkHeader, RootEntry, StoreHeader, CHUNK_HEADER_SIZE, ROOT_ENTRY_SIZE, STORE_HEADER_SIZE,
};
pub use store::{Store, StoreBuilder};

pub(crate) use cache::CachedPage;
pub(crate) use store::MapCommit;
