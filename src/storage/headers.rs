//! # On-Disk Header Definitions
//!
//! Type-safe, zerocopy-based headers for the store file. Two fixed layouts:
//!
//! 1. **Store header** (128 bytes, offset 0) — magic bytes, format version,
//!    the committed version counter, and a pointer to the newest chunk.
//!    Rewritten at the end of every commit.
//!
//! 2. **Chunk header** (64 bytes, chunk start) — identity and accounting for
//!    one append-only chunk: id, total length, page counters, live-byte
//!    counters, a pointer to the previous chunk (headers form a backwards
//!    chain used to rebuild the chunk registry on open), and the number of
//!    root-table entries trailing the chunk.
//!
//! Each chunk ends with a **root table**: one 16-byte entry per open map,
//! recording that map's root page position as of the commit. The table is a
//! complete snapshot, so reopening a store only needs the newest chunk.
//!
//! ## Zerocopy Safety
//!
//! All header structs use zerocopy traits for safe, zero-copy serialization:
//! `FromBytes`, `IntoBytes`, `Immutable`, `KnownLayout`, and `Unaligned`.
//! Multi-byte fields are little-endian `U32`/`U64` wrappers.
//!
//! ## Integrity
//!
//! Both headers carry a CRC-32 over their own bytes (computed with the crc
//! field zeroed). Pages have their own 16-bit check value; the CRC here
//! protects the metadata that locates them.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::chunk::Chunk;

pub const STORE_MAGIC: &[u8; 16] = b"burrow store v1\x00";
pub const CHUNK_MAGIC: &[u8; 4] = b"BCHK";

pub const STORE_FORMAT_VERSION: u32 = 1;

pub const STORE_HEADER_SIZE: usize = 128;
pub const CHUNK_HEADER_SIZE: usize = 64;
pub const ROOT_ENTRY_SIZE: usize = 16;

const HEADER_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

fn header_crc(bytes: &[u8], crc_offset: usize) -> u32 {
    let mut copy = bytes.to_vec();
    copy[crc_offset..crc_offset + 4].fill(0);
    HEADER_CRC.checksum(&copy)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StoreHeader {
    magic: [u8; 16],
    format_version: U32,
    flags: U32,
    version: U64,
    last_chunk_pos: U64,
    last_chunk_id: U32,
    crc: U32,
    reserved: [u8; 80],
}

const _: () = assert!(std::mem::size_of::<StoreHeader>() == STORE_HEADER_SIZE);

impl StoreHeader {
    pub fn new(version: u64, last_chunk_pos: u64, last_chunk_id: u32) -> Self {
        let mut header = Self {
            magic: *STORE_MAGIC,
            format_version: U32::new(STORE_FORMAT_VERSION),
            flags: U32::new(0),
            version: U64::new(version),
            last_chunk_pos: U64::new(last_chunk_pos),
            last_chunk_id: U32::new(last_chunk_id),
            crc: U32::new(0),
            reserved: [0u8; 80],
        };
        let crc = header_crc(header.as_bytes(), Self::crc_offset());
        header.crc = U32::new(crc);
        header
    }

    fn crc_offset() -> usize {
        // magic + format_version + flags + version + last_chunk_pos + last_chunk_id
        16 + 4 + 4 + 8 + 8 + 4
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= STORE_HEADER_SIZE,
            "buffer too small for store header: {} < {}",
            bytes.len(),
            STORE_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..STORE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse store header: {:?}", e))?;
        ensure!(
            &header.magic == STORE_MAGIC,
            "file corrupted: bad store header magic"
        );
        ensure!(
            header.format_version.get() == STORE_FORMAT_VERSION,
            "unsupported store format version: {} (expected {})",
            header.format_version.get(),
            STORE_FORMAT_VERSION
        );
        let expected = header_crc(&bytes[..STORE_HEADER_SIZE], Self::crc_offset());
        ensure!(
            header.crc.get() == expected,
            "file corrupted: store header crc mismatch, expected {:08x}, got {:08x}",
            expected,
            header.crc.get()
        );
        Ok(header)
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn last_chunk_pos(&self) -> u64 {
        self.last_chunk_pos.get()
    }

    pub fn last_chunk_id(&self) -> u32 {
        self.last_chunk_id.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChunkHeader {
    magic: [u8; 4],
    id: U32,
    len: U64,
    page_count: U32,
    page_count_live: U32,
    max_len: U64,
    max_len_live: U64,
    prev_chunk_pos: U64,
    version: U64,
    root_count: U32,
    crc: U32,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

impl ChunkHeader {
    pub fn new(chunk: &Chunk, prev_chunk_pos: u64, root_count: u32) -> Self {
        let mut header = Self {
            magic: *CHUNK_MAGIC,
            id: U32::new(chunk.id),
            len: U64::new(chunk.len),
            page_count: U32::new(chunk.page_count),
            page_count_live: U32::new(chunk.page_count_live),
            max_len: U64::new(chunk.max_len),
            max_len_live: U64::new(chunk.max_len_live),
            prev_chunk_pos: U64::new(prev_chunk_pos),
            version: U64::new(chunk.version),
            root_count: U32::new(root_count),
            crc: U32::new(0),
        };
        let crc = header_crc(header.as_bytes(), Self::crc_offset());
        header.crc = U32::new(crc);
        header
    }

    fn crc_offset() -> usize {
        CHUNK_HEADER_SIZE - 4
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= CHUNK_HEADER_SIZE,
            "buffer too small for chunk header: {} < {}",
            bytes.len(),
            CHUNK_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..CHUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse chunk header: {:?}", e))?;
        ensure!(
            &header.magic == CHUNK_MAGIC,
            "file corrupted: bad chunk header magic"
        );
        let expected = header_crc(&bytes[..CHUNK_HEADER_SIZE], Self::crc_offset());
        ensure!(
            header.crc.get() == expected,
            "file corrupted in chunk {}: header crc mismatch",
            header.id.get()
        );
        Ok(header)
    }

    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub fn len(&self) -> u64 {
        self.len.get()
    }

    pub fn page_count(&self) -> u32 {
        self.page_count.get()
    }

    pub fn page_count_live(&self) -> u32 {
        self.page_count_live.get()
    }

    pub fn max_len(&self) -> u64 {
        self.max_len.get()
    }

    pub fn max_len_live(&self) -> u64 {
        self.max_len_live.get()
    }

    pub fn prev_chunk_pos(&self) -> u64 {
        self.prev_chunk_pos.get()
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    pub fn root_count(&self) -> u32 {
        self.root_count.get()
    }
}

/// One root-table entry: a map's root page position as of a commit.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RootEntry {
    map_id: U32,
    reserved: U32,
    root_pos: U64,
}

const _: () = assert!(std::mem::size_of::<RootEntry>() == ROOT_ENTRY_SIZE);

impl RootEntry {
    pub fn new(map_id: u32, root_pos: u64) -> Self {
        Self {
            map_id: U32::new(map_id),
            reserved: U32::new(0),
            root_pos: U64::new(root_pos),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= ROOT_ENTRY_SIZE,
            "buffer too small for root entry: {} < {}",
            bytes.len(),
            ROOT_ENTRY_SIZE
        );
        Self::read_from_bytes(&bytes[..ROOT_ENTRY_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse root entry: {:?}", e))
    }

    pub fn map_id(&self) -> u32 {
        self.map_id.get()
    }

    pub fn root_pos(&self) -> u64 {
        self.root_pos.get()
    }
}
