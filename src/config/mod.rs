//! # Configuration Constants
//!
//! This module centralizes the crate's tuning constants, grouping
//! interdependent values together so changing one prompts a look at its
//! dependents.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_MEM (128 bytes)
//!       │
//!       └─> PAGE_MEM_CHILD (16 bytes per child slot)
//!             Both feed every page's running memory estimate; the split
//!             threshold below is compared against that estimate, so the
//!             three constants jointly decide tree fan-out.
//!
//! DEFAULT_PAGE_SPLIT_SIZE (16 KiB)
//!       │
//!       └─> A page whose memory estimate exceeds this is split on the way
//!           down during writes. Larger values mean shallower trees and
//!           bigger serialized pages.
//!
//! DEFAULT_CACHE_SIZE (16 MiB)
//!       │
//!       └─> CACHE_SHARD_COUNT (16)
//!             The page cache budget is divided evenly across shards, so
//!             the per-shard budget is DEFAULT_CACHE_SIZE / 16 unless the
//!             builder overrides the total.
//!
//! COMPRESS_MIN_PAYLOAD (16 bytes)
//!       └─> Payloads at or below this never attempt compression; the
//!           framing overhead cannot win at that size.
//! ```
//!
//! ## Memory Estimate Calibration
//!
//! `PAGE_MEM` and `PAGE_MEM_CHILD` are deliberately rough: they cover the
//! page struct, its array headers, and per-child reference overhead on a
//! 64-bit target. The estimate drives cache eviction and split decisions,
//! not allocation, so slight over-counting is harmless while under-counting
//! would bloat resident memory.

/// Fixed memory overhead charged to every page.
pub const PAGE_MEM: usize = 128;

/// Memory overhead charged per child reference of an internal page.
pub const PAGE_MEM_CHILD: usize = 16;

/// Memory estimate above which a page is split during writes.
pub const DEFAULT_PAGE_SPLIT_SIZE: usize = 16 * 1024;

/// Default page cache budget in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 16 * 1024 * 1024;

/// Number of independently locked page cache shards.
pub const CACHE_SHARD_COUNT: usize = 16;

/// Minimum payload size for which compression is attempted.
pub const COMPRESS_MIN_PAYLOAD: usize = 16;

const _: () = assert!(
    DEFAULT_CACHE_SIZE % CACHE_SHARD_COUNT == 0,
    "cache budget must divide evenly across shards"
);

const _: () = assert!(
    COMPRESS_MIN_PAYLOAD > 0,
    "a zero compression threshold would attempt to compress empty payloads"
);
