//! # B-Tree Module
//!
//! The copy-on-write B-tree: versioned pages, the map container that owns
//! a tree of them, and the child-position projection used by garbage
//! collection.
//!
//! ## Node Types
//!
//! - **Leaf pages** hold the key/value pairs.
//! - **Internal pages** hold separator keys and child references, one more
//!   child than keys; the key at index `i` is greater than everything
//!   reachable from child `i` and at most everything from child `i + 1`.
//!
//! ## Module Organization
//!
//! - `page`: `Page`, `PageRef`, search/split/mutation, the binary codec,
//!   and the two-phase write-out
//! - `page_children`: `PageChildren`, the GC projection
//! - `map`: `Map`, the container wiring pages to codecs and the store,
//!   plus the in-order `Cursor`

pub mod map;
pub mod page;
pub mod page_children;

pub use map::{Cursor, Map};
pub use page::{Page, PageRef, SearchResult};
pub use page_children::PageChildren;
