//! # Versioned B-Tree Page
//!
//! The page is the unit of everything in this store: it is a B-tree node
//! (leaf or internal), a memory-accounted cache entry, and a self-describing
//! record inside an append-only chunk, all at once.
//!
//! ## Copy-on-Write Model
//!
//! Pages are mutated by exactly one writer per map version. Readers traverse
//! snapshots: the key, value, and child arrays live behind `Arc`s and are
//! **immutable after publication** — every mutator builds a replacement
//! array rather than writing into the shared one, so a reader holding an
//! older root keeps observing a consistent tree with no locking.
//!
//! `copy` produces a page for a new version that shares all three arrays
//! with its source; the arrays only diverge at the first subsequent
//! mutation. Copying also releases the source page's storage (its live
//! bytes if stored, its unsaved-memory registration if not — the latter
//! deferred through the `removed_in_memory` flag until a position exists to
//! release).
//!
//! ## On-Disk Format
//!
//! ```text
//! +-------------+--------+---------+-----------+------+
//! | page_length | check  | map_id  | key_count | type |
//! | u32         | u16    | var u32 | var u32   | u8   |
//! +-------------+--------+---------+-----------+------+
//! | child positions: (key_count + 1) x u64            |  internal only
//! | child counts:    (key_count + 1) x var u64        |  internal only
//! +---------------------------------------------------+
//! | [added_len: var u32]                              |  compressed only
//! | payload: keys, then values (leaf only)            |
//! +---------------------------------------------------+
//! ```
//!
//! The type byte carries the leaf/internal bit plus the compression flags.
//! The check value folds the chunk id, the offset within the chunk, and the
//! page length, so a page read back from the wrong place fails verification
//! even if its bytes are intact.
//!
//! ## Two-Phase Write-Out
//!
//! An internal page must store its children's positions, but a position
//! only exists once a child has been serialized. `write_unsaved_recursive`
//! therefore emits the parent first with a zero-filled child table,
//! remembers the table's offset, recurses into the children, and then
//! patches the table with absolute writes. `write_end` runs after the chunk
//! is durable and demotes in-memory child handles to bare positions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::btree::map::Map;
use crate::config::{COMPRESS_MIN_PAYLOAD, PAGE_MEM, PAGE_MEM_CHILD};
use crate::encoding::position::{
    check_value, pack_position, page_max_length, position_chunk_id, position_offset,
    position_type, PAGE_COMPRESSED, PAGE_COMPRESSED_HIGH, PAGE_TYPE_LEAF, PAGE_TYPE_NODE,
};
use crate::encoding::varint::var_u32_len;
use crate::encoding::{ByteReader, WriteBuffer};
use crate::storage::Chunk;

/// Outcome of a key search within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// The key exists at this index.
    Found(usize),
    /// The key is absent; inserting it would place it at this index.
    NotFound(usize),
}

/// An edge to a child page: by on-disk position, by in-memory handle, or
/// both. `count` is the number of entries in the child's subtree.
#[derive(Debug)]
pub struct PageRef<K, V> {
    pub(crate) pos: u64,
    pub(crate) page: Option<Arc<Page<K, V>>>,
    pub(crate) count: u64,
}

impl<K, V> PageRef<K, V> {
    pub fn new(page: Option<Arc<Page<K, V>>>, pos: u64, count: u64) -> Self {
        Self { pos, page, count }
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn page(&self) -> Option<&Arc<Page<K, V>>> {
        self.page.as_ref()
    }
}

impl<K, V> PageRef<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Reference to an in-memory page, carrying its current position and
    /// entry count.
    pub fn from_page(page: Arc<Page<K, V>>) -> Self {
        Self {
            pos: page.pos(),
            count: page.total_count(),
            page: Some(page),
        }
    }
}

impl<K, V> Clone for PageRef<K, V> {
    fn clone(&self) -> Self {
        Self {
            pos: self.pos,
            page: self.page.clone(),
            count: self.count,
        }
    }
}

/// A page is exactly one of: a leaf holding values, or an internal node
/// holding child references (always one more child than keys).
#[derive(Debug)]
enum PageContent<K, V> {
    Leaf(Arc<Vec<V>>),
    Node(Arc<Vec<PageRef<K, V>>>),
}

impl<K, V> Clone for PageContent<K, V> {
    fn clone(&self) -> Self {
        match self {
            PageContent::Leaf(values) => PageContent::Leaf(values.clone()),
            PageContent::Node(children) => PageContent::Node(children.clone()),
        }
    }
}

/// A B-tree page, leaf or internal.
#[derive(Debug)]
pub struct Page<K, V> {
    version: u64,
    /// Packed on-disk position; 0 until the page is first serialized, then
    /// fixed for the lifetime of the object.
    pos: u64,
    /// Entries in this subtree (key count for leaves).
    total_count: u64,
    /// Last successful search index plus one; a hint seeding the next
    /// binary search. Racy by design: a stale value costs comparisons,
    /// never correctness, because key arrays are replaced, not mutated.
    cached_compare: AtomicUsize,
    /// Running in-memory size estimate.
    memory: usize,
    keys: Arc<Vec<K>>,
    content: PageContent<K, V>,
    /// Set when the page is removed before ever being assigned a position,
    /// so the storage release fires during write-out instead.
    removed_in_memory: AtomicBool,
}

impl<K, V> Clone for Page<K, V> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            pos: self.pos,
            total_count: self.total_count,
            cached_compare: AtomicUsize::new(self.cached_compare.load(Ordering::Relaxed)),
            memory: self.memory,
            keys: self.keys.clone(),
            content: self.content.clone(),
            removed_in_memory: AtomicBool::new(self.removed_in_memory.load(Ordering::Acquire)),
        }
    }
}

impl<K, V> PartialEq for Page<K, V> {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.pos != 0 && self.pos == other.pos
    }
}

impl<K, V> Page<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn raw(version: u64, keys: Vec<K>, content: PageContent<K, V>, total_count: u64) -> Self {
        Self {
            version,
            pos: 0,
            total_count,
            cached_compare: AtomicUsize::new(0),
            memory: 0,
            keys: Arc::new(keys),
            content,
            removed_in_memory: AtomicBool::new(false),
        }
    }

    /// An empty leaf that is not yet registered with any store; used to
    /// bootstrap a map before its saved root is known.
    pub(crate) fn empty_leaf(version: u64) -> Self {
        let mut page = Self::raw(version, Vec::new(), PageContent::Leaf(Arc::new(Vec::new())), 0);
        page.memory = PAGE_MEM;
        page
    }

    /// Creates an empty leaf registered as unsaved with the map's store.
    pub fn create_empty(map: &Map<K, V>, version: u64) -> Self {
        let page = Self::empty_leaf(version);
        map.store().register_unsaved_page(page.memory);
        page
    }

    /// Creates a leaf from already-sorted keys and their values.
    pub fn create_leaf(map: &Map<K, V>, version: u64, keys: Vec<K>, values: Vec<V>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let total = keys.len() as u64;
        let mut page = Self::raw(version, keys, PageContent::Leaf(Arc::new(values)), total);
        page.recalculate_memory(map);
        map.store().register_unsaved_page(page.memory);
        page
    }

    /// Creates an internal page; `children` must hold one more entry than
    /// `keys`. The total entry count is derived from the child counts.
    pub fn create_node(
        map: &Map<K, V>,
        version: u64,
        keys: Vec<K>,
        children: Vec<PageRef<K, V>>,
    ) -> Self {
        debug_assert_eq!(children.len(), keys.len() + 1);
        let total = children.iter().map(|child| child.count).sum();
        let mut page = Self::raw(version, keys, PageContent::Node(Arc::new(children)), total);
        page.recalculate_memory(map);
        map.store().register_unsaved_page(page.memory);
        page
    }

    /// Creates a copy of this page under a new version. The copy shares the
    /// key/value/child arrays (they diverge on first mutation), keeps the
    /// search hint, starts unsaved, and supersedes the original, whose
    /// storage is released.
    pub fn copy(&self, map: &Map<K, V>, version: u64) -> Self {
        let page = Self {
            version,
            pos: 0,
            total_count: self.total_count,
            cached_compare: AtomicUsize::new(self.cached_compare.load(Ordering::Relaxed)),
            memory: self.memory,
            keys: self.keys.clone(),
            content: self.content.clone(),
            removed_in_memory: AtomicBool::new(false),
        };
        map.store().register_unsaved_page(page.memory);
        self.remove_page(map);
        page
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf(_))
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn key(&self, index: usize) -> &K {
        &self.keys[index]
    }

    pub fn value(&self, index: usize) -> Result<&V> {
        match &self.content {
            PageContent::Leaf(values) => Ok(&values[index]),
            PageContent::Node(_) => bail!("value access on an internal page"),
        }
    }

    /// Entries in this subtree, including all descendants.
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Current memory estimate in bytes.
    pub fn memory(&self) -> usize {
        self.memory
    }

    /// Number of child slots, counting any hidden auxiliary ones.
    pub fn raw_child_count(&self) -> usize {
        match &self.content {
            PageContent::Leaf(_) => 0,
            PageContent::Node(children) => children.len(),
        }
    }

    pub fn child_ref(&self, index: usize) -> Result<&PageRef<K, V>> {
        match &self.content {
            PageContent::Leaf(_) => bail!("child access on a leaf page"),
            PageContent::Node(children) => Ok(&children[index]),
        }
    }

    /// Resolves the child at `index`, loading it through the map's page
    /// loader when only a position is held.
    pub fn child_page(&self, map: &Map<K, V>, index: usize) -> Result<Arc<Page<K, V>>> {
        let child = self.child_ref(index)?;
        match &child.page {
            Some(page) => Ok(page.clone()),
            None => map.read_page(child.pos),
        }
    }

    /// Searches for `key` with bisection, seeding the first probe from the
    /// last successful search on this page.
    pub fn binary_search(&self, map: &Map<K, V>, key: &K) -> SearchResult {
        let keys = &self.keys;
        let mut low: isize = 0;
        let mut high: isize = keys.len() as isize - 1;
        // the cached index minus one, so a fresh page (hint 0) starts in
        // the middle
        let mut x = self.cached_compare.load(Ordering::Relaxed) as isize - 1;
        if x < 0 || x > high {
            x = high >> 1;
        }
        while low <= high {
            match map.compare(key, &keys[x as usize]) {
                std::cmp::Ordering::Greater => low = x + 1,
                std::cmp::Ordering::Less => high = x - 1,
                std::cmp::Ordering::Equal => {
                    self.cached_compare.store(x as usize + 1, Ordering::Relaxed);
                    return SearchResult::Found(x as usize);
                }
            }
            x = (low + high) >> 1;
        }
        self.cached_compare.store(low as usize, Ordering::Relaxed);
        SearchResult::NotFound(low as usize)
    }

    /// Inserts a key/value pair at `index` in this leaf.
    pub fn insert_leaf(&mut self, map: &Map<K, V>, index: usize, key: K, value: V) -> Result<()> {
        let PageContent::Leaf(values) = &self.content else {
            bail!("insert_leaf on an internal page");
        };
        let values = values.clone();

        let delta = map.key_type().memory(&key) + map.value_type().memory(&value);

        let mut new_keys = Vec::with_capacity(self.keys.len() + 1);
        new_keys.extend_from_slice(&self.keys[..index]);
        new_keys.push(key);
        new_keys.extend_from_slice(&self.keys[index..]);
        self.keys = Arc::new(new_keys);

        let mut new_values = Vec::with_capacity(values.len() + 1);
        new_values.extend_from_slice(&values[..index]);
        new_values.push(value);
        new_values.extend_from_slice(&values[index..]);
        self.content = PageContent::Leaf(Arc::new(new_values));

        self.total_count += 1;
        self.add_memory(delta as isize);
        Ok(())
    }

    /// Inserts a key and child page at `index` in this internal page.
    pub fn insert_node(
        &mut self,
        map: &Map<K, V>,
        index: usize,
        key: K,
        child: Arc<Page<K, V>>,
    ) -> Result<()> {
        let PageContent::Node(children) = &self.content else {
            bail!("insert_node on a leaf page");
        };
        let children = children.clone();

        let delta = map.key_type().memory(&key) + PAGE_MEM_CHILD;

        let mut new_keys = Vec::with_capacity(self.keys.len() + 1);
        new_keys.extend_from_slice(&self.keys[..index]);
        new_keys.push(key);
        new_keys.extend_from_slice(&self.keys[index..]);
        self.keys = Arc::new(new_keys);

        let child_count = child.total_count();
        let mut new_children = Vec::with_capacity(children.len() + 1);
        new_children.extend_from_slice(&children[..index]);
        new_children.push(PageRef::from_page(child));
        new_children.extend_from_slice(&children[index..]);
        self.content = PageContent::Node(Arc::new(new_children));

        self.total_count += child_count;
        self.add_memory(delta as isize);
        Ok(())
    }

    /// Removes the entry (or child) at `index`. For an internal page whose
    /// last child is removed, the preceding key goes with it.
    pub fn remove(&mut self, map: &Map<K, V>, index: usize) -> Result<()> {
        let key_len = self.keys.len();
        let key_index = if index >= key_len { index - 1 } else { index };
        let key_mem = map.key_type().memory(&self.keys[key_index]) as isize;

        let mut new_keys = Vec::with_capacity(key_len - 1);
        new_keys.extend_from_slice(&self.keys[..key_index]);
        new_keys.extend_from_slice(&self.keys[key_index + 1..]);
        self.keys = Arc::new(new_keys);
        self.add_memory(-key_mem);

        match &self.content {
            PageContent::Leaf(values) => {
                let values = values.clone();
                let value_mem = map.value_type().memory(&values[index]) as isize;
                let mut new_values = Vec::with_capacity(values.len() - 1);
                new_values.extend_from_slice(&values[..index]);
                new_values.extend_from_slice(&values[index + 1..]);
                self.content = PageContent::Leaf(Arc::new(new_values));
                self.total_count -= 1;
                self.add_memory(-value_mem);
            }
            PageContent::Node(children) => {
                let children = children.clone();
                let removed_count = children[index].count;
                let mut new_children = Vec::with_capacity(children.len() - 1);
                new_children.extend_from_slice(&children[..index]);
                new_children.extend_from_slice(&children[index + 1..]);
                self.content = PageContent::Node(Arc::new(new_children));
                self.total_count -= removed_count;
                self.add_memory(-(PAGE_MEM_CHILD as isize));
            }
        }
        Ok(())
    }

    /// Replaces the key at `index`.
    pub fn set_key(&mut self, map: &Map<K, V>, index: usize, key: K) {
        let old_mem = map.key_type().memory(&self.keys[index]) as isize;
        let new_mem = map.key_type().memory(&key) as isize;
        let mut new_keys = (*self.keys).clone();
        new_keys[index] = key;
        self.keys = Arc::new(new_keys);
        self.add_memory(new_mem - old_mem);
    }

    /// Replaces the value at `index` in this leaf, returning the old value.
    pub fn set_value(&mut self, map: &Map<K, V>, index: usize, value: V) -> Result<V> {
        let PageContent::Leaf(values) = &self.content else {
            bail!("set_value on an internal page");
        };
        let old_mem = map.value_type().memory(&values[index]) as isize;
        let new_mem = map.value_type().memory(&value) as isize;
        let mut new_values = (**values).clone();
        let old = std::mem::replace(&mut new_values[index], value);
        self.content = PageContent::Leaf(Arc::new(new_values));
        self.add_memory(new_mem - old_mem);
        Ok(old)
    }

    /// Replaces the child at `index`. A no-op when the incoming child is
    /// the same page at the same position.
    pub fn set_child(&mut self, index: usize, child: Arc<Page<K, V>>) -> Result<()> {
        let PageContent::Node(children) = &self.content else {
            bail!("set_child on a leaf page");
        };
        let current = &children[index];
        let identical = current
            .page
            .as_ref()
            .map_or(false, |page| Arc::ptr_eq(page, &child))
            && current.pos == child.pos();
        if identical {
            return Ok(());
        }
        let old_count = current.count;
        let mut new_children = (**children).clone();
        let new_ref = PageRef::from_page(child);
        let new_count = new_ref.count;
        new_children[index] = new_ref;
        self.content = PageContent::Node(Arc::new(new_children));
        self.total_count = self.total_count + new_count - old_count;
        Ok(())
    }

    /// Splits this page at `at`, keeping the left half here and returning
    /// the right half as a new page at the same version. For an internal
    /// page the key at `at` belongs to neither half; the caller promotes it
    /// into the parent. For a leaf the caller promotes a clone of the
    /// right half's first key.
    pub fn split(&mut self, map: &Map<K, V>, at: usize) -> Result<Page<K, V>> {
        match &self.content {
            PageContent::Leaf(values) => {
                ensure!(at <= self.keys.len(), "leaf split index {} out of bounds", at);
                let values = values.clone();
                let right_keys = self.keys[at..].to_vec();
                let right_values = values[at..].to_vec();
                let left_keys = self.keys[..at].to_vec();
                let left_values = values[..at].to_vec();

                self.keys = Arc::new(left_keys);
                self.content = PageContent::Leaf(Arc::new(left_values));
                self.total_count = at as u64;

                let right = Page::create_leaf(map, self.version, right_keys, right_values);
                self.recalculate_memory(map);
                Ok(right)
            }
            PageContent::Node(children) => {
                ensure!(
                    at < self.keys.len(),
                    "node split index {} out of bounds for {} keys",
                    at,
                    self.keys.len()
                );
                let children = children.clone();
                let right_keys = self.keys[at + 1..].to_vec();
                let left_keys = self.keys[..at].to_vec();
                let right_children = children[at + 1..].to_vec();
                let left_children = children[..=at].to_vec();
                let left_total = left_children.iter().map(|child| child.count).sum();

                self.keys = Arc::new(left_keys);
                self.content = PageContent::Node(Arc::new(left_children));
                self.total_count = left_total;

                let right = Page::create_node(map, self.version, right_keys, right_children);
                self.recalculate_memory(map);
                Ok(right)
            }
        }
    }

    /// Removes this page and every descendant. In-memory children recurse
    /// directly; position-only leaf children are released by their
    /// class-maximum length; position-only internal children are loaded
    /// first.
    pub fn remove_all_recursive(&self, map: &Map<K, V>) -> Result<()> {
        if let PageContent::Node(children) = &self.content {
            let visible = map.child_page_count(self);
            for child in children.iter().take(visible) {
                if let Some(page) = &child.page {
                    page.remove_all_recursive(map)?;
                } else if position_type(child.pos) == PAGE_TYPE_LEAF {
                    map.remove_page(child.pos, page_max_length(child.pos));
                } else {
                    map.read_page(child.pos)?.remove_all_recursive(map)?;
                }
            }
        }
        self.remove_page(map);
        Ok(())
    }

    /// Releases this page's storage. An unsaved page defers the release via
    /// the removed-in-memory flag, which fires when write-out assigns it a
    /// position.
    pub fn remove_page(&self, map: &Map<K, V>) {
        if self.pos == 0 {
            self.removed_in_memory.store(true, Ordering::Release);
        }
        map.remove_page(self.pos, self.memory);
    }

    fn add_memory(&mut self, delta: isize) {
        self.memory = (self.memory as isize + delta) as usize;
    }

    fn compute_memory(&self, map: &Map<K, V>) -> usize {
        let mut mem = PAGE_MEM;
        for key in self.keys.iter() {
            mem += map.key_type().memory(key);
        }
        match &self.content {
            PageContent::Leaf(values) => {
                for value in values.iter() {
                    mem += map.value_type().memory(value);
                }
            }
            PageContent::Node(children) => {
                mem += children.len() * PAGE_MEM_CHILD;
            }
        }
        mem
    }

    /// Rebuilds the memory estimate from scratch.
    pub fn recalculate_memory(&mut self, map: &Map<K, V>) {
        self.memory = self.compute_memory(map);
    }

    /// Under the store's assertion mode, re-derives the entry count and
    /// memory estimate and fails on disagreement with the running values.
    pub fn verify_integrity(&self, map: &Map<K, V>) -> Result<()> {
        if !map.store().assert_integrity() {
            return Ok(());
        }
        let expected: u64 = match &self.content {
            PageContent::Leaf(_) => self.keys.len() as u64,
            PageContent::Node(children) => children.iter().map(|child| child.count).sum(),
        };
        ensure!(
            expected == self.total_count,
            "internal error: expected total count {}, got {}",
            expected,
            self.total_count
        );
        let expected_mem = self.compute_memory(map);
        ensure!(
            expected_mem == self.memory,
            "internal error: expected memory {}, got {}",
            expected_mem,
            self.memory
        );
        Ok(())
    }

    /// Serializes this page into the chunk buffer, assigns its position,
    /// and updates the chunk counters. Returns the buffer offset just past
    /// the type byte, where the child-position table begins.
    pub(crate) fn write(
        &mut self,
        map: &Map<K, V>,
        chunk: &mut Chunk,
        buff: &mut WriteBuffer,
    ) -> Result<usize> {
        ensure!(
            self.pos == 0,
            "internal error: page already stored at {:x}",
            self.pos
        );
        self.verify_integrity(map)?;

        let start = buff.position();
        let len = self.keys.len();
        let type_bits = if self.is_leaf() {
            PAGE_TYPE_LEAF
        } else {
            PAGE_TYPE_NODE
        };
        buff.put_u32(0); // page length, patched below
        buff.put_u16(0); // check value, patched below
        buff.put_var_u32(map.id());
        buff.put_var_u32(len as u32);
        let type_pos = buff.position();
        buff.put_u8(type_bits);
        if let PageContent::Node(children) = &self.content {
            // positions may still be zero here; the recursive write-out
            // patches this table once the children are assigned positions
            for child in children.iter() {
                buff.put_u64(child.pos);
            }
            for child in children.iter() {
                buff.put_var_u64(child.count);
            }
        }

        let compress_start = buff.position();
        map.key_type().write(buff, &self.keys);
        if let PageContent::Leaf(values) = &self.content {
            map.value_type().write(buff, values);
        }

        let store = map.store();
        let expanded_len = buff.position() - compress_start;
        if expanded_len > COMPRESS_MIN_PAYLOAD && store.compression_level() > 0 {
            let (compressor, compress_flag) = if store.compression_level() == 1 {
                (store.compressor_fast(), PAGE_COMPRESSED)
            } else {
                (store.compressor_high(), PAGE_COMPRESSED_HIGH)
            };
            let compressed = compressor.compress(buff.slice(compress_start, expanded_len))?;
            if compressed.len() < expanded_len {
                let added = (expanded_len - compressed.len()) as u32;
                if compressed.len() + var_u32_len(added) < expanded_len {
                    buff.put_u8_at(type_pos, type_bits | compress_flag);
                    buff.truncate(compress_start);
                    buff.put_var_u32(added);
                    buff.put_bytes(&compressed);
                }
            }
        }

        let page_length = buff.position() - start;
        let check = check_value(chunk.id)
            ^ check_value(start as u32)
            ^ check_value(page_length as u32);
        buff.put_u32_at(start, page_length as u32);
        buff.put_u16_at(start + 4, check);

        self.pos = pack_position(chunk.id, start as u32, page_length as u32, type_bits);
        chunk.add_page(self.pos);
        if self.removed_in_memory.load(Ordering::Acquire) {
            // removed before it had a position: release the live bytes in
            // the same write cycle
            chunk.remove_page(self.pos);
        }
        Ok(type_pos + 1)
    }

    /// Stores this page and every unsaved descendant, children after their
    /// parent, patching each child-position table as positions become
    /// known. Freshly positioned pages are cached; internal pages twice,
    /// which the cache takes as a promotion hint.
    pub(crate) fn write_unsaved_recursive(
        &mut self,
        map: &Map<K, V>,
        chunk: &mut Chunk,
        buff: &mut WriteBuffer,
    ) -> Result<()> {
        if self.pos != 0 {
            // already stored before
            return Ok(());
        }
        let patch = self.write(map, chunk, buff)?;
        if let PageContent::Node(children) = &mut self.content {
            let children = Arc::make_mut(children);
            for child in children.iter_mut() {
                if let Some(page) = child.page.as_mut() {
                    if page.pos() == 0 {
                        Arc::make_mut(page).write_unsaved_recursive(map, chunk, buff)?;
                    }
                    child.pos = page.pos();
                    child.count = page.total_count();
                    let memory = page.memory();
                    map.store().cache_page(child.pos, page.clone(), memory);
                    if !page.is_leaf() {
                        map.store().cache_page(child.pos, page.clone(), memory);
                    }
                }
            }
            for (i, child) in children.iter().enumerate() {
                buff.put_u64_at(patch + i * 8, child.pos);
            }
        }
        Ok(())
    }

    /// Demotes in-memory child handles to positions once the chunk holding
    /// them is durable. A child still at position 0 is a programming error.
    pub(crate) fn write_end(&mut self) -> Result<()> {
        let PageContent::Node(children) = &mut self.content else {
            return Ok(());
        };
        let children = Arc::make_mut(children);
        for child in children.iter_mut() {
            if let Some(page) = child.page.as_mut() {
                ensure!(page.pos() != 0, "internal error: page not written");
                Arc::make_mut(page).write_end()?;
                child.page = None;
            }
        }
        Ok(())
    }

    /// Parses a page from its framed bytes. `data` must start at the page
    /// frame and extend at least to the end of the page; it may extend
    /// further (the read path over-fetches to the length-class maximum).
    pub(crate) fn parse(map: &Map<K, V>, pos: u64, data: &[u8]) -> Result<Page<K, V>> {
        let chunk_id = position_chunk_id(pos);
        let offset = position_offset(pos);

        let mut header = ByteReader::new(data);
        let page_length = header.get_u32()? as usize;
        ensure!(
            page_length >= 4 && page_length <= data.len(),
            "file corrupted in chunk {}, expected page length 4..{}, got {}",
            chunk_id,
            data.len(),
            page_length
        );
        // reframe to the page, so the payload cannot bleed past its end
        let mut reader = ByteReader::new(&data[..page_length]);
        reader.take(4)?;

        let check = reader.get_u16()?;
        let map_id = reader.get_var_u32()?;
        ensure!(
            map_id == map.id(),
            "file corrupted in chunk {}, expected map id {}, got {}",
            chunk_id,
            map.id(),
            map_id
        );
        let check_test =
            check_value(chunk_id) ^ check_value(offset) ^ check_value(page_length as u32);
        ensure!(
            check == check_test,
            "file corrupted in chunk {}, expected check value {}, got {}",
            chunk_id,
            check_test,
            check
        );

        let len = reader.get_var_u32()? as usize;
        let type_byte = reader.get_u8()?;
        let node = type_byte & 1 == PAGE_TYPE_NODE;

        let mut node_children = Vec::new();
        let mut total_count = 0u64;
        if node {
            let mut positions = Vec::with_capacity(len + 1);
            for _ in 0..=len {
                positions.push(reader.get_u64()?);
            }
            node_children.reserve(len + 1);
            for child_pos in positions {
                let count = reader.get_var_u64()?;
                total_count += count;
                node_children.push(PageRef::new(None, child_pos, count));
            }
        }

        let expanded;
        let mut payload = if type_byte & PAGE_COMPRESSED != 0 {
            let compressor = if type_byte & PAGE_COMPRESSED_HIGH == PAGE_COMPRESSED_HIGH {
                map.store().compressor_high()
            } else {
                map.store().compressor_fast()
            };
            let added = reader.get_var_u32()? as usize;
            let compressed = reader.rest();
            expanded = compressor.expand(compressed, compressed.len() + added)?;
            ByteReader::new(&expanded)
        } else {
            reader
        };

        let keys = map.key_type().read(&mut payload, len)?;
        let content = if node {
            PageContent::Node(Arc::new(node_children))
        } else {
            let values = map.value_type().read(&mut payload, len)?;
            total_count = len as u64;
            PageContent::Leaf(Arc::new(values))
        };

        let mut page = Page {
            version: 0,
            pos,
            total_count,
            cached_compare: AtomicUsize::new(0),
            memory: 0,
            keys: Arc::new(keys),
            content,
            removed_in_memory: AtomicBool::new(false),
        };
        page.recalculate_memory(map);
        page.verify_integrity(map)?;
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::types::{StrType, U64Type};

    fn test_map() -> (tempfile::TempDir, Arc<Map<u64, String>>) {
        test_map_with_compression(0)
    }

    fn test_map_with_compression(level: u8) -> (tempfile::TempDir, Arc<Map<u64, String>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder()
            .path(dir.path().join("pages.db"))
            .compression_level(level)
            .assert_integrity(true)
            .open()
            .unwrap();
        let map = store
            .open_map(7, Arc::new(U64Type), Arc::new(StrType))
            .unwrap();
        (dir, map)
    }

    fn leaf(map: &Map<u64, String>, keys: &[u64]) -> Page<u64, String> {
        let values = keys.iter().map(|k| format!("v{}", k)).collect();
        Page::create_leaf(map, 1, keys.to_vec(), values)
    }

    fn write_into_fresh_chunk(
        map: &Map<u64, String>,
        page: &mut Page<u64, String>,
    ) -> WriteBuffer {
        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        page.write(map, &mut chunk, &mut buff).unwrap();
        buff
    }

    #[test]
    fn empty_leaf_roundtrip() {
        let (_dir, map) = test_map();
        let mut page = Page::create_empty(&map, 1);
        let buff = write_into_fresh_chunk(&map, &mut page);

        assert_ne!(page.pos(), 0);
        let read_back = Page::parse(&map, page.pos(), buff.written()).unwrap();
        assert_eq!(read_back.key_count(), 0);
        assert_eq!(read_back.total_count(), 0);
        assert!(read_back.is_leaf());
        assert_eq!(read_back.pos(), page.pos());
    }

    #[test]
    fn leaf_roundtrip_preserves_entries() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 20, 30]);
        let buff = write_into_fresh_chunk(&map, &mut page);

        let read_back = Page::parse(&map, page.pos(), buff.written()).unwrap();
        assert_eq!(read_back.key_count(), 3);
        assert_eq!(read_back.total_count(), 3);
        assert_eq!(*read_back.key(1), 20);
        assert_eq!(read_back.value(2).unwrap(), "v30");
    }

    #[test]
    fn compressed_roundtrip_fast_and_high() {
        for level in [1u8, 2] {
            let (_dir, map) = test_map_with_compression(level);
            // repetitive values so compression wins
            let keys: Vec<u64> = (0..50).collect();
            let values: Vec<String> = (0..50).map(|_| "abcabcabc".to_owned()).collect();
            let mut page = Page::create_leaf(&map, 1, keys, values);
            let buff = write_into_fresh_chunk(&map, &mut page);

            // type byte: length(4) + check(2) + map id(1) + key count(1)
            let type_byte = buff.written()[position_offset(page.pos()) as usize + 8];
            assert_ne!(type_byte & PAGE_COMPRESSED, 0, "level {} not compressed", level);

            let read_back = Page::parse(&map, page.pos(), buff.written()).unwrap();
            assert_eq!(read_back.key_count(), 50);
            assert_eq!(read_back.value(10).unwrap(), "abcabcabc");
        }
    }

    #[test]
    fn tiny_payload_is_never_compressed() {
        let (_dir, map) = test_map_with_compression(2);
        let mut page = leaf(&map, &[1]);
        let buff = write_into_fresh_chunk(&map, &mut page);
        let read_back = Page::parse(&map, page.pos(), buff.written()).unwrap();
        assert_eq!(read_back.value(0).unwrap(), "v1");
    }

    #[test]
    fn corrupted_check_value_fails_read() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 20]);
        let mut buff = write_into_fresh_chunk(&map, &mut page);

        // flip one byte in the check region
        let old = buff.written()[4];
        buff.put_u8_at(4, old ^ 0xFF);

        let err = Page::parse(&map, page.pos(), buff.written()).unwrap_err();
        assert!(err.to_string().contains("corrupted"));
    }

    #[test]
    fn wrong_map_id_fails_read() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10]);
        let mut buff = write_into_fresh_chunk(&map, &mut page);

        // map id 7 is a single varint byte right after the check value
        assert_eq!(buff.written()[6], 7);
        buff.put_u8_at(6, 8);

        let err = Page::parse(&map, page.pos(), buff.written()).unwrap_err();
        assert!(err.to_string().contains("map id"));
    }

    #[test]
    fn write_on_stored_page_fails() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[1]);
        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        page.write(&map, &mut chunk, &mut buff).unwrap();

        let err = page.write(&map, &mut chunk, &mut buff).unwrap_err();
        assert!(err.to_string().contains("already stored"));
    }

    #[test]
    fn binary_search_with_cached_pivot() {
        let (_dir, map) = test_map();
        let page = leaf(&map, &[1, 3, 5, 7, 9]);

        assert_eq!(page.binary_search(&map, &5), SearchResult::Found(2));
        // the previous hit seeds the next probe
        assert_eq!(page.binary_search(&map, &7), SearchResult::Found(3));
        assert_eq!(page.binary_search(&map, &4), SearchResult::NotFound(2));
        assert_eq!(page.binary_search(&map, &0), SearchResult::NotFound(0));
        assert_eq!(page.binary_search(&map, &10), SearchResult::NotFound(5));
    }

    #[test]
    fn binary_search_on_empty_page() {
        let (_dir, map) = test_map();
        let page = Page::create_empty(&map, 1);
        assert_eq!(page.binary_search(&map, &42), SearchResult::NotFound(0));
    }

    #[test]
    fn insert_leaf_keeps_order_and_counts() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 30]);
        page.insert_leaf(&map, 1, 20, "v20".to_owned()).unwrap();

        assert_eq!(page.key_count(), 3);
        assert_eq!(*page.key(1), 20);
        assert_eq!(page.total_count(), 3);
        page.verify_integrity(&map).unwrap();
    }

    #[test]
    fn leaf_split_covers_original_exactly_once() {
        let (_dir, map) = test_map();
        let mut left = Page::create_leaf(
            &map,
            1,
            vec![10, 20, 30, 40],
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
        );
        let right = left.split(&map, 2).unwrap();

        assert_eq!(left.key_count(), 2);
        assert_eq!(*left.key(0), 10);
        assert_eq!(left.value(1).unwrap(), "b");
        assert_eq!(left.total_count(), 2);

        assert_eq!(right.key_count(), 2);
        assert_eq!(*right.key(0), 30);
        assert_eq!(right.value(1).unwrap(), "d");
        assert_eq!(right.total_count(), 2);

        left.verify_integrity(&map).unwrap();
        right.verify_integrity(&map).unwrap();
    }

    fn node_with_counts(map: &Map<u64, String>, keys: &[u64], counts: &[u64]) -> Page<u64, String> {
        let children = counts
            .iter()
            .enumerate()
            .map(|(i, &count)| {
                let pos = pack_position(1, 64 + 64 * i as u32, 32, PAGE_TYPE_LEAF);
                PageRef::new(None, pos, count)
            })
            .collect();
        Page::create_node(map, 1, keys.to_vec(), children)
    }

    #[test]
    fn internal_split_promotes_middle_key() {
        let (_dir, map) = test_map();
        let mut left = node_with_counts(&map, &[10, 20, 30], &[5, 5, 5, 5]);
        assert_eq!(left.total_count(), 20);

        let promoted = left.key(1).clone();
        let right = left.split(&map, 1).unwrap();

        assert_eq!(promoted, 20);
        assert_eq!(left.key_count(), 1);
        assert_eq!(*left.key(0), 10);
        assert_eq!(left.raw_child_count(), 2);
        assert_eq!(left.total_count(), 10);

        assert_eq!(right.key_count(), 1);
        assert_eq!(*right.key(0), 30);
        assert_eq!(right.raw_child_count(), 2);
        assert_eq!(right.total_count(), 10);
    }

    #[test]
    fn remove_middle_entry_from_leaf() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 20, 30]);
        page.remove(&map, 1).unwrap();

        assert_eq!(page.key_count(), 2);
        assert_eq!(*page.key(0), 10);
        assert_eq!(*page.key(1), 30);
        assert_eq!(page.value(1).unwrap(), "v30");
        page.verify_integrity(&map).unwrap();
    }

    #[test]
    fn remove_last_child_drops_preceding_key() {
        let (_dir, map) = test_map();
        let mut page = node_with_counts(&map, &[10, 20], &[3, 3, 4]);
        // removing child 2 (== key count) removes key index 1
        page.remove(&map, 2).unwrap();

        assert_eq!(page.key_count(), 1);
        assert_eq!(*page.key(0), 10);
        assert_eq!(page.raw_child_count(), 2);
        assert_eq!(page.total_count(), 6);
        page.verify_integrity(&map).unwrap();
    }

    #[test]
    fn copy_shares_arrays_until_first_mutation() {
        let (_dir, map) = test_map();
        let original = leaf(&map, &[10, 20]);
        let mut copied = original.copy(&map, 2);

        assert_eq!(copied.version(), 2);
        assert_eq!(copied.pos(), 0);
        assert_eq!(copied.total_count(), 2);

        copied.insert_leaf(&map, 2, 30, "v30".to_owned()).unwrap();

        // the original observed nothing
        assert_eq!(original.key_count(), 2);
        assert_eq!(original.value(1).unwrap(), "v20");
        assert_eq!(copied.key_count(), 3);
    }

    #[test]
    fn set_value_returns_old_and_tracks_memory() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10]);
        let old = page.set_value(&map, 0, "replacement".to_owned()).unwrap();

        assert_eq!(old, "v10");
        assert_eq!(page.value(0).unwrap(), "replacement");
        page.verify_integrity(&map).unwrap();
    }

    #[test]
    fn set_key_tracks_memory() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 20]);
        page.set_key(&map, 0, 5);
        assert_eq!(*page.key(0), 5);
        page.verify_integrity(&map).unwrap();
    }

    #[test]
    fn set_child_with_identical_child_is_a_noop() {
        let (_dir, map) = test_map();
        let child = Arc::new(leaf(&map, &[5]));
        let mut parent = Page::create_node(
            &map,
            1,
            vec![10],
            vec![
                PageRef::from_page(child.clone()),
                PageRef::new(None, pack_position(1, 64, 32, PAGE_TYPE_LEAF), 1),
            ],
        );
        let before = parent.total_count();
        parent.set_child(0, child).unwrap();
        assert_eq!(parent.total_count(), before);
    }

    #[test]
    fn memory_estimate_matches_recalculation_after_mutations() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10, 20, 30]);
        page.insert_leaf(&map, 3, 40, "v40".to_owned()).unwrap();
        page.remove(&map, 0).unwrap();
        page.set_value(&map, 0, "much longer value than before".to_owned())
            .unwrap();
        page.set_key(&map, 1, 25);

        let tracked = page.memory();
        page.recalculate_memory(&map);
        assert_eq!(tracked, page.memory());
    }

    #[test]
    fn write_then_patch_fills_child_positions() {
        let (_dir, map) = test_map();
        let left = Arc::new(leaf(&map, &[10]));
        let right = Arc::new(leaf(&map, &[20]));
        let mut root = Page::create_node(
            &map,
            1,
            vec![20],
            vec![PageRef::from_page(left), PageRef::from_page(right)],
        );

        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        root.write_unsaved_recursive(&map, &mut chunk, &mut buff)
            .unwrap();

        assert_ne!(root.pos(), 0);
        assert_eq!(chunk.page_count, 3);

        // the root's on-disk child table must point at the children's
        // assigned positions
        let parsed = Page::parse(&map, root.pos(), buff.written()).unwrap();
        let left_pos = parsed.child_ref(0).unwrap().pos();
        let right_pos = parsed.child_ref(1).unwrap().pos();
        assert_ne!(left_pos, 0);
        assert_ne!(right_pos, 0);
        assert_eq!(left_pos, root.child_ref(0).unwrap().pos());
        assert_eq!(right_pos, root.child_ref(1).unwrap().pos());
        assert_eq!(parsed.total_count(), 2);
    }

    #[test]
    fn write_end_drops_in_memory_handles() {
        let (_dir, map) = test_map();
        let left = Arc::new(leaf(&map, &[10]));
        let mut root = Page::create_node(
            &map,
            1,
            vec![20],
            vec![
                PageRef::from_page(left),
                PageRef::from_page(Arc::new(leaf(&map, &[20]))),
            ],
        );

        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        root.write_unsaved_recursive(&map, &mut chunk, &mut buff)
            .unwrap();
        root.write_end().unwrap();

        assert!(root.child_ref(0).unwrap().page().is_none());
        assert!(root.child_ref(1).unwrap().page().is_none());
        assert_ne!(root.child_ref(0).unwrap().pos(), 0);
    }

    #[test]
    fn write_end_rejects_unwritten_children() {
        let (_dir, map) = test_map();
        let mut root = Page::create_node(
            &map,
            1,
            vec![20],
            vec![
                PageRef::from_page(Arc::new(leaf(&map, &[10]))),
                PageRef::from_page(Arc::new(leaf(&map, &[20]))),
            ],
        );

        let err = root.write_end().unwrap_err();
        assert!(err.to_string().contains("not written"));
    }

    #[test]
    fn removed_in_memory_folds_into_write_cycle() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[10]);
        page.remove_page(&map);

        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        page.write(&map, &mut chunk, &mut buff).unwrap();

        assert_eq!(chunk.page_count, 1);
        assert_eq!(chunk.page_count_live, 0);
    }

    #[test]
    fn equality_is_position_based_once_stored() {
        let (_dir, map) = test_map();
        let mut a = leaf(&map, &[1]);
        let b = leaf(&map, &[1]);
        assert_ne!(a, b);

        let mut chunk = Chunk::new(1, 1);
        let mut buff = WriteBuffer::new();
        a.write(&map, &mut chunk, &mut buff).unwrap();
        let a_clone = a.clone();
        assert_eq!(a, a_clone);
    }

    #[test]
    fn verify_integrity_catches_count_drift() {
        let (_dir, map) = test_map();
        let mut page = leaf(&map, &[1, 2]);
        page.total_count = 5;
        let err = page.verify_integrity(&map).unwrap_err();
        assert!(err.to_string().contains("internal error"));
    }
}
