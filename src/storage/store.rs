//! # Store
//!
//! The store owns the single append-only file, the chunk registry, the page
//! cache, and the commit protocol that turns a batch of in-memory page
//! mutations into one durable chunk.
//!
//! ## File Layout
//!
//! ```text
//! offset 0     +------------------------+
//!              | store header (128 B)   |  rewritten on every commit
//! offset 128   +------------------------+
//!              | chunk 1                |
//!              |   header (64 B)        |
//!              |   pages ...            |
//!              |   root table           |
//!              +------------------------+
//!              | chunk 2                |
//!              |   ...                  |
//!              +------------------------+
//! ```
//!
//! Chunks are never modified in place. Each chunk header points at the
//! previous chunk, and the store header points at the newest, so opening a
//! store walks the chain backwards to rebuild the chunk registry and reads
//! the newest chunk's root table to recover every map's root.
//!
//! ## Commit Protocol
//!
//! `commit` drives the two-phase page write-out:
//!
//! 1. Take the commit gate exclusively (writers hold its shared side for
//!    each mutation, so a commit sees quiescent maps).
//! 2. Serialize every map root with unsaved pages into one `WriteBuffer`
//!    chunk, depth-first, patching child-position tables as positions are
//!    assigned.
//! 3. Append the chunk, fsync, then run `write_end` on each map to drop
//!    in-memory child handles in favor of positions.
//! 4. Register the chunk, persist the new store header, bump the version
//!    counter, and reset the unsaved-memory estimate.
//!
//! ## Memory Accounting
//!
//! Every page created in memory registers its estimate here; removing an
//! unsaved page releases it. The running total tells callers how much
//! un-persisted page data has accumulated so they can decide when to
//! commit. Removing a stored page instead decrements its chunk's live
//! counters, which is what space reclamation consumes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use eyre::{ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use zerocopy::IntoBytes;

use crate::btree::page::Page;
use crate::btree::page_children::PageChildren;
use crate::btree::Map;
use crate::config::{DEFAULT_CACHE_SIZE, DEFAULT_PAGE_SPLIT_SIZE};
use crate::encoding::position;
use crate::encoding::position::{PAGE_LARGE, PAGE_LARGE_PREFETCH};
use crate::encoding::WriteBuffer;
use crate::storage::cache::{CachedPage, PageCache};
use crate::storage::chunk::Chunk;
use crate::storage::compress::{Compressor, Deflate};
use crate::storage::file_store::FileStore;
use crate::storage::headers::{
    ChunkHeader, RootEntry, StoreHeader, CHUNK_HEADER_SIZE, ROOT_ENTRY_SIZE, STORE_HEADER_SIZE,
};
use crate::types::DataType;

/// Commit-side view of an open map, independent of its key/value types.
pub(crate) trait MapCommit: Send + Sync {
    fn map_id(&self) -> u32;
    /// True when the map's root has not been assigned a position.
    fn has_unsaved(&self) -> bool;
    fn current_root_pos(&self) -> u64;
    /// Serializes the root subtree into the chunk, returning the root position.
    fn store_root(&self, chunk: &mut Chunk, buff: &mut WriteBuffer) -> Result<u64>;
    /// Drops in-memory child handles now that the chunk is durable.
    fn finish_store(&self) -> Result<()>;
}

/// Builder for configuring and opening a [`Store`].
///
/// Use `Store::builder()` to create one, then chain configuration methods
/// before calling `open()`.
pub struct StoreBuilder {
    path: Option<PathBuf>,
    cache_size: usize,
    compression_level: u8,
    page_split_size: usize,
    assert_integrity: bool,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            cache_size: DEFAULT_CACHE_SIZE,
            compression_level: 0,
            page_split_size: DEFAULT_PAGE_SPLIT_SIZE,
            assert_integrity: cfg!(debug_assertions),
        }
    }

    /// Path of the store file; created if absent.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Page cache budget in bytes. Zero disables caching.
    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Compression level for page payloads: 0 none, 1 fast, 2 high.
    pub fn compression_level(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    /// Memory estimate above which pages are split during writes.
    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = bytes;
        self
    }

    /// Re-derives page invariants (entry counts, memory estimates) on reads
    /// and writes, failing loudly on disagreement. On by default in debug
    /// builds.
    pub fn assert_integrity(mut self, enabled: bool) -> Self {
        self.assert_integrity = enabled;
        self
    }

    pub fn open(self) -> Result<Store> {
        let path = self.path.ok_or_else(|| eyre::eyre!("store path not set"))?;
        ensure!(
            self.compression_level <= 2,
            "invalid compression level {} (expected 0, 1 or 2)",
            self.compression_level
        );
        ensure!(
            self.page_split_size >= 256,
            "page split size {} too small to hold a single entry",
            self.page_split_size
        );

        let file = FileStore::open(&path)?;
        let mut chunks = HashMap::new();
        let mut saved_roots = HashMap::new();
        let version;
        let mut last_chunk = (0u32, 0u64);

        if file.size() == 0 {
            version = 1;
            let header = StoreHeader::new(version, 0, 0);
            file.write_fully(0, header.as_bytes())?;
            file.sync()?;
        } else {
            let bytes = file.read_fully(0, STORE_HEADER_SIZE)?;
            let header = StoreHeader::from_bytes(&bytes)?;
            version = header.version();
            last_chunk = (header.last_chunk_id(), header.last_chunk_pos());

            // rebuild the chunk registry by walking the header chain
            // backwards; only the newest chunk's root table matters
            let mut pos = header.last_chunk_pos();
            let mut newest = true;
            while pos != 0 {
                let header_bytes = file.read_fully(pos, CHUNK_HEADER_SIZE)?;
                let chunk_header = ChunkHeader::from_bytes(&header_bytes)?;
                if newest {
                    let count = chunk_header.root_count() as usize;
                    let table_len = count * ROOT_ENTRY_SIZE;
                    let table_pos = pos + chunk_header.len() - table_len as u64;
                    let table = file.read_fully(table_pos, table_len)?;
                    for entry_bytes in table.chunks_exact(ROOT_ENTRY_SIZE) {
                        let entry = RootEntry::from_bytes(entry_bytes)?;
                        saved_roots.insert(entry.map_id(), entry.root_pos());
                    }
                    newest = false;
                }
                let chunk = Chunk::from_header(&chunk_header, pos);
                pos = chunk_header.prev_chunk_pos();
                chunks.insert(chunk.id, chunk);
            }
        }

        Ok(Store {
            inner: Arc::new(StoreInner {
                file,
                cache: PageCache::new(self.cache_size),
                chunks: RwLock::new(chunks),
                maps: Mutex::new(Vec::new()),
                saved_roots: Mutex::new(saved_roots),
                commit_gate: RwLock::new(()),
                version: AtomicU64::new(version),
                last_chunk: Mutex::new(last_chunk),
                unsaved_memory: AtomicUsize::new(0),
                compression_level: self.compression_level,
                compressor_fast: Deflate::fast(),
                compressor_high: Deflate::high(),
                page_split_size: self.page_split_size,
                assert_integrity: self.assert_integrity,
            }),
        })
    }
}

struct StoreInner {
    file: FileStore,
    cache: PageCache,
    chunks: RwLock<HashMap<u32, Chunk>>,
    maps: Mutex<Vec<Weak<dyn MapCommit>>>,
    saved_roots: Mutex<HashMap<u32, u64>>,
    /// Writers hold the shared side per mutation; commit takes it
    /// exclusively so the two-phase write-out never observes a half-applied
    /// operation.
    commit_gate: RwLock<()>,
    version: AtomicU64,
    /// (id, file position) of the newest committed chunk.
    last_chunk: Mutex<(u32, u64)>,
    unsaved_memory: AtomicUsize,
    compression_level: u8,
    compressor_fast: Deflate,
    compressor_high: Deflate,
    page_split_size: usize,
    assert_integrity: bool,
}

/// Handle to an open store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::new()
    }

    /// Opens a store at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Store> {
        Self::builder().path(path).open()
    }

    /// Opens the map with the given id, restoring its committed root if one
    /// exists. A map id can be open at most once per store.
    pub fn open_map<K, V>(
        &self,
        id: u32,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
    ) -> Result<Arc<Map<K, V>>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let mut maps = self.inner.maps.lock();
        maps.retain(|weak| weak.strong_count() > 0);
        let already_open = maps
            .iter()
            .filter_map(|weak| weak.upgrade())
            .any(|map| map.map_id() == id);
        ensure!(!already_open, "map {} is already open", id);

        let saved_root = self
            .inner
            .saved_roots
            .lock()
            .get(&id)
            .copied()
            .filter(|&pos| pos != 0);
        let map = Map::open(self.clone(), id, key_type, value_type, saved_root)?;
        let commit_view: Arc<dyn MapCommit> = map.clone();
        maps.push(Arc::downgrade(&commit_view));
        Ok(map)
    }

    /// Writes all unsaved pages of every open map into a new chunk, makes it
    /// durable, and returns the version that was committed. A no-op (and no
    /// new chunk) when nothing changed since the last commit.
    pub fn commit(&self) -> Result<u64> {
        let _gate = self.inner.commit_gate.write();

        let maps: Vec<Arc<dyn MapCommit>> = {
            let mut registry = self.inner.maps.lock();
            registry.retain(|weak| weak.strong_count() > 0);
            registry.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        let version = self.current_version();
        if !maps.iter().any(|map| map.has_unsaved()) {
            return Ok(version);
        }

        let (last_id, last_pos) = *self.inner.last_chunk.lock();
        let chunk_id = last_id + 1;
        ensure!(chunk_id < 1 << 26, "chunk id space exhausted");

        let mut chunk = Chunk::new(chunk_id, version);
        let mut buff = WriteBuffer::with_capacity(64 * 1024);
        buff.advance(CHUNK_HEADER_SIZE);

        let mut roots = Vec::with_capacity(maps.len());
        for map in &maps {
            let root_pos = if map.has_unsaved() {
                map.store_root(&mut chunk, &mut buff)?
            } else {
                map.current_root_pos()
            };
            roots.push(RootEntry::new(map.map_id(), root_pos));
        }
        for entry in &roots {
            buff.put_bytes(entry.as_bytes());
        }

        chunk.len = buff.position() as u64;
        chunk.file_pos = self.inner.file.size();
        let header = ChunkHeader::new(&chunk, last_pos, roots.len() as u32);
        buff.put_bytes_at(0, header.as_bytes());

        self.inner.file.write_fully(chunk.file_pos, buff.written())?;
        self.inner.file.sync()?;

        // the chunk must be resolvable before write_end demotes in-memory
        // child handles to positions, or a concurrent reader could miss
        self.inner.chunks.write().insert(chunk.id, chunk.clone());
        for map in &maps {
            map.finish_store()?;
        }

        {
            let mut saved = self.inner.saved_roots.lock();
            for entry in &roots {
                saved.insert(entry.map_id(), entry.root_pos());
            }
        }
        *self.inner.last_chunk.lock() = (chunk.id, chunk.file_pos);
        let new_version = version + 1;
        let store_header = StoreHeader::new(new_version, chunk.file_pos, chunk.id);
        self.inner.file.write_fully(0, store_header.as_bytes())?;
        self.inner.file.sync()?;
        self.inner.version.store(new_version, Ordering::Release);
        self.inner.unsaved_memory.store(0, Ordering::Release);

        Ok(version)
    }

    /// Commits outstanding changes and consumes the handle.
    pub fn close(self) -> Result<()> {
        self.commit()?;
        Ok(())
    }

    /// The version the next mutation writes under.
    pub fn current_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Estimated bytes of page data not yet committed.
    pub fn unsaved_memory(&self) -> usize {
        self.inner.unsaved_memory.load(Ordering::Acquire)
    }

    pub fn compression_level(&self) -> u8 {
        self.inner.compression_level
    }

    pub fn compressor_fast(&self) -> &dyn Compressor {
        &self.inner.compressor_fast
    }

    pub fn compressor_high(&self) -> &dyn Compressor {
        &self.inner.compressor_high
    }

    pub fn page_split_size(&self) -> usize {
        self.inner.page_split_size
    }

    pub fn assert_integrity(&self) -> bool {
        self.inner.assert_integrity
    }

    pub fn cache(&self) -> &PageCache {
        &self.inner.cache
    }

    /// Snapshot of a chunk's accounting, if the chunk exists.
    pub fn chunk(&self, id: u32) -> Option<Chunk> {
        self.inner.chunks.read().get(&id).cloned()
    }

    /// Header-only read of the page at `pos`, yielding its child-position
    /// projection for garbage collection. Returns `None` for leaf pages.
    pub fn read_page_children(&self, map_id: u32, pos: u64) -> Result<Option<PageChildren>> {
        let bytes = self.read_page_bytes(pos)?;
        PageChildren::parse(map_id, pos, &bytes)
    }

    pub(crate) fn commit_gate_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.commit_gate.read()
    }

    pub(crate) fn register_unsaved_page(&self, memory: usize) {
        self.inner.unsaved_memory.fetch_add(memory, Ordering::AcqRel);
    }

    /// Releases the page at `pos`: unsaved pages give back their registered
    /// memory, stored pages decrement their chunk's live counters.
    pub(crate) fn remove_page(&self, pos: u64, memory: usize) {
        if pos == 0 {
            let _ = self
                .inner
                .unsaved_memory
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(memory))
                });
            return;
        }
        let mut chunks = self.inner.chunks.write();
        if let Some(chunk) = chunks.get_mut(&position::position_chunk_id(pos)) {
            chunk.remove_page(pos);
        }
    }

    pub(crate) fn cache_page(&self, pos: u64, page: CachedPage, memory: usize) {
        self.inner.cache.insert(pos, page, memory);
    }

    /// Reads the page at `pos` for `map`, going through the page cache.
    pub(crate) fn read_page<K, V>(&self, map: &Map<K, V>, pos: u64) -> Result<Arc<Page<K, V>>>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        ensure!(pos != 0, "internal error: read of unsaved page position");
        if let Some(hit) = self.inner.cache.get(pos) {
            if let Ok(page) = hit.downcast::<Page<K, V>>() {
                return Ok(page);
            }
        }
        let bytes = self.read_page_bytes(pos)?;
        let page = Arc::new(Page::parse(map, pos, &bytes)?);
        self.cache_page(pos, page.clone(), page.memory());
        Ok(page)
    }

    /// Fetches the framed bytes of the page at `pos`, resolving the length
    /// from the position's length class (with the oversized-page fallback)
    /// and clamping to the chunk end.
    fn read_page_bytes(&self, pos: u64) -> Result<Vec<u8>> {
        let chunk_id = position::position_chunk_id(pos);
        let (file_pos, max_pos) = {
            let chunks = self.inner.chunks.read();
            let chunk = chunks.get(&chunk_id).ok_or_else(|| {
                eyre::eyre!("file corrupted: unknown chunk {} for position {:x}", chunk_id, pos)
            })?;
            (
                chunk.file_pos + position::position_offset(pos) as u64,
                chunk.file_pos + chunk.len,
            )
        };
        ensure!(
            file_pos < max_pos,
            "file corrupted: position {:x} beyond the end of chunk {}",
            pos,
            chunk_id
        );

        let mut max_length = position::page_max_length(pos);
        if max_length == PAGE_LARGE {
            // oversized page: the real length lives in the page's own frame
            let prefetch = PAGE_LARGE_PREFETCH.min((max_pos - file_pos) as usize);
            ensure!(
                prefetch >= 4,
                "file corrupted: oversized page at {:x} truncated by chunk end",
                pos
            );
            let head = self.inner.file.read_fully(file_pos, prefetch)?;
            max_length = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        }
        let length = max_length.min((max_pos - file_pos) as usize);
        ensure!(
            length >= 4,
            "file corrupted in chunk {}: page length {} out of range",
            chunk_id,
            length
        );
        self.inner.file.read_fully(file_pos, length)
    }
}
