//! # Map Container
//!
//! A `Map<K, V>` is one copy-on-write B-tree inside a store: it owns the
//! current root page, the key/value codecs, and the write path that keeps
//! the tree balanced. Everything a page needs from the outside world — the
//! comparator, memory estimation, the page loader, storage release — is
//! provided here, so pages stay free of type-specific logic.
//!
//! ## Write Path
//!
//! Mutations run under the map's root lock (one writer per map) while
//! holding the store's commit gate shared, so a commit never observes a
//! half-applied operation. Every mutation copies the root to the current
//! store version and descends; pages along the path are copied before they
//! are touched, so concurrent readers continue traversing the previous
//! root unimpeded.
//!
//! Splits happen on the way down: any page whose memory estimate exceeds
//! the store's page split size is divided before descending into it, which
//! guarantees there is always room to promote a key into the parent.
//!
//! ## Read Path
//!
//! `get` and iteration clone the root `Arc` and walk the snapshot without
//! any locking. Position-only child references are resolved through the
//! store's page cache.

use std::sync::Arc;

use eyre::Result;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::btree::page::{Page, PageRef, SearchResult};
use crate::encoding::WriteBuffer;
use crate::storage::{Chunk, MapCommit, Store};
use crate::types::DataType;

/// One B-tree map of a store.
pub struct Map<K, V> {
    id: u32,
    store: Store,
    key_type: Arc<dyn DataType<K>>,
    value_type: Arc<dyn DataType<V>>,
    root: RwLock<Arc<Page<K, V>>>,
}

impl<K, V> Map<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn open(
        store: Store,
        id: u32,
        key_type: Arc<dyn DataType<K>>,
        value_type: Arc<dyn DataType<V>>,
        saved_root: Option<u64>,
    ) -> Result<Arc<Self>> {
        let version = store.current_version();
        let map = Arc::new(Self {
            id,
            store,
            key_type,
            value_type,
            root: RwLock::new(Arc::new(Page::empty_leaf(version))),
        });
        match saved_root {
            Some(pos) => {
                let root = map.read_page(pos)?;
                *map.root.write() = root;
            }
            None => {
                // a brand-new map starts with an unsaved empty root
                let memory = map.root.read().memory();
                map.store.register_unsaved_page(memory);
            }
        }
        Ok(map)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn key_type(&self) -> &dyn DataType<K> {
        &*self.key_type
    }

    pub fn value_type(&self) -> &dyn DataType<V> {
        &*self.value_type
    }

    /// Compares two keys with the map's key codec.
    pub fn compare(&self, a: &K, b: &K) -> std::cmp::Ordering {
        self.key_type.compare(a, b)
    }

    /// Number of children of `page` visible to subtree walks. Spatial map
    /// variants keep a trailing auxiliary child that must be skipped; the
    /// base map exposes every child.
    pub fn child_page_count(&self, page: &Page<K, V>) -> usize {
        page.raw_child_count()
    }

    /// Loads the page at `pos` through the store's page cache.
    pub fn read_page(&self, pos: u64) -> Result<Arc<Page<K, V>>> {
        self.store.read_page(self, pos)
    }

    /// Releases the page at `pos`; see `Store::remove_page`.
    pub(crate) fn remove_page(&self, pos: u64, memory: usize) {
        self.store.remove_page(pos, memory);
    }

    /// Total number of entries.
    pub fn len(&self) -> u64 {
        self.root.read().total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current root page snapshot.
    pub fn root(&self) -> Arc<Page<K, V>> {
        self.root.read().clone()
    }

    /// Looks up `key`, traversing a snapshot of the tree without locking.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let root = self.root();
        self.get_from(&root, key)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn get_from(&self, root: &Arc<Page<K, V>>, key: &K) -> Result<Option<V>> {
        let mut page = root.clone();
        loop {
            match page.binary_search(self, key) {
                SearchResult::Found(index) => {
                    if page.is_leaf() {
                        return Ok(Some(page.value(index)?.clone()));
                    }
                    page = page.child_page(self, index + 1)?;
                }
                SearchResult::NotFound(index) => {
                    if page.is_leaf() {
                        return Ok(None);
                    }
                    page = page.child_page(self, index)?;
                }
            }
        }
    }

    /// Inserts or replaces `key`, returning the previous value if any.
    pub fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let _gate = self.store.commit_gate_shared();
        let mut guard = self.root.write();
        let version = self.store.current_version();
        let mut root = self.cow_for_write(&guard, version);

        if root.memory() > self.store.page_split_size() && root.key_count() > 1 {
            // grow the tree by one level: the old root splits and a fresh
            // root adopts both halves
            let at = root.key_count() / 2;
            let split_key = root.key(at).clone();
            let right = root.split(self, at)?;
            let children = vec![
                PageRef::from_page(Arc::new(root)),
                PageRef::from_page(Arc::new(right)),
            ];
            root = Page::create_node(self, version, vec![split_key], children);
        }

        let previous = self.put_rec(&mut root, version, key, value)?;
        *guard = Arc::new(root);
        Ok(previous)
    }

    fn put_rec(
        &self,
        page: &mut Page<K, V>,
        version: u64,
        key: K,
        value: V,
    ) -> Result<Option<V>> {
        let index = page.binary_search(self, &key);
        if page.is_leaf() {
            return match index {
                SearchResult::Found(i) => Ok(Some(page.set_value(self, i, value)?)),
                SearchResult::NotFound(i) => {
                    page.insert_leaf(self, i, key, value)?;
                    Ok(None)
                }
            };
        }

        let child_index = match index {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        };
        let child_arc = page.child_page(self, child_index)?;
        let mut child = self.cow_for_write(&child_arc, version);
        drop(child_arc);

        if child.memory() > self.store.page_split_size() && child.key_count() > 1 {
            // split on the way down, then redo this level: the target key
            // may belong to either half
            let at = child.key_count() / 2;
            let split_key = child.key(at).clone();
            let right = child.split(self, at)?;
            page.set_child(child_index, Arc::new(right))?;
            page.insert_node(self, child_index, split_key, Arc::new(child))?;
            return self.put_rec(page, version, key, value);
        }

        let previous = self.put_rec(&mut child, version, key, value)?;
        page.set_child(child_index, Arc::new(child))?;
        Ok(previous)
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let _gate = self.store.commit_gate_shared();
        let mut guard = self.root.write();
        // the copy-on-write descent below assumes the key exists on its
        // path; a miss would strand speculative page copies
        if self.get_from(&guard, key)?.is_none() {
            return Ok(None);
        }
        let version = self.store.current_version();
        let mut root = self.cow_for_write(&guard, version);
        let previous = self.remove_rec(&mut root, version, key)?;

        if !root.is_leaf() && root.total_count() == 0 {
            // the whole tree emptied out: release the chain of empty pages
            // and start over from an empty leaf
            root.remove_all_recursive(self)?;
            root = Page::create_empty(self, version);
        }

        // a keyless internal root has a single child; the tree shrinks by
        // one level
        while !root.is_leaf() && root.key_count() == 0 {
            let child = root.child_page(self, 0)?;
            root.remove_page(self);
            root = match Arc::try_unwrap(child) {
                Ok(page) => page,
                Err(shared) => Page::clone(&shared),
            };
        }

        *guard = Arc::new(root);
        Ok(previous)
    }

    fn remove_rec(&self, page: &mut Page<K, V>, version: u64, key: &K) -> Result<Option<V>> {
        let index = page.binary_search(self, key);
        if page.is_leaf() {
            return match index {
                SearchResult::Found(i) => {
                    let old = page.value(i)?.clone();
                    page.remove(self, i)?;
                    Ok(Some(old))
                }
                SearchResult::NotFound(_) => Ok(None),
            };
        }

        let child_index = match index {
            SearchResult::Found(i) => i + 1,
            SearchResult::NotFound(i) => i,
        };
        let child_arc = page.child_page(self, child_index)?;
        let mut child = self.cow_for_write(&child_arc, version);
        drop(child_arc);

        let previous = self.remove_rec(&mut child, version, key)?;
        if child.total_count() == 0 {
            if page.key_count() == 0 {
                // a keyless page has a single child and no key to unlink
                // with; keep the empty child and hand the emptiness up
                page.set_child(child_index, Arc::new(child))?;
            } else {
                // the child emptied out: unlink it and release its storage
                page.remove(self, child_index)?;
                child.remove_all_recursive(self)?;
            }
        } else {
            page.set_child(child_index, Arc::new(child))?;
        }
        Ok(previous)
    }

    /// Removes every entry, releasing the whole subtree's storage.
    pub fn clear(&self) -> Result<()> {
        let _gate = self.store.commit_gate_shared();
        let mut guard = self.root.write();
        let version = self.store.current_version();
        guard.remove_all_recursive(self)?;
        *guard = Arc::new(Page::create_empty(self, version));
        Ok(())
    }

    /// In-order iterator over a snapshot of the map.
    pub fn iter(&self) -> Cursor<'_, K, V> {
        let mut stack = SmallVec::new();
        stack.push((self.root(), 0usize));
        Cursor { map: self, stack }
    }

    /// A page for the writer: a full copy when the page belongs to an older
    /// version (superseding it), or a cheap rewrap when it is already at
    /// the write version but shared with concurrent readers.
    fn cow_for_write(&self, page: &Arc<Page<K, V>>, version: u64) -> Page<K, V> {
        if page.version() < version {
            page.copy(self, version)
        } else {
            Page::clone(page)
        }
    }
}

impl<K, V> MapCommit for Map<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn map_id(&self) -> u32 {
        self.id
    }

    fn has_unsaved(&self) -> bool {
        self.root.read().pos() == 0
    }

    fn current_root_pos(&self) -> u64 {
        self.root.read().pos()
    }

    fn store_root(&self, chunk: &mut Chunk, buff: &mut WriteBuffer) -> Result<u64> {
        let mut guard = self.root.write();
        Arc::make_mut(&mut *guard).write_unsaved_recursive(self, chunk, buff)?;
        let pos = guard.pos();
        let memory = guard.memory();
        self.store.cache_page(pos, guard.clone(), memory);
        if !guard.is_leaf() {
            self.store.cache_page(pos, guard.clone(), memory);
        }
        Ok(pos)
    }

    fn finish_store(&self) -> Result<()> {
        let mut guard = self.root.write();
        Arc::make_mut(&mut *guard).write_end()
    }
}

/// In-order cursor over one root snapshot. Pages are resolved lazily, so
/// iteration can fail on I/O; items are therefore `Result`s.
pub struct Cursor<'a, K, V> {
    map: &'a Map<K, V>,
    stack: SmallVec<[(Arc<Page<K, V>>, usize); 8]>,
}

impl<K, V> Iterator for Cursor<'_, K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (page, index) = {
                let entry = self.stack.last_mut()?;
                let index = entry.1;
                entry.1 += 1;
                (entry.0.clone(), index)
            };
            if page.is_leaf() {
                if index < page.key_count() {
                    let key = page.key(index).clone();
                    return Some(page.value(index).map(|value| (key, value.clone())));
                }
                self.stack.pop();
            } else if index < page.raw_child_count() {
                match page.child_page(self.map, index) {
                    Ok(child) => self.stack.push((child, 0)),
                    Err(err) => return Some(Err(err)),
                }
            } else {
                self.stack.pop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use crate::types::{StrType, U64Type};

    fn small_page_map() -> (tempfile::TempDir, Store, Arc<Map<u64, String>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::builder()
            .path(dir.path().join("map.db"))
            // tiny split threshold so a few hundred entries build a real tree
            .page_split_size(512)
            .assert_integrity(true)
            .open()
            .unwrap();
        let map = store
            .open_map(1, Arc::new(U64Type), Arc::new(StrType))
            .unwrap();
        (dir, store, map)
    }

    #[test]
    fn put_get_single_entry() {
        let (_dir, _store, map) = small_page_map();
        assert_eq!(map.put(1, "one".to_owned()).unwrap(), None);
        assert_eq!(map.get(&1).unwrap().as_deref(), Some("one"));
        assert_eq!(map.get(&2).unwrap(), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn put_replaces_and_returns_previous() {
        let (_dir, _store, map) = small_page_map();
        map.put(1, "one".to_owned()).unwrap();
        let old = map.put(1, "uno".to_owned()).unwrap();
        assert_eq!(old.as_deref(), Some("one"));
        assert_eq!(map.get(&1).unwrap().as_deref(), Some("uno"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn many_inserts_build_a_multi_level_tree() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..500u64 {
            map.put(i, format!("value-{}", i)).unwrap();
        }
        assert_eq!(map.len(), 500);
        assert!(!map.root().is_leaf(), "expected the root to have split");
        for i in 0..500u64 {
            assert_eq!(
                map.get(&i).unwrap().as_deref(),
                Some(format!("value-{}", i).as_str()),
                "missing key {}",
                i
            );
        }
    }

    #[test]
    fn inserts_in_reverse_order_stay_sorted() {
        let (_dir, _store, map) = small_page_map();
        for i in (0..200u64).rev() {
            map.put(i, i.to_string()).unwrap();
        }
        let keys: Vec<u64> = map.iter().map(|kv| kv.unwrap().0).collect();
        let expected: Vec<u64> = (0..200).collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn iteration_yields_entries_in_key_order() {
        let (_dir, _store, map) = small_page_map();
        for &i in &[5u64, 1, 9, 3, 7] {
            map.put(i, format!("v{}", i)).unwrap();
        }
        let entries: Vec<(u64, String)> = map.iter().map(|kv| kv.unwrap()).collect();
        assert_eq!(
            entries,
            vec![
                (1, "v1".to_owned()),
                (3, "v3".to_owned()),
                (5, "v5".to_owned()),
                (7, "v7".to_owned()),
                (9, "v9".to_owned()),
            ]
        );
    }

    #[test]
    fn remove_missing_key_is_none() {
        let (_dir, _store, map) = small_page_map();
        map.put(1, "one".to_owned()).unwrap();
        assert_eq!(map.remove(&2).unwrap(), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_returns_value_and_shrinks() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..300u64 {
            map.put(i, format!("v{}", i)).unwrap();
        }
        for i in (0..300u64).step_by(2) {
            assert_eq!(
                map.remove(&i).unwrap().as_deref(),
                Some(format!("v{}", i).as_str())
            );
        }
        assert_eq!(map.len(), 150);
        for i in 0..300u64 {
            let expect = i % 2 == 1;
            assert_eq!(map.contains_key(&i).unwrap(), expect, "key {}", i);
        }
    }

    #[test]
    fn remove_everything_collapses_to_empty_leaf() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..300u64 {
            map.put(i, "x".to_owned()).unwrap();
        }
        for i in 0..300u64 {
            map.remove(&i).unwrap();
        }
        assert_eq!(map.len(), 0);
        assert!(map.root().is_leaf());
    }

    #[test]
    fn clear_resets_the_map() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..300u64 {
            map.put(i, "x".to_owned()).unwrap();
        }
        map.clear().unwrap();
        assert!(map.is_empty());
        assert_eq!(map.get(&5).unwrap(), None);
        map.put(5, "back".to_owned()).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn readers_keep_their_snapshot_across_writes() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..50u64 {
            map.put(i, "old".to_owned()).unwrap();
        }
        let snapshot = map.root();
        for i in 0..50u64 {
            map.put(i, "new".to_owned()).unwrap();
        }
        // the old root still serves the old values
        assert_eq!(
            map.get_from(&snapshot, &25).unwrap().as_deref(),
            Some("old")
        );
        assert_eq!(map.get(&25).unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn commit_and_read_back_through_positions() {
        let (_dir, store, map) = small_page_map();
        for i in 0..300u64 {
            map.put(i, format!("v{}", i)).unwrap();
        }
        store.commit().unwrap();
        assert!(!MapCommit::has_unsaved(&*map));

        // root children are now position-only; reads go through the store
        for i in (0..300u64).step_by(7) {
            assert_eq!(
                map.get(&i).unwrap().as_deref(),
                Some(format!("v{}", i).as_str())
            );
        }
    }

    #[test]
    fn writes_after_commit_copy_pages_to_the_new_version() {
        let (_dir, store, map) = small_page_map();
        map.put(1, "a".to_owned()).unwrap();
        store.commit().unwrap();

        let old_root = map.root();
        assert_ne!(old_root.pos(), 0);

        map.put(2, "b".to_owned()).unwrap();
        let new_root = map.root();
        assert_eq!(new_root.pos(), 0, "mutation must produce an unsaved root");
        assert!(new_root.version() > old_root.version());
        assert_ne!(old_root.key_count(), new_root.key_count());
    }

    #[test]
    fn total_count_matches_across_deep_trees() {
        let (_dir, _store, map) = small_page_map();
        for i in 0..400u64 {
            map.put(i, "payload-payload".to_owned()).unwrap();
        }
        let root = map.root();
        root.verify_integrity(&map).unwrap();
        assert_eq!(root.total_count(), 400);
    }
}
