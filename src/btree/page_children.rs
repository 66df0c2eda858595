//! # Page Child Projections
//!
//! Garbage collection needs to know which chunks are still referenced
//! without materializing whole pages: deciding whether a chunk can be
//! dropped only takes the child-position tables of the internal pages that
//! might point into it.
//!
//! `PageChildren` is that projection: the owning page's position plus the
//! positions of its direct children. It can be built from an in-memory page
//! or parsed straight from a chunk with `parse`, which stops reading right
//! after the child-position table and skips the payload entirely.
//!
//! Two reductions keep the GC working set small:
//!
//! - `remove_duplicate_chunk_references` drops leaf references whose chunk
//!   was already seen (one witness per chunk is enough). References to
//!   internal pages always survive, because their subtrees may reach other
//!   chunks.
//! - `collect_referenced_chunks` folds the remaining references into a set
//!   of chunk ids.

use eyre::{ensure, Result};
use hashbrown::HashSet;

use crate::btree::page::Page;
use crate::encoding::position::{
    check_value, position_chunk_id, position_offset, position_type, PAGE_TYPE_NODE,
};
use crate::encoding::ByteReader;

/// Child-position projection of one internal page.
#[derive(Debug, Clone)]
pub struct PageChildren {
    pos: u64,
    children: Vec<u64>,
    /// Set once the projection has been reduced to one witness per chunk.
    chunk_list: bool,
}

impl PageChildren {
    pub fn new(pos: u64, children: Vec<u64>) -> Self {
        Self {
            pos,
            children,
            chunk_list: false,
        }
    }

    /// Snapshot of an in-memory page's child positions, hidden children
    /// included.
    pub fn from_page<K, V>(page: &Page<K, V>) -> Result<Self>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let count = page.raw_child_count();
        let mut children = Vec::with_capacity(count);
        for i in 0..count {
            children.push(page.child_ref(i)?.pos());
        }
        Ok(Self::new(page.pos(), children))
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn children(&self) -> &[u64] {
        &self.children
    }

    pub fn is_chunk_list(&self) -> bool {
        self.chunk_list
    }

    pub fn set_chunk_list(&mut self) {
        self.chunk_list = true;
    }

    /// Estimated in-memory size, for GC working-set accounting.
    pub fn memory(&self) -> usize {
        64 + 8 * self.children.len()
    }

    /// Parses the page frame at `pos` just far enough to extract the
    /// child-position table. Returns `None` for leaf pages, which reference
    /// nothing.
    pub(crate) fn parse(map_id: u32, pos: u64, data: &[u8]) -> Result<Option<PageChildren>> {
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
        let mut reader = ByteReader::new(&data[..page_length]);
        reader.take(4)?;

        let check = reader.get_u16()?;
        let read_map_id = reader.get_var_u32()?;
        ensure!(
            read_map_id == map_id,
            "file corrupted in chunk {}, expected map id {}, got {}",
            chunk_id,
            map_id,
            read_map_id
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
        if type_byte & 1 != PAGE_TYPE_NODE {
            return Ok(None);
        }
        let mut children = Vec::with_capacity(len + 1);
        for _ in 0..=len {
            children.push(reader.get_u64()?);
        }
        Ok(Some(PageChildren::new(pos, children)))
    }

    /// Keeps at most one leaf reference per chunk, seeded with the owning
    /// page's own chunk. Internal-page references are always retained, as
    /// they may transitively reach other chunks.
    pub fn remove_duplicate_chunk_references(&mut self) {
        let mut chunks = HashSet::new();
        // references to leaves in our own chunk carry no extra information
        chunks.insert(position_chunk_id(self.pos));
        let mut i = 0;
        while i < self.children.len() {
            let child = self.children[i];
            let first_sighting = chunks.insert(position_chunk_id(child));
            if position_type(child) == PAGE_TYPE_NODE || first_sighting {
                i += 1;
                continue;
            }
            self.remove_child(i);
        }
    }

    /// Unions the owning chunk and every referenced chunk into `target`.
    pub fn collect_referenced_chunks(&self, target: &mut HashSet<u32>) {
        target.insert(position_chunk_id(self.pos));
        for &child in &self.children {
            target.insert(position_chunk_id(child));
        }
    }

    fn remove_child(&mut self, index: usize) {
        if index == 0 && self.children.len() == 1 {
            self.children = Vec::new();
            return;
        }
        self.children.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::position::{pack_position, PAGE_TYPE_LEAF};

    fn leaf_at(chunk: u32, offset: u32) -> u64 {
        pack_position(chunk, offset, 32, PAGE_TYPE_LEAF)
    }

    fn node_at(chunk: u32, offset: u32) -> u64 {
        pack_position(chunk, offset, 64, PAGE_TYPE_NODE)
    }

    #[test]
    fn dedup_keeps_one_leaf_per_chunk() {
        let own = node_at(1, 64);
        let mut pc = PageChildren::new(
            own,
            vec![leaf_at(2, 64), leaf_at(2, 128), leaf_at(3, 64), leaf_at(2, 192)],
        );
        pc.remove_duplicate_chunk_references();

        assert_eq!(pc.children(), &[leaf_at(2, 64), leaf_at(3, 64)]);
    }

    #[test]
    fn dedup_drops_leaves_in_the_owning_chunk() {
        let own = node_at(1, 64);
        let mut pc = PageChildren::new(own, vec![leaf_at(1, 128), leaf_at(2, 64)]);
        pc.remove_duplicate_chunk_references();

        assert_eq!(pc.children(), &[leaf_at(2, 64)]);
    }

    #[test]
    fn dedup_never_removes_internal_references() {
        let own = node_at(1, 64);
        let mut pc = PageChildren::new(
            own,
            vec![node_at(2, 64), node_at(2, 128), leaf_at(2, 192), node_at(1, 128)],
        );
        pc.remove_duplicate_chunk_references();

        // both same-chunk nodes stay; the duplicate-chunk leaf goes
        assert_eq!(
            pc.children(),
            &[node_at(2, 64), node_at(2, 128), node_at(1, 128)]
        );
    }

    #[test]
    fn dedup_collapses_single_duplicate_to_empty() {
        let own = node_at(1, 64);
        let mut pc = PageChildren::new(own, vec![leaf_at(1, 128)]);
        pc.remove_duplicate_chunk_references();

        assert!(pc.children().is_empty());
    }

    #[test]
    fn collect_unions_own_and_child_chunks() {
        let own = node_at(1, 64);
        let pc = PageChildren::new(own, vec![leaf_at(2, 64), node_at(5, 64), leaf_at(2, 128)]);
        let mut chunks = HashSet::new();
        pc.collect_referenced_chunks(&mut chunks);

        let mut sorted: Vec<u32> = chunks.into_iter().collect();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 2, 5]);
    }

    #[test]
    fn memory_estimate_scales_with_children() {
        let pc = PageChildren::new(node_at(1, 64), vec![0; 10]);
        assert_eq!(pc.memory(), 64 + 80);
    }
}
