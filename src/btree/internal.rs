//! # Internal Node Pages
//!
//! Internal nodes route descents: an array of `(separator key, child page
//! id)` pairs after the 24-byte node header. Slot 0's key is unused (the
//! leftmost child holds every key below the slot-1 separator), and for
//! `i >= 1` the subtree under slot `i` holds keys `>= key_i`.
//!
//! ## Page Layout
//!
//! ```text
//! +------------------------------------+
//! | NodeHeader (24 bytes)              |
//! +------------------------------------+
//! | pair 0: (unused key) | child0      |   sizeof(K) + 4 bytes each
//! | pair 1: key1         | child1      |   keys 1..size-1 ascending
//! | ...                                |
//! +------------------------------------+
//! ```
//!
//! ## Routing
//!
//! For a search key k: take the child at the largest slot whose separator
//! is `<= k` (slot 0 when k is below every separator). Equality descends
//! right, because a separator is the least key of its right subtree.
//!
//! The move routines that shuffle pairs between siblings also rewrite the
//! `parent_page_id` of every child they move, fetching each child through
//! the buffer pool.

use std::marker::PhantomData;

use eyre::{ensure, Result};

use crate::btree::key::{IndexKey, KeyComparator};
use crate::btree::node::{NodeHeader, NodeType, PARENT_PTR_OFFSET};
use crate::buffer::BufferPoolManager;
use crate::config::{PageId, NODE_HEADER_SIZE, PAGE_SIZE};

/// Slot capacity of an internal page for key type `K`.
pub fn internal_capacity<K: IndexKey>() -> u32 {
    ((PAGE_SIZE - NODE_HEADER_SIZE) / (std::mem::size_of::<K>() + 4)) as u32
}

fn pair_size<K: IndexKey>() -> usize {
    std::mem::size_of::<K>() + 4
}

fn pair_offset<K: IndexKey>(index: u32) -> usize {
    NODE_HEADER_SIZE + index as usize * pair_size::<K>()
}

fn check_internal(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );
    let header = NodeHeader::from_page(data)?;
    ensure!(
        header.node_type() == Some(NodeType::Internal),
        "expected internal page, got type {:?}",
        header.node_type()
    );
    ensure!(
        header.size() <= header.max_size(),
        "internal size {} exceeds max_size {}",
        header.size(),
        header.max_size()
    );
    Ok(())
}

/// Rewrites a child's parent pointer to `new_parent`.
///
/// The write goes through a raw pointer rather than `data_mut` because the
/// caller may already hold the child W-latched (a freshly split sibling is
/// still in the operation's guard set while its grandparent splits).
/// Serialization comes from the structure-modification protocol: parent
/// pointers are only written by threads holding the W-latch on the child's
/// (old) parent, and only read by structure modifications under the same
/// latch. Search descents never touch the field.
pub(crate) fn reparent(
    pool: &BufferPoolManager,
    child_page_id: PageId,
    new_parent: PageId,
) -> Result<()> {
    let child = pool.fetch_page(child_page_id)?;
    let bytes = new_parent.to_le_bytes();
    // SAFETY: the guard pins the frame, so the pointer stays valid; the
    // four bytes written are the parent field, disjoint from everything a
    // concurrent reader of this page examines (see above).
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            child.data_ptr().add(PARENT_PTR_OFFSET),
            bytes.len(),
        );
    }
    child.mark_dirty();
    Ok(())
}

pub struct InternalRef<'a, K> {
    data: &'a [u8],
    _key: PhantomData<K>,
}

pub struct InternalMut<'a, K> {
    data: &'a mut [u8],
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> InternalRef<'a, K> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        check_internal(data)?;
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    fn header(&self) -> &NodeHeader {
        // INVARIANT: the page was validated in from_page.
        NodeHeader::from_page(self.data).unwrap()
    }

    pub fn size(&self) -> u32 {
        self.header().size()
    }

    pub fn max_size(&self) -> u32 {
        self.header().max_size()
    }

    pub fn min_size(&self) -> u32 {
        self.header().min_size()
    }

    pub fn page_id(&self) -> PageId {
        self.header().page_id()
    }

    pub fn parent_page_id(&self) -> PageId {
        self.header().parent_page_id()
    }

    pub fn key_at(&self, index: u32) -> Result<K> {
        ensure!(
            index < self.size(),
            "internal slot {} out of bounds (size={})",
            index,
            self.size()
        );
        let offset = pair_offset::<K>(index);
        K::read_from_bytes(&self.data[offset..offset + std::mem::size_of::<K>()])
            .map_err(|e| eyre::eyre!("failed to read key at slot {}: {:?}", index, e))
    }

    pub fn value_at(&self, index: u32) -> Result<PageId> {
        ensure!(
            index < self.size(),
            "internal slot {} out of bounds (size={})",
            index,
            self.size()
        );
        let offset = pair_offset::<K>(index) + std::mem::size_of::<K>();
        let bytes: [u8; 4] = self.data[offset..offset + 4].try_into().unwrap();
        Ok(PageId::from_le_bytes(bytes))
    }

    /// Slot whose child pointer equals `child`, if any.
    pub fn value_index(&self, child: PageId) -> Result<Option<u32>> {
        for i in 0..self.size() {
            if self.value_at(i)? == child {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Routing: the child to descend into for `key`. Finds the smallest
    /// slot `i >= 1` with `key < key_i` and takes slot `i - 1`; the last
    /// child when no separator exceeds the key.
    pub fn lookup<C: KeyComparator<K>>(&self, key: &K, cmp: &C) -> Result<PageId> {
        let size = self.size();
        ensure!(
            size >= 2,
            "internal page {} has {} slots, cannot route",
            self.page_id(),
            size
        );

        let mut lo = 1u32;
        let mut hi = size;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp.compare(key, &self.key_at(mid)?) == std::cmp::Ordering::Less {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        self.value_at(lo - 1)
    }
}

impl<'a, K: IndexKey> InternalMut<'a, K> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        check_internal(data)?;
        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    /// Formats `data` as an empty internal node.
    pub fn init(
        data: &'a mut [u8],
        page_id: PageId,
        parent_page_id: PageId,
        max_size: u32,
    ) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        ensure!(
            max_size >= 3 && max_size <= internal_capacity::<K>(),
            "internal max_size {} outside 3..={}",
            max_size,
            internal_capacity::<K>()
        );

        let header = NodeHeader::from_page_mut(data)?;
        header.set_node_type(NodeType::Internal);
        header.set_lsn(0);
        header.set_size(0);
        header.set_max_size(max_size);
        header.set_parent_page_id(parent_page_id);
        header.set_page_id(page_id);

        Ok(Self {
            data,
            _key: PhantomData,
        })
    }

    pub fn as_ref(&self) -> InternalRef<'_, K> {
        InternalRef {
            data: self.data,
            _key: PhantomData,
        }
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        // INVARIANT: the page was validated in from_page/init.
        NodeHeader::from_page_mut(self.data).unwrap()
    }

    pub fn size(&self) -> u32 {
        self.as_ref().size()
    }

    pub fn max_size(&self) -> u32 {
        self.as_ref().max_size()
    }

    pub fn min_size(&self) -> u32 {
        self.as_ref().min_size()
    }

    pub fn page_id(&self) -> PageId {
        self.as_ref().page_id()
    }

    fn set_size(&mut self, size: u32) {
        self.header_mut().set_size(size);
    }

    pub fn key_at(&self, index: u32) -> Result<K> {
        self.as_ref().key_at(index)
    }

    pub fn value_at(&self, index: u32) -> Result<PageId> {
        self.as_ref().value_at(index)
    }

    pub fn value_index(&self, child: PageId) -> Result<Option<u32>> {
        self.as_ref().value_index(child)
    }

    pub fn set_key_at(&mut self, index: u32, key: &K) -> Result<()> {
        ensure!(
            index < self.size(),
            "internal slot {} out of bounds (size={})",
            index,
            self.size()
        );
        let offset = pair_offset::<K>(index);
        self.data[offset..offset + std::mem::size_of::<K>()].copy_from_slice(key.as_bytes());
        Ok(())
    }

    fn write_pair(&mut self, index: u32, key: &K, child: PageId) {
        let offset = pair_offset::<K>(index);
        let key_size = std::mem::size_of::<K>();
        self.data[offset..offset + key_size].copy_from_slice(key.as_bytes());
        self.data[offset + key_size..offset + key_size + 4]
            .copy_from_slice(&child.to_le_bytes());
    }

    /// First fill of a brand-new root after the old root split:
    /// slot 0 carries the old root, slot 1 the separator and the new
    /// sibling.
    pub fn populate_new_root(
        &mut self,
        old_child: PageId,
        key: &K,
        new_child: PageId,
    ) -> Result<()> {
        ensure!(
            self.size() == 0,
            "populate_new_root on non-empty page {}",
            self.page_id()
        );
        let key_size = std::mem::size_of::<K>();
        let offset = pair_offset::<K>(0);
        // Slot 0 has no separator; zero the unused key bytes.
        self.data[offset..offset + key_size].fill(0);
        self.data[offset + key_size..offset + key_size + 4]
            .copy_from_slice(&old_child.to_le_bytes());
        self.write_pair(1, key, new_child);
        self.set_size(2);
        Ok(())
    }

    /// Inserts `(key, new_child)` immediately after the slot holding
    /// `old_child`. Returns the new size.
    pub fn insert_node_after(
        &mut self,
        old_child: PageId,
        key: &K,
        new_child: PageId,
    ) -> Result<u32> {
        let size = self.size();
        ensure!(
            size < self.max_size(),
            "internal page {} is full (size={})",
            self.page_id(),
            size
        );
        let index = self
            .value_index(old_child)?
            .ok_or_else(|| eyre::eyre!("child {} not found in page {}", old_child, self.page_id()))?;

        let start = pair_offset::<K>(index + 1);
        let end = pair_offset::<K>(size);
        self.data.copy_within(start..end, start + pair_size::<K>());
        self.write_pair(index + 1, key, new_child);
        self.set_size(size + 1);
        Ok(size + 1)
    }

    /// Removes the pair at `index`, compacting the suffix.
    pub fn remove(&mut self, index: u32) -> Result<()> {
        let size = self.size();
        ensure!(
            index < size,
            "internal slot {} out of bounds (size={})",
            index,
            size
        );
        let start = pair_offset::<K>(index + 1);
        let end = pair_offset::<K>(size);
        self.data.copy_within(start..end, pair_offset::<K>(index));
        self.set_size(size - 1);
        Ok(())
    }

    /// Empties a single-child root and hands back that child (root
    /// collapse, case 1 of AdjustRoot).
    pub fn remove_and_return_only_child(&mut self) -> Result<PageId> {
        ensure!(
            self.size() == 1,
            "page {} holds {} children, not exactly one",
            self.page_id(),
            self.size()
        );
        let child = self.value_at(0)?;
        self.set_size(0);
        Ok(child)
    }

    /// Moves the upper half of this node into an empty `recipient`,
    /// retaining ⌈size/2⌉ pairs. The first moved key lands in the
    /// recipient's slot 0, where the caller reads it as the pivot to
    /// promote; moved children are re-parented to the recipient.
    pub fn move_half_to(
        &mut self,
        recipient: &mut InternalMut<'_, K>,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        ensure!(
            recipient.size() == 0,
            "split recipient {} is not empty",
            recipient.page_id()
        );
        let size = self.size();
        let retained = (size + 1) / 2;
        let moved = size - retained;

        let src_start = pair_offset::<K>(retained);
        let src_end = pair_offset::<K>(size);
        recipient.data[NODE_HEADER_SIZE..NODE_HEADER_SIZE + (src_end - src_start)]
            .copy_from_slice(&self.data[src_start..src_end]);

        recipient.set_size(moved);
        self.set_size(retained);

        let recipient_id = recipient.page_id();
        for i in 0..moved {
            reparent(pool, recipient.value_at(i)?, recipient_id)?;
        }
        Ok(())
    }

    /// Appends every pair to `recipient` (the left node of a merging
    /// pair). `middle_key` is the separator pulled down from the parent;
    /// it becomes the key of this node's slot-0 child, which has none of
    /// its own. Moved children are re-parented to the recipient.
    pub fn move_all_to(
        &mut self,
        recipient: &mut InternalMut<'_, K>,
        middle_key: &K,
        pool: &BufferPoolManager,
    ) -> Result<()> {
        let size = self.size();
        let recipient_size = recipient.size();
        ensure!(
            recipient_size + size <= recipient.max_size(),
            "merge would overflow internal page {} ({} + {} > {})",
            recipient.page_id(),
            recipient_size,
            size,
            recipient.max_size()
        );

        let dst = pair_offset::<K>(recipient_size);
        let src_end = pair_offset::<K>(size);
        recipient.data[dst..dst + (src_end - NODE_HEADER_SIZE)]
            .copy_from_slice(&self.data[NODE_HEADER_SIZE..src_end]);
        recipient.set_size(recipient_size + size);
        recipient.set_key_at(recipient_size, middle_key)?;
        self.set_size(0);

        let recipient_id = recipient.page_id();
        for i in recipient_size..recipient_size + size {
            reparent(pool, recipient.value_at(i)?, recipient_id)?;
        }
        Ok(())
    }

    /// Shifts this node's first pair onto the end of `recipient` (its
    /// left sibling). The moved child arrives under `middle_key` (pulled
    /// down from the parent); the key vacated from slot 1 is returned as
    /// the parent's new separator.
    pub fn move_first_to_end_of(
        &mut self,
        recipient: &mut InternalMut<'_, K>,
        middle_key: &K,
        pool: &BufferPoolManager,
    ) -> Result<K> {
        let size = self.size();
        ensure!(size >= 2, "cannot move from internal page {} of size {}", self.page_id(), size);
        let recipient_size = recipient.size();
        ensure!(
            recipient_size < recipient.max_size(),
            "redistribution target page {} is full",
            recipient.page_id()
        );

        let moved_child = self.value_at(0)?;
        let new_separator = self.key_at(1)?;

        recipient.write_pair(recipient_size, middle_key, moved_child);
        recipient.set_size(recipient_size + 1);

        self.data.copy_within(
            pair_offset::<K>(1)..pair_offset::<K>(size),
            NODE_HEADER_SIZE,
        );
        self.set_size(size - 1);

        reparent(pool, moved_child, recipient.page_id())?;
        Ok(new_separator)
    }

    /// Shifts this node's last pair onto the front of `recipient` (its
    /// right sibling). The recipient's old slot-0 child gets `middle_key`
    /// (pulled down from the parent); the moved pair's key is returned as
    /// the parent's new separator.
    pub fn move_last_to_front_of(
        &mut self,
        recipient: &mut InternalMut<'_, K>,
        middle_key: &K,
        pool: &BufferPoolManager,
    ) -> Result<K> {
        let size = self.size();
        ensure!(size >= 2, "cannot move from internal page {} of size {}", self.page_id(), size);
        let recipient_size = recipient.size();
        ensure!(
            recipient_size < recipient.max_size(),
            "redistribution target page {} is full",
            recipient.page_id()
        );

        let moved_child = self.value_at(size - 1)?;
        let new_separator = self.key_at(size - 1)?;

        recipient.data.copy_within(
            NODE_HEADER_SIZE..pair_offset::<K>(recipient_size),
            pair_offset::<K>(1),
        );
        recipient.set_size(recipient_size + 1);
        recipient.set_key_at(1, middle_key)?;
        recipient.write_pair(0, &new_separator, moved_child);

        self.set_size(size - 1);

        reparent(pool, moved_child, recipient.page_id())?;
        Ok(new_separator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::key::{GenericComparator, GenericKey};
    use crate::config::INVALID_PAGE_ID;

    type Key = GenericKey<8>;
    const CMP: GenericComparator<8> = GenericComparator::<8>;

    fn key(v: i64) -> Key {
        Key::from_i64(v)
    }

    fn make_internal(page: &mut Vec<u8>, page_id: PageId, max_size: u32) -> InternalMut<'_, Key> {
        InternalMut::init(page.as_mut_slice(), page_id, INVALID_PAGE_ID, max_size).unwrap()
    }

    #[test]
    fn capacity_matches_the_page_geometry() {
        // (4096 - 24) / (8 + 4)
        assert_eq!(internal_capacity::<Key>(), 339);
    }

    #[test]
    fn populate_new_root_holds_two_children() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 4);

        node.populate_new_root(10, &key(100), 11).unwrap();

        assert_eq!(node.size(), 2);
        assert_eq!(node.value_at(0).unwrap(), 10);
        assert_eq!(node.value_at(1).unwrap(), 11);
        assert_eq!(node.key_at(1).unwrap().to_i64(), 100);
    }

    #[test]
    fn routing_picks_the_standard_child() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 8);
        node.populate_new_root(10, &key(100), 11).unwrap();
        node.insert_node_after(11, &key(200), 12).unwrap();

        let node = InternalRef::<Key>::from_page(&page).unwrap();
        assert_eq!(node.lookup(&key(50), &CMP).unwrap(), 10);
        assert_eq!(node.lookup(&key(99), &CMP).unwrap(), 10);
        // Equality descends right: the separator is the least key of the
        // right subtree.
        assert_eq!(node.lookup(&key(100), &CMP).unwrap(), 11);
        assert_eq!(node.lookup(&key(150), &CMP).unwrap(), 11);
        assert_eq!(node.lookup(&key(200), &CMP).unwrap(), 12);
        assert_eq!(node.lookup(&key(999), &CMP).unwrap(), 12);
    }

    #[test]
    fn insert_node_after_lands_next_to_its_sibling() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 8);
        node.populate_new_root(10, &key(100), 11).unwrap();

        node.insert_node_after(10, &key(50), 15).unwrap();

        assert_eq!(node.size(), 3);
        assert_eq!(node.value_at(0).unwrap(), 10);
        assert_eq!(node.value_at(1).unwrap(), 15);
        assert_eq!(node.key_at(1).unwrap().to_i64(), 50);
        assert_eq!(node.value_at(2).unwrap(), 11);
        assert_eq!(node.key_at(2).unwrap().to_i64(), 100);
    }

    #[test]
    fn value_index_finds_children() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 8);
        node.populate_new_root(10, &key(100), 11).unwrap();

        assert_eq!(node.value_index(10).unwrap(), Some(0));
        assert_eq!(node.value_index(11).unwrap(), Some(1));
        assert_eq!(node.value_index(99).unwrap(), None);
    }

    #[test]
    fn remove_compacts_the_suffix() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 8);
        node.populate_new_root(10, &key(100), 11).unwrap();
        node.insert_node_after(11, &key(200), 12).unwrap();

        node.remove(1).unwrap();

        assert_eq!(node.size(), 2);
        assert_eq!(node.value_at(0).unwrap(), 10);
        assert_eq!(node.value_at(1).unwrap(), 12);
        assert_eq!(node.key_at(1).unwrap().to_i64(), 200);
    }

    #[test]
    fn remove_and_return_only_child_empties_the_root() {
        let mut page = vec![0u8; PAGE_SIZE];
        let mut node = make_internal(&mut page, 5, 8);
        node.populate_new_root(10, &key(100), 11).unwrap();
        node.remove(1).unwrap();

        let child = node.remove_and_return_only_child().unwrap();
        assert_eq!(child, 10);
        assert_eq!(node.size(), 0);
    }
}
