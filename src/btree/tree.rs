//! # B+Tree
//!
//! The tree-level operations over the node pages: point lookup, unique-key
//! insertion with splits, deletion with redistribution and merges, and
//! in-order iteration over the linked leaves. All page traffic goes
//! through the buffer pool; the tree holds page ids, never pointers.
//!
//! ## Structure
//!
//! ```text
//!                  [internal root]
//!                  /      |      \
//!         [internal]  [internal]  [internal]
//!          /   \        /  \        /   \
//!      [leaf]->[leaf]->[leaf]->[leaf]->[leaf]      (next-pointer chain)
//! ```
//!
//! Keys live only in the leaves; internal nodes hold separators, each a
//! lower bound of its right subtree (exact until the subtree's least key
//! is removed). Every node except the root keeps at least ⌊max_size/2⌋
//! slots; a node holds up to max_size entries and splits when an insert
//! finds it full.
//!
//! ## Concurrency
//!
//! Traversal uses latch crabbing. Readers R-latch the child, then release
//! the parent. Writers W-latch downward and release all held ancestors as
//! soon as the just-latched child is *safe*, meaning it cannot split
//! (insert) or underflow (remove); otherwise the ancestors stay in the
//! transaction's page set until the structural cascade completes. A tree-level root
//! latch guards `root_page_id` the same way: shared for readers, exclusive
//! for writers until their descent proves safe.
//!
//! The retained page set doubles as the cascade's ancestor stack: a split
//! or merge pops its parent from the set instead of re-fetching it.
//!
//! ## Split Reservation
//!
//! A split cascade needs one fresh page per splitting node (plus one when
//! the root itself splits). All of them are reserved from the buffer pool
//! before the leaf is touched, so an allocation failure aborts the insert
//! with the tree unchanged.
//!
//! ## Root Persistence
//!
//! The root page id is persisted as a record in the header page (page 0)
//! under the index name. Every root change rewrites the record before the
//! root latch is released.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

use crate::btree::internal::{internal_capacity, reparent, InternalMut, InternalRef};
use crate::btree::iter::IndexIterator;
use crate::btree::key::{GenericKey, IndexKey, KeyComparator};
use crate::btree::leaf::{leaf_capacity, LeafMut, LeafRef};
use crate::btree::node::{validate_node, NodeHeader};
use crate::buffer::{BufferPoolManager, PageGuard};
use crate::config::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::{HeaderMut, HeaderRef, Rid, MAX_NAME_LEN};
use crate::txn::Transaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Insert,
    Remove,
}

pub struct BPlusTree<K, C> {
    index_name: String,
    pool: Arc<BufferPoolManager>,
    comparator: C,
    root_page_id: AtomicU32,
    root_latch: RawRwLock,
    leaf_max_size: u32,
    internal_max_size: u32,
    _key: PhantomData<K>,
}

impl<K: IndexKey, C: KeyComparator<K>> BPlusTree<K, C> {
    /// Opens (or registers) the index named `index_name`, with node
    /// capacities derived from the page geometry.
    pub fn new(
        index_name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
    ) -> Result<Self> {
        Self::with_max_sizes(
            index_name,
            pool,
            comparator,
            leaf_capacity::<K>(),
            internal_capacity::<K>(),
        )
    }

    /// Like [`BPlusTree::new`] with explicit node capacities. Small
    /// capacities force deep trees out of few keys, which is how the
    /// split and merge machinery is tested.
    pub fn with_max_sizes(
        index_name: impl Into<String>,
        pool: Arc<BufferPoolManager>,
        comparator: C,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Result<Self> {
        let index_name = index_name.into();
        ensure!(
            !index_name.is_empty() && index_name.len() <= MAX_NAME_LEN,
            "index name '{}' must be 1..={} bytes",
            index_name,
            MAX_NAME_LEN
        );
        ensure!(
            leaf_max_size >= 3 && leaf_max_size <= leaf_capacity::<K>(),
            "leaf max_size {} outside 3..={}",
            leaf_max_size,
            leaf_capacity::<K>()
        );
        ensure!(
            internal_max_size >= 3 && internal_max_size <= internal_capacity::<K>(),
            "internal max_size {} outside 3..={}",
            internal_max_size,
            internal_capacity::<K>()
        );

        let tree = Self {
            index_name,
            pool,
            comparator,
            root_page_id: AtomicU32::new(INVALID_PAGE_ID),
            root_latch: RawRwLock::INIT,
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        };

        match tree.read_header_root()? {
            Some(root) => tree.root_page_id.store(root, Ordering::Release),
            None => tree.update_root_page_id(true)?,
        }
        Ok(tree)
    }

    pub fn name(&self) -> &str {
        &self.index_name
    }

    fn root_id(&self) -> PageId {
        self.root_page_id.load(Ordering::Acquire)
    }

    /// True iff the tree holds no keys.
    pub fn is_empty(&self) -> bool {
        self.root_id() == INVALID_PAGE_ID
    }

    /// Writes every dirty page back to the index file.
    pub fn flush(&self) -> Result<()> {
        self.pool.flush_all()
    }

    // ------------------------------------------------------------------
    // search
    // ------------------------------------------------------------------

    /// Point lookup. Returns the rid stored under `key`, if any.
    pub fn get(&self, key: &K, _txn: &Transaction<'_>) -> Result<Option<Rid>> {
        let Some(leaf_guard) = self.find_leaf_read(Some(key))? else {
            return Ok(None);
        };
        let leaf = LeafRef::<K>::from_page(leaf_guard.data())?;
        leaf.lookup(key, &self.comparator)
    }

    /// Read-crabbing descent to a leaf: R-latch the child, then release
    /// the parent. `None` target descends to the leftmost leaf. Returns
    /// `None` when the tree is empty. The returned guard is R-latched.
    fn find_leaf_read(&self, target: Option<&K>) -> Result<Option<PageGuard<'_>>> {
        self.root_latch.lock_shared();
        let root = self.root_id();
        if root == INVALID_PAGE_ID {
            // SAFETY: this thread acquired the shared root latch above.
            unsafe { self.root_latch.unlock_shared() };
            return Ok(None);
        }

        let guard = match self.pool.fetch_page(root) {
            Ok(guard) => guard,
            Err(e) => {
                // SAFETY: as above; the latch is still held on this path.
                unsafe { self.root_latch.unlock_shared() };
                return Err(e);
            }
        };
        guard.rlatch();
        // SAFETY: this thread acquired the shared root latch above; the
        // root page itself is latched now, so the id can no longer change
        // underneath this descent.
        unsafe { self.root_latch.unlock_shared() };

        let mut guard = guard;
        loop {
            if NodeHeader::from_page(guard.data())?.is_leaf() {
                return Ok(Some(guard));
            }
            let node = InternalRef::<K>::from_page(guard.data())?;
            let child_id = match target {
                Some(key) => node.lookup(key, &self.comparator)?,
                None => node.value_at(0)?,
            };
            let child = self.pool.fetch_page(child_id)?;
            child.rlatch();
            // Reassignment drops the parent guard: unlatch, then unpin.
            guard = child;
        }
    }

    // ------------------------------------------------------------------
    // insertion
    // ------------------------------------------------------------------

    /// Inserts `key -> rid`. Returns false (and changes nothing) when the
    /// key already exists; keys are unique across the tree.
    pub fn insert<'a>(&'a self, key: &K, rid: &Rid, txn: &Transaction<'a>) -> Result<bool> {
        self.root_latch.lock_exclusive();
        txn.mark_root_latched();

        let out = self.insert_inner(key, rid, txn);
        let fin = self.finish(txn);
        let inserted = out?;
        fin?;
        Ok(inserted)
    }

    fn insert_inner<'a>(&'a self, key: &K, rid: &Rid, txn: &Transaction<'a>) -> Result<bool> {
        if self.root_id() == INVALID_PAGE_ID {
            self.start_new_tree(key, rid)?;
            return Ok(true);
        }

        let mut leaf_guard = self.find_leaf_write(key, AccessMode::Insert, txn)?;

        {
            let leaf = LeafRef::<K>::from_page(leaf_guard.data())?;
            if leaf.lookup(key, &self.comparator)?.is_some() {
                return Ok(false);
            }
        }

        let (leaf_id, parent_id, size, max_size) = {
            let header = NodeHeader::from_page(leaf_guard.data())?;
            (
                header.page_id(),
                header.parent_page_id(),
                header.size(),
                header.max_size(),
            )
        };

        if size < max_size {
            let mut leaf = LeafMut::<K>::from_page(leaf_guard.data_mut())?;
            leaf.insert(key, rid, &self.comparator)?;
            return Ok(true);
        }

        // The leaf is full: it splits before the new pair is placed.
        // Reserve every page the cascade will need first, so an
        // allocation failure leaves the tree untouched.
        let mut reserve = self.reserve_split_pages(txn)?;

        let mut right_guard = reserve
            .pop()
            .ok_or_else(|| eyre::eyre!("split reservation ran dry"))?;
        let right_id = right_guard.page_id();

        {
            let mut leaf = LeafMut::<K>::from_page(leaf_guard.data_mut())?;
            let mut right =
                LeafMut::<K>::init(right_guard.data_mut(), right_id, parent_id, max_size)?;
            leaf.move_half_to(&mut right)?;
            right.set_next_page_id(leaf.next_page_id());
            leaf.set_next_page_id(right_id);

            // The new pair lands in whichever half owns its key range.
            let boundary = right.key_at(0)?;
            if self.comparator.compare(key, &boundary).is_lt() {
                leaf.insert(key, rid, &self.comparator)?;
            } else {
                right.insert(key, rid, &self.comparator)?;
            }
        }

        let separator = LeafRef::<K>::from_page(right_guard.data())?.key_at(0)?;
        tracing::trace!(left = leaf_id, right = right_id, "split leaf");

        self.insert_into_parent(leaf_guard, separator, right_guard, txn, &mut reserve)?;
        debug_assert!(reserve.is_empty(), "split reservation over-allocated");
        Ok(true)
    }

    fn start_new_tree(&self, key: &K, rid: &Rid) -> Result<()> {
        let mut guard = self.pool.new_page()?;
        let page_id = guard.page_id();

        let mut leaf = LeafMut::<K>::init(
            guard.data_mut(),
            page_id,
            INVALID_PAGE_ID,
            self.leaf_max_size,
        )?;
        leaf.insert(key, rid, &self.comparator)?;

        self.set_root_page_id(page_id)?;
        tracing::debug!(root = page_id, "started new tree");
        Ok(())
    }

    /// Walks `(left, separator, right)` up the retained ancestor chain,
    /// inserting the separator into each parent and splitting parents
    /// that fill, until a parent absorbs the insert or a new root is
    /// grown.
    fn insert_into_parent<'a>(
        &'a self,
        mut left: PageGuard<'a>,
        mut key: K,
        mut right: PageGuard<'a>,
        txn: &Transaction<'a>,
        reserve: &mut Vec<PageGuard<'a>>,
    ) -> Result<()> {
        loop {
            let (left_id, parent_id) = {
                let header = NodeHeader::from_page(left.data())?;
                (header.page_id(), header.parent_page_id())
            };
            let right_id = right.page_id();

            if parent_id == INVALID_PAGE_ID {
                // The old root split: grow a new root above the pair.
                let mut root_guard = reserve
                    .pop()
                    .ok_or_else(|| eyre::eyre!("split reservation ran dry"))?;
                let root_id = root_guard.page_id();
                {
                    let mut root = InternalMut::<K>::init(
                        root_guard.data_mut(),
                        root_id,
                        INVALID_PAGE_ID,
                        self.internal_max_size,
                    )?;
                    root.populate_new_root(left_id, &key, right_id)?;
                }
                NodeHeader::from_page_mut(left.data_mut())?.set_parent_page_id(root_id);
                NodeHeader::from_page_mut(right.data_mut())?.set_parent_page_id(root_id);

                self.set_root_page_id(root_id)?;
                tracing::debug!(root = root_id, "tree grew a level");
                return Ok(());
            }

            let mut parent_guard = txn.pop_from_page_set().ok_or_else(|| {
                eyre::eyre!("parent {} was not retained during descent", parent_id)
            })?;
            ensure!(
                parent_guard.page_id() == parent_id,
                "retained ancestor {} does not match parent {}",
                parent_guard.page_id(),
                parent_id
            );

            let (parent_size, parent_max, grandparent_id) = {
                let header = NodeHeader::from_page(parent_guard.data())?;
                (header.size(), header.max_size(), header.parent_page_id())
            };

            if parent_size < parent_max {
                let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
                parent.insert_node_after(left_id, &key, right_id)?;
                return Ok(());
            }

            // The parent is full: split it first, then slot the new pair
            // beside `left` in whichever half holds it, and carry the
            // promoted pivot one level up.
            let mut new_guard = reserve
                .pop()
                .ok_or_else(|| eyre::eyre!("split reservation ran dry"))?;
            let new_id = new_guard.page_id();

            {
                let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
                let mut sibling = InternalMut::<K>::init(
                    new_guard.data_mut(),
                    new_id,
                    grandparent_id,
                    parent_max,
                )?;
                parent.move_half_to(&mut sibling, &self.pool)?;

                if parent.value_index(left_id)?.is_some() {
                    parent.insert_node_after(left_id, &key, right_id)?;
                } else {
                    sibling.insert_node_after(left_id, &key, right_id)?;
                }
            }

            let promoted = InternalRef::<K>::from_page(new_guard.data())?.key_at(0)?;
            tracing::trace!(left = parent_id, right = new_id, "split internal node");

            left = parent_guard;
            key = promoted;
            right = new_guard;
        }
    }

    /// Reserves the new pages an imminent leaf split will need: one for
    /// the leaf's sibling, one per retained ancestor that will split in
    /// turn, and one more when the topmost split grows a new root. On
    /// failure every reserved page is handed straight back.
    fn reserve_split_pages<'a>(&'a self, txn: &Transaction<'a>) -> Result<Vec<PageGuard<'a>>> {
        let ancestors: Vec<(bool, bool)> = txn
            .inspect_page_set(|guard| {
                NodeHeader::from_page(guard.data())
                    .map(|h| (h.size() >= h.max_size(), h.is_root()))
            })
            .into_iter()
            .collect::<Result<_>>()?;

        let mut needed = 1 + ancestors.iter().filter(|(splits, _)| *splits).count();
        let grows_root = match ancestors.first() {
            Some(&(splits, is_root)) => splits && is_root,
            // No retained ancestors: the splitting leaf is the root.
            None => true,
        };
        if grows_root {
            needed += 1;
        }

        let mut reserve = Vec::with_capacity(needed);
        for _ in 0..needed {
            match self.pool.new_page() {
                Ok(guard) => reserve.push(guard),
                Err(e) => {
                    for guard in reserve.drain(..) {
                        let page_id = guard.page_id();
                        drop(guard);
                        // Reserved pages are not reachable from the tree.
                        let _ = self.pool.delete_page(page_id);
                    }
                    return Err(e.wrap_err("aborting insert before any page was modified"));
                }
            }
        }
        Ok(reserve)
    }

    // ------------------------------------------------------------------
    // removal
    // ------------------------------------------------------------------

    /// Removes `key` if present. Absent keys are a no-op.
    pub fn remove<'a>(&'a self, key: &K, txn: &Transaction<'a>) -> Result<()> {
        self.root_latch.lock_exclusive();
        txn.mark_root_latched();

        let out = self.remove_inner(key, txn);
        let fin = self.finish(txn);
        out?;
        fin
    }

    fn remove_inner<'a>(&'a self, key: &K, txn: &Transaction<'a>) -> Result<()> {
        if self.root_id() == INVALID_PAGE_ID {
            return Ok(());
        }

        let mut leaf_guard = self.find_leaf_write(key, AccessMode::Remove, txn)?;

        {
            let leaf = LeafRef::<K>::from_page(leaf_guard.data())?;
            if leaf.lookup(key, &self.comparator)?.is_none() {
                return Ok(());
            }
        }

        let (new_size, is_root, min_size) = {
            let mut leaf = LeafMut::<K>::from_page(leaf_guard.data_mut())?;
            let new_size = leaf.remove_and_delete_record(key, &self.comparator)?;
            let leaf = leaf.as_ref();
            (
                new_size,
                leaf.parent_page_id() == INVALID_PAGE_ID,
                leaf.min_size(),
            )
        };

        if is_root {
            if new_size == 0 {
                self.adjust_root(leaf_guard, txn)?;
            }
            return Ok(());
        }
        if new_size >= min_size {
            return Ok(());
        }
        self.coalesce_or_redistribute_leaf(leaf_guard, txn)
    }

    /// Restores minimum occupancy of an underflowing leaf by merging with
    /// or borrowing from a sibling, then fixes up the parent chain.
    fn coalesce_or_redistribute_leaf<'a>(
        &'a self,
        mut leaf_guard: PageGuard<'a>,
        txn: &Transaction<'a>,
    ) -> Result<()> {
        let mut parent_guard = txn.pop_from_page_set().ok_or_else(|| {
            eyre::eyre!("parent of leaf {} was not retained", leaf_guard.page_id())
        })?;
        let leaf_id = leaf_guard.page_id();

        let (index, sibling_id, separator_slot) = {
            let parent = InternalRef::<K>::from_page(parent_guard.data())?;
            let index = parent
                .value_index(leaf_id)?
                .ok_or_else(|| eyre::eyre!("leaf {} missing from its parent", leaf_id))?;
            let sibling_index = if index == 0 { 1 } else { index - 1 };
            // Separator slot of the right node of the (left, right) pair.
            let separator_slot = if index == 0 { 1 } else { index };
            (index, parent.value_at(sibling_index)?, separator_slot)
        };

        let mut sibling_guard = self.pool.fetch_page(sibling_id)?;
        sibling_guard.wlatch();

        let leaf_size = LeafRef::<K>::from_page(leaf_guard.data())?.size();
        let sibling = LeafRef::<K>::from_page(sibling_guard.data())?;
        let (sibling_size, max_size) = (sibling.size(), sibling.max_size());

        if leaf_size + sibling_size < max_size {
            // Coalesce: merge the right node of the pair into the left.
            let (mut left_guard, mut right_guard) = if index == 0 {
                (leaf_guard, sibling_guard)
            } else {
                (sibling_guard, leaf_guard)
            };

            {
                let mut left = LeafMut::<K>::from_page(left_guard.data_mut())?;
                let mut right = LeafMut::<K>::from_page(right_guard.data_mut())?;
                let next = right.next_page_id();
                right.move_all_to(&mut left)?;
                left.set_next_page_id(next);
            }

            tracing::trace!(
                survivor = left_guard.page_id(),
                removed = right_guard.page_id(),
                "merged leaf into left sibling"
            );
            txn.add_deleted_page(right_guard.page_id());
            drop(left_guard);
            drop(right_guard);

            {
                let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
                parent.remove(separator_slot)?;
            }
            self.handle_internal_underflow(parent_guard, txn)
        } else {
            // Redistribute one pair; the parent separator tracks the
            // right node's new first key.
            {
                let mut leaf = LeafMut::<K>::from_page(leaf_guard.data_mut())?;
                let mut sibling = LeafMut::<K>::from_page(sibling_guard.data_mut())?;
                if index == 0 {
                    sibling.move_first_to_end_of(&mut leaf)?;
                } else {
                    sibling.move_last_to_front_of(&mut leaf)?;
                }
            }

            let new_separator = if index == 0 {
                LeafRef::<K>::from_page(sibling_guard.data())?.key_at(0)?
            } else {
                LeafRef::<K>::from_page(leaf_guard.data())?.key_at(0)?
            };
            let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
            parent.set_key_at(separator_slot, &new_separator)?;

            tracing::trace!(
                leaf = leaf_id,
                sibling = sibling_id,
                "redistributed leaf entries"
            );
            Ok(())
        }
    }

    /// Walks underflow up the internal levels after a merge removed a
    /// separator from `guard`.
    fn handle_internal_underflow<'a>(
        &'a self,
        mut guard: PageGuard<'a>,
        txn: &Transaction<'a>,
    ) -> Result<()> {
        loop {
            let (node_id, is_root, size, min_size) = {
                let header = NodeHeader::from_page(guard.data())?;
                (
                    header.page_id(),
                    header.is_root(),
                    header.size(),
                    header.min_size(),
                )
            };

            if is_root {
                return self.adjust_root(guard, txn);
            }
            if size >= min_size {
                return Ok(());
            }

            let mut parent_guard = txn
                .pop_from_page_set()
                .ok_or_else(|| eyre::eyre!("parent of node {} was not retained", node_id))?;

            let (index, sibling_id, separator_slot) = {
                let parent = InternalRef::<K>::from_page(parent_guard.data())?;
                let index = parent
                    .value_index(node_id)?
                    .ok_or_else(|| eyre::eyre!("node {} missing from its parent", node_id))?;
                let sibling_index = if index == 0 { 1 } else { index - 1 };
                let separator_slot = if index == 0 { 1 } else { index };
                (index, parent.value_at(sibling_index)?, separator_slot)
            };

            let mut sibling_guard = self.pool.fetch_page(sibling_id)?;
            sibling_guard.wlatch();

            let sibling = InternalRef::<K>::from_page(sibling_guard.data())?;
            let (sibling_size, max_size) = (sibling.size(), sibling.max_size());
            let middle_key = InternalRef::<K>::from_page(parent_guard.data())?.key_at(separator_slot)?;

            if size + sibling_size < max_size {
                // Coalesce into the left node; the separator is pulled
                // down to caption the right node's slot-0 child.
                let (mut left_guard, mut right_guard) = if index == 0 {
                    (guard, sibling_guard)
                } else {
                    (sibling_guard, guard)
                };

                {
                    let mut left = InternalMut::<K>::from_page(left_guard.data_mut())?;
                    let mut right = InternalMut::<K>::from_page(right_guard.data_mut())?;
                    right.move_all_to(&mut left, &middle_key, &self.pool)?;
                }

                tracing::trace!(
                    survivor = left_guard.page_id(),
                    removed = right_guard.page_id(),
                    "merged internal node into left sibling"
                );
                txn.add_deleted_page(right_guard.page_id());
                drop(left_guard);
                drop(right_guard);

                {
                    let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
                    parent.remove(separator_slot)?;
                }
                guard = parent_guard;
            } else {
                // Redistribute one pair through the parent separator.
                let new_separator = {
                    let mut node = InternalMut::<K>::from_page(guard.data_mut())?;
                    let mut sibling = InternalMut::<K>::from_page(sibling_guard.data_mut())?;
                    if index == 0 {
                        sibling.move_first_to_end_of(&mut node, &middle_key, &self.pool)?
                    } else {
                        sibling.move_last_to_front_of(&mut node, &middle_key, &self.pool)?
                    }
                };

                let mut parent = InternalMut::<K>::from_page(parent_guard.data_mut())?;
                parent.set_key_at(separator_slot, &new_separator)?;

                tracing::trace!(
                    node = node_id,
                    sibling = sibling_id,
                    "redistributed internal entries"
                );
                return Ok(());
            }
        }
    }

    /// Root fix-ups after a removal: an internal root left with a single
    /// child promotes that child; an emptied leaf root leaves the tree
    /// empty. Anything else stands.
    fn adjust_root<'a>(&'a self, mut root_guard: PageGuard<'a>, txn: &Transaction<'a>) -> Result<()> {
        let root_id = root_guard.page_id();
        let (is_leaf, size) = {
            let header = NodeHeader::from_page(root_guard.data())?;
            (header.is_leaf(), header.size())
        };

        if !is_leaf && size == 1 {
            let child_id = {
                let mut root = InternalMut::<K>::from_page(root_guard.data_mut())?;
                root.remove_and_return_only_child()?
            };
            drop(root_guard);
            txn.add_deleted_page(root_id);

            reparent(&self.pool, child_id, INVALID_PAGE_ID)?;
            self.set_root_page_id(child_id)?;
            tracing::debug!(root = child_id, "tree lost a level");
        } else if is_leaf && size == 0 {
            drop(root_guard);
            txn.add_deleted_page(root_id);

            self.set_root_page_id(INVALID_PAGE_ID)?;
            tracing::debug!("tree is now empty");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // write-path descent
    // ------------------------------------------------------------------

    /// Write-crabbing descent: W-latch downward, releasing all retained
    /// ancestors (and the root latch) whenever the just-latched child is
    /// safe for `mode`. Unsafe ancestors accumulate in the transaction's
    /// page set, deepest last. The caller holds the exclusive root latch.
    fn find_leaf_write<'a>(
        &'a self,
        key: &K,
        mode: AccessMode,
        txn: &Transaction<'a>,
    ) -> Result<PageGuard<'a>> {
        let root = self.root_id();
        let mut guard = self.pool.fetch_page(root)?;
        guard.wlatch();

        if Self::is_safe(NodeHeader::from_page(guard.data())?, mode) {
            self.release_root_latch(txn);
        }

        loop {
            if NodeHeader::from_page(guard.data())?.is_leaf() {
                return Ok(guard);
            }

            let child_id =
                InternalRef::<K>::from_page(guard.data())?.lookup(key, &self.comparator)?;
            let child = self.pool.fetch_page(child_id)?;
            child.wlatch();

            let safe = Self::is_safe(NodeHeader::from_page(child.data())?, mode);
            txn.add_to_page_set(guard);
            if safe {
                self.release_ancestors(txn);
            }
            guard = child;
        }
    }

    /// A node is safe when the pending change cannot propagate past it:
    /// an insert fits without splitting, a removal keeps it at or above
    /// minimum occupancy (with the root's relaxations).
    fn is_safe(header: &NodeHeader, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Insert => header.size() < header.max_size(),
            AccessMode::Remove => {
                if header.is_root() {
                    if header.is_leaf() {
                        header.size() > 1
                    } else {
                        header.size() > 2
                    }
                } else {
                    header.size() > header.min_size()
                }
            }
        }
    }

    fn release_ancestors<'a>(&'a self, txn: &Transaction<'a>) {
        txn.release_page_set();
        self.release_root_latch(txn);
    }

    fn release_root_latch<'a>(&'a self, txn: &Transaction<'a>) {
        if txn.clear_root_latched() {
            // SAFETY: the bit was set by this operation when it acquired
            // the exclusive root latch, and is cleared exactly once.
            unsafe { self.root_latch.unlock_exclusive() };
        }
    }

    /// Bulk release at the end of a write operation: drop retained
    /// guards, release the root latch, then hand deferred page deletions
    /// to the buffer pool (their pins are gone by then).
    fn finish<'a>(&'a self, txn: &Transaction<'a>) -> Result<()> {
        self.release_ancestors(txn);
        for page_id in txn.take_deleted_pages() {
            self.pool.delete_page(page_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // iteration
    // ------------------------------------------------------------------

    /// Iterator over the whole tree in key order.
    pub fn begin<'a>(&'a self, _txn: &Transaction<'_>) -> Result<IndexIterator<'a, K>> {
        let Some(guard) = self.find_leaf_read(None)? else {
            return Ok(IndexIterator::end(&self.pool));
        };
        guard.unlatch();
        Ok(IndexIterator::new(&self.pool, guard, 0))
    }

    /// Iterator positioned at the first key `>= key`.
    pub fn begin_at<'a>(&'a self, key: &K, _txn: &Transaction<'_>) -> Result<IndexIterator<'a, K>> {
        let Some(guard) = self.find_leaf_read(Some(key))? else {
            return Ok(IndexIterator::end(&self.pool));
        };

        let (slot, size, next) = {
            let leaf = LeafRef::<K>::from_page(guard.data())?;
            (
                leaf.key_index(key, &self.comparator)?,
                leaf.size(),
                leaf.next_page_id(),
            )
        };
        guard.unlatch();

        if slot < size {
            return Ok(IndexIterator::new(&self.pool, guard, slot));
        }

        // The key sorts past this leaf; the scan starts at the next one.
        drop(guard);
        if next == INVALID_PAGE_ID {
            return Ok(IndexIterator::end(&self.pool));
        }
        let next_guard = self.pool.fetch_page(next)?;
        Ok(IndexIterator::new(&self.pool, next_guard, 0))
    }

    // ------------------------------------------------------------------
    // header page
    // ------------------------------------------------------------------

    fn read_header_root(&self) -> Result<Option<PageId>> {
        let mut guard = self.pool.fetch_page(HEADER_PAGE_ID)?;
        guard.wlatch();
        let header = HeaderMut::open_or_init(guard.data_mut())?;
        header.as_ref().get_root_id(&self.index_name)
    }

    /// Persists the current root page id under the index name: a fresh
    /// record when `insert_record`, an in-place update otherwise. The
    /// header page is pinned, updated and unpinned-dirty entirely inside
    /// this method.
    fn update_root_page_id(&self, insert_record: bool) -> Result<()> {
        let mut guard = self.pool.fetch_page(HEADER_PAGE_ID)?;
        guard.wlatch();
        let root = self.root_id();
        let mut header = HeaderMut::from_page(guard.data_mut())?;
        if insert_record {
            header.insert_record(&self.index_name, root)
        } else {
            header.update_record(&self.index_name, root)
        }
    }

    fn set_root_page_id(&self, root: PageId) -> Result<()> {
        self.root_page_id.store(root, Ordering::Release);
        self.update_root_page_id(false)
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Walks the whole tree and verifies its structural invariants:
    /// header-page agreement, node occupancy, separator/subtree
    /// coherence, parent pointers and the leaf chain. Returns the number
    /// of keys. Intended for tests and debugging; takes no latches.
    pub fn check_integrity(&self, _txn: &Transaction<'_>) -> Result<usize> {
        let root = self.root_id();
        {
            let guard = self.pool.fetch_page(HEADER_PAGE_ID)?;
            let header = HeaderRef::from_page(guard.data())?;
            let recorded = header.get_root_id(&self.index_name)?;
            ensure!(
                recorded == Some(root),
                "header page records root {:?} but the tree holds {}",
                recorded,
                root
            );
        }

        if root == INVALID_PAGE_ID {
            return Ok(0);
        }

        let mut leaves = Vec::new();
        let (count, _) = self.check_node(root, INVALID_PAGE_ID, None, None, &mut leaves)?;

        // The chain must visit the leaves exactly in DFS (key) order.
        for pair in leaves.windows(2) {
            ensure!(
                pair[0].1 == pair[1].0,
                "leaf {} links to {} but key order expects {}",
                pair[0].0,
                pair[0].1,
                pair[1].0
            );
        }
        let last = leaves.last().expect("non-empty tree has a leaf");
        ensure!(
            last.1 == INVALID_PAGE_ID,
            "rightmost leaf {} has a dangling next pointer {}",
            last.0,
            last.1
        );

        Ok(count)
    }

    fn check_node(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        lower: Option<K>,
        upper: Option<K>,
        leaves: &mut Vec<(PageId, PageId)>,
    ) -> Result<(usize, K)> {
        let guard = self.pool.fetch_page(page_id)?;
        let data = guard.data();
        validate_node(data)?;

        let header = NodeHeader::from_page(data)?;
        ensure!(
            header.page_id() == page_id,
            "page {} claims id {}",
            page_id,
            header.page_id()
        );
        ensure!(
            header.parent_page_id() == expected_parent,
            "page {} claims parent {}, expected {}",
            page_id,
            header.parent_page_id(),
            expected_parent
        );
        let is_root = expected_parent == INVALID_PAGE_ID;
        if !is_root {
            ensure!(
                header.size() >= header.min_size(),
                "page {} underflows: size {} < min {}",
                page_id,
                header.size(),
                header.min_size()
            );
        }

        let cmp = &self.comparator;
        if header.is_leaf() {
            let leaf = LeafRef::<K>::from_page(data)?;
            ensure!(leaf.size() > 0, "leaf {} is empty", page_id);

            let mut prev: Option<K> = None;
            for i in 0..leaf.size() {
                let k = leaf.key_at(i)?;
                if let Some(p) = prev {
                    ensure!(
                        cmp.compare(&p, &k).is_lt(),
                        "leaf {} keys are not strictly ascending at slot {}",
                        page_id,
                        i
                    );
                }
                if let Some(lo) = lower {
                    ensure!(
                        cmp.compare(&lo, &k).is_le(),
                        "leaf {} key below its subtree bound at slot {}",
                        page_id,
                        i
                    );
                }
                if let Some(up) = upper {
                    ensure!(
                        cmp.compare(&k, &up).is_lt(),
                        "leaf {} key above its subtree bound at slot {}",
                        page_id,
                        i
                    );
                }
                prev = Some(k);
            }
            leaves.push((page_id, leaf.next_page_id()));
            Ok((leaf.size() as usize, leaf.key_at(0)?))
        } else {
            let node = InternalRef::<K>::from_page(data)?;
            ensure!(
                node.size() >= 2,
                "internal page {} has {} children",
                page_id,
                node.size()
            );

            for i in 2..node.size() {
                ensure!(
                    cmp.compare(&node.key_at(i - 1)?, &node.key_at(i)?).is_lt(),
                    "internal page {} separators not strictly ascending at slot {}",
                    page_id,
                    i
                );
            }

            let mut total = 0;
            let mut subtree_min: Option<K> = None;
            for i in 0..node.size() {
                let child_lower = if i == 0 { lower } else { Some(node.key_at(i)?) };
                let child_upper = if i + 1 < node.size() {
                    Some(node.key_at(i + 1)?)
                } else {
                    upper
                };
                let (child_count, child_min) =
                    self.check_node(node.value_at(i)?, page_id, child_lower, child_upper, leaves)?;
                total += child_count;

                if i == 0 {
                    subtree_min = Some(child_min);
                } else {
                    // A separator bounds its right subtree from below. It
                    // starts out equal to the subtree's least key and may
                    // lag behind it after that key is removed.
                    ensure!(
                        cmp.compare(&node.key_at(i)?, &child_min).is_le(),
                        "internal page {} separator at slot {} exceeds its subtree's least key",
                        page_id,
                        i
                    );
                }
            }
            Ok((total, subtree_min.expect("internal node has children")))
        }
    }
}

impl<const N: usize, C: KeyComparator<GenericKey<N>>> BPlusTree<GenericKey<N>, C> {
    /// Test entry point: inserts one integer key per line, each keyed by
    /// itself as the rid. Returns how many lines inserted a new key.
    pub fn insert_from_file<'a>(
        &'a self,
        path: impl AsRef<Path>,
        txn: &Transaction<'a>,
    ) -> Result<usize> {
        let contents = std::fs::read_to_string(path.as_ref())
            .wrap_err_with(|| format!("failed to read key file '{}'", path.as_ref().display()))?;

        let mut inserted = 0;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key: i64 = line
                .parse()
                .wrap_err_with(|| format!("invalid key '{}'", line))?;
            if self.insert(&GenericKey::from_i64(key), &Rid::from_key(key), txn)? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Test entry point: removes one integer key per line.
    pub fn remove_from_file<'a>(
        &'a self,
        path: impl AsRef<Path>,
        txn: &Transaction<'a>,
    ) -> Result<()> {
        let contents = std::fs::read_to_string(path.as_ref())
            .wrap_err_with(|| format!("failed to read key file '{}'", path.as_ref().display()))?;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let key: i64 = line
                .parse()
                .wrap_err_with(|| format!("invalid key '{}'", line))?;
            self.remove(&GenericKey::from_i64(key), txn)?;
        }
        Ok(())
    }
}
