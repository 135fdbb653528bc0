//! # Index Iterator
//!
//! Forward cursor over the linked leaves from a starting (leaf, slot)
//! position. The iterator pins exactly one leaf at a time; advancing past
//! a leaf's last slot fetches the next leaf and unpins the current one.
//!
//! Iteration is read-only and takes no latches: concurrent structural
//! modification of the tree invalidates an iterator (not detected, per
//! the index contract). Use it on a quiesced tree or under external
//! coordination.

use std::marker::PhantomData;

use eyre::Result;

use crate::btree::key::IndexKey;
use crate::btree::leaf::LeafRef;
use crate::buffer::{BufferPoolManager, PageGuard};
use crate::config::INVALID_PAGE_ID;
use crate::storage::Rid;

pub struct IndexIterator<'a, K> {
    pool: &'a BufferPoolManager,
    leaf: Option<PageGuard<'a>>,
    slot: u32,
    _key: PhantomData<K>,
}

impl<'a, K: IndexKey> IndexIterator<'a, K> {
    pub(crate) fn new(pool: &'a BufferPoolManager, leaf: PageGuard<'a>, slot: u32) -> Self {
        Self {
            pool,
            leaf: Some(leaf),
            slot,
            _key: PhantomData,
        }
    }

    pub(crate) fn end(pool: &'a BufferPoolManager) -> Self {
        Self {
            pool,
            leaf: None,
            slot: 0,
            _key: PhantomData,
        }
    }

    /// True once the cursor has moved past the last slot of the rightmost
    /// leaf.
    pub fn is_end(&self) -> bool {
        self.leaf.is_none()
    }
}

impl<K: IndexKey> Iterator for IndexIterator<'_, K> {
    type Item = Result<(K, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = {
                let guard = self.leaf.as_ref()?;
                let leaf = match LeafRef::<K>::from_page(guard.data()) {
                    Ok(leaf) => leaf,
                    Err(e) => return Some(Err(e)),
                };
                if self.slot < leaf.size() {
                    Ok(leaf.item_at(self.slot))
                } else {
                    Err(leaf.next_page_id())
                }
            };

            match step {
                Ok(item) => {
                    self.slot += 1;
                    return Some(item);
                }
                Err(INVALID_PAGE_ID) => {
                    self.leaf = None;
                    return None;
                }
                Err(next) => match self.pool.fetch_page(next) {
                    Ok(guard) => {
                        // Replacing the guard unpins the exhausted leaf.
                        self.leaf = Some(guard);
                        self.slot = 0;
                    }
                    Err(e) => {
                        self.leaf = None;
                        return Some(Err(e));
                    }
                },
            }
        }
    }
}
