//! # Transaction Context
//!
//! A [`Transaction`] travels with every tree operation and records the
//! resources the operation holds mid-flight:
//!
//! - the **page set**: W-latched ancestor guards retained during
//!   latch-crabbing, root-first. It doubles as the explicit stack that the
//!   split and merge cascades pop instead of re-fetching parents.
//! - the **deleted set**: page ids of nodes discarded by a merge or root
//!   collapse. They stay pinned until the bulk release, then the tree
//!   hands them back to the buffer pool.
//!
//! The tree releases everything in bulk when a descent proves safe or the
//! operation finishes; dropping the guards unlatches and unpins in order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::buffer::PageGuard;
use crate::config::PageId;

static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

pub struct Transaction<'a> {
    id: u64,
    thread: ThreadId,
    page_set: Mutex<Vec<PageGuard<'a>>>,
    deleted_pages: Mutex<SmallVec<[PageId; 4]>>,
    root_latched: AtomicBool,
}

impl<'a> Transaction<'a> {
    pub fn new() -> Self {
        Self {
            id: NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed),
            thread: std::thread::current().id(),
            page_set: Mutex::new(Vec::new()),
            deleted_pages: Mutex::new(SmallVec::new()),
            root_latched: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Retains a latched ancestor. Guards are pushed in descent order, so
    /// the set reads root-first.
    pub fn add_to_page_set(&self, guard: PageGuard<'a>) {
        self.page_set.lock().push(guard);
    }

    /// Pops the deepest retained ancestor (the immediate parent of the
    /// node a cascade is currently fixing up).
    pub fn pop_from_page_set(&self) -> Option<PageGuard<'a>> {
        self.page_set.lock().pop()
    }

    /// Releases every retained guard, top-down. Dropping a guard unlatches
    /// and unpins it.
    pub fn release_page_set(&self) {
        let mut pages = self.page_set.lock();
        for guard in pages.drain(..) {
            drop(guard);
        }
    }

    pub fn page_set_len(&self) -> usize {
        self.page_set.lock().len()
    }

    /// Headers of the retained ancestors, shallowest first, observed
    /// through `f`. Used to size split reservations before any mutation.
    pub fn inspect_page_set<T>(&self, f: impl FnMut(&PageGuard<'a>) -> T) -> Vec<T> {
        self.page_set.lock().iter().map(f).collect()
    }

    /// Defers a page deallocation until the operation's latches are gone.
    pub fn add_deleted_page(&self, page_id: PageId) {
        self.deleted_pages.lock().push(page_id);
    }

    pub fn take_deleted_pages(&self) -> SmallVec<[PageId; 4]> {
        std::mem::take(&mut *self.deleted_pages.lock())
    }

    pub fn mark_root_latched(&self) {
        self.root_latched.store(true, Ordering::Release);
    }

    /// Clears the root-latch note, reporting whether it was set. The tree
    /// owns the actual latch; this is only the bookkeeping bit.
    pub fn clear_root_latched(&self) -> bool {
        self.root_latched.swap(false, Ordering::AcqRel)
    }
}

impl Default for Transaction<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_get_distinct_ids() {
        let a = Transaction::new();
        let b = Transaction::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn deleted_pages_drain_once() {
        let txn = Transaction::new();
        txn.add_deleted_page(7);
        txn.add_deleted_page(9);

        let drained = txn.take_deleted_pages();
        assert_eq!(drained.as_slice(), &[7, 9]);
        assert!(txn.take_deleted_pages().is_empty());
    }

    #[test]
    fn root_latch_note_clears_on_read() {
        let txn = Transaction::new();
        assert!(!txn.clear_root_latched());

        txn.mark_root_latched();
        assert!(txn.clear_root_latched());
        assert!(!txn.clear_root_latched());
    }
}
