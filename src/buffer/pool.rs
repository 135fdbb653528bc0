//! # Buffer Pool Manager
//!
//! A fixed set of page frames fronting the [`PageFile`]. Every page access
//! in the crate goes through here: callers fetch a page, receive a pinned
//! [`PageGuard`], read or mutate the frame bytes under the page latch, and
//! drop the guard to unpin. Frames holding unpinned pages are recycled with
//! the SIEVE eviction algorithm.
//!
//! ## Why SIEVE?
//!
//! LRU collapses under sequential scans: every scanned page becomes "most
//! recent" and pushes out pages that are about to be reused. SIEVE keeps a
//! `visited` flag per frame and sweeps a hand over the frames on eviction:
//!
//! - On access: set `visited`
//! - On eviction: a visited frame gets a second chance (flag cleared,
//!   hand advances); an unvisited, unpinned frame is evicted
//!
//! Hot pages (the upper tree levels) keep their visited bit set and stay
//! resident; scan pages fall out after one pass.
//!
//! ## Pin/Unpin Protocol
//!
//! A page's frame cannot be evicted while its pin count is above zero.
//! Every fetch pins exactly once and every [`PageGuard`] drop unpins
//! exactly once, so pins balance on all paths, including error paths.
//!
//! ## Page Latches
//!
//! Each frame carries a read/write latch, separate from the pin count,
//! protecting the page bytes during an operation. The tree's traversal
//! latches pages hand-over-hand; the guard releases any latch it still
//! holds on drop. Latching is the caller's protocol: [`PageGuard::data`]
//! is only meaningful under at least an R-latch, [`PageGuard::data_mut`]
//! under the W-latch.
//!
//! ## Failure Modes
//!
//! - `fetch_page` / `new_page` fail when every frame is pinned (the pool
//!   is too small for the operation's working set)
//! - `new_page` fails when the file cannot grow
//! - `delete_page` refuses pages that are still pinned
//!
//! The tree surfaces these as fatal operation errors without masking them.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::config::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::storage::PageFile;

/// Latch mode held by a [`PageGuard`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Read,
    Write,
}

struct Frame {
    /// Page currently resident in this frame, `INVALID_PAGE_ID` if none.
    /// Written only under the pool state lock.
    page_id: AtomicU32,
    pin_count: AtomicU32,
    dirty: AtomicBool,
    visited: AtomicBool,
    latch: RawRwLock,
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count)
            .field("dirty", &self.dirty)
            .field("visited", &self.visited)
            .finish()
    }
}

// SAFETY: `data` is the only non-Sync field. Access to it is governed by
// the pool protocol: unmapped frames are touched only under the pool state
// lock, and mapped frames only through a pinned PageGuard whose caller
// holds the frame latch in the required mode. The pin count (AcqRel)
// orders a dropping writer's stores before any later eviction that
// observes pin_count == 0.
unsafe impl Sync for Frame {}

impl Frame {
    fn new() -> Self {
        Self {
            page_id: AtomicU32::new(INVALID_PAGE_ID),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            visited: AtomicBool::new(false),
            latch: RawRwLock::INIT,
            data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
        }
    }

    fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin called on an unpinned frame");
    }
}

struct PoolState {
    page_table: HashMap<PageId, usize>,
    free_frames: Vec<usize>,
    /// Page ids released by `delete_page`, recycled before growing the file.
    free_pages: Vec<PageId>,
    hand: usize,
}

pub struct BufferPoolManager {
    frames: Box<[Frame]>,
    state: Mutex<PoolState>,
    file: Mutex<PageFile>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, file: PageFile) -> Result<Self> {
        ensure!(pool_size >= 2, "buffer pool needs at least 2 frames");

        let frames: Vec<Frame> = (0..pool_size).map(|_| Frame::new()).collect();
        let state = PoolState {
            page_table: HashMap::with_capacity(pool_size),
            free_frames: (0..pool_size).rev().collect(),
            free_pages: Vec::new(),
            hand: 0,
        };

        Ok(Self {
            frames: frames.into_boxed_slice(),
            state: Mutex::new(state),
            file: Mutex::new(file),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    /// Pins the page and returns a guard over its frame, reading it from
    /// disk on a miss. Fails when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageGuard<'_>> {
        ensure!(
            page_id != INVALID_PAGE_ID,
            "cannot fetch the invalid page id"
        );

        let mut state = self.state.lock();

        if let Some(&fid) = state.page_table.get(&page_id) {
            let frame = &self.frames[fid];
            frame.pin();
            frame.visited.store(true, Ordering::Release);
            return Ok(self.guard(fid, page_id));
        }

        let fid = self.take_victim(&mut state)?;
        {
            // SAFETY: the frame is unmapped with pin count 0 and the state
            // lock is held, so no other thread can reach this buffer.
            let data = unsafe { &mut **self.frames[fid].data.get() };
            if let Err(e) = self.file.lock().read_page(page_id, &mut data[..]) {
                state.free_frames.push(fid);
                return Err(e);
            }
        }

        let frame = &self.frames[fid];
        frame.page_id.store(page_id, Ordering::Release);
        frame.dirty.store(false, Ordering::Release);
        frame.visited.store(true, Ordering::Release);
        frame.pin_count.store(1, Ordering::Release);
        state.page_table.insert(page_id, fid);

        Ok(self.guard(fid, page_id))
    }

    /// Allocates a fresh page (recycling deleted ids before growing the
    /// file), pins it into a zeroed frame and returns the guard. The new
    /// page is born dirty.
    pub fn new_page(&self) -> Result<PageGuard<'_>> {
        let mut state = self.state.lock();

        let fid = self.take_victim(&mut state)?;
        let page_id = match state.free_pages.pop() {
            Some(id) => id,
            None => match self.file.lock().allocate() {
                Ok(id) => id,
                Err(e) => {
                    state.free_frames.push(fid);
                    return Err(e.wrap_err("buffer pool could not allocate a new page"));
                }
            },
        };

        {
            // SAFETY: unmapped frame, pin count 0, state lock held.
            let data = unsafe { &mut **self.frames[fid].data.get() };
            data.fill(0);
        }

        let frame = &self.frames[fid];
        frame.page_id.store(page_id, Ordering::Release);
        frame.dirty.store(true, Ordering::Release);
        frame.visited.store(true, Ordering::Release);
        frame.pin_count.store(1, Ordering::Release);
        state.page_table.insert(page_id, fid);

        Ok(self.guard(fid, page_id))
    }

    /// Releases one pin. Balances exactly one fetch; [`PageGuard`] calls
    /// this implicitly on drop.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) {
        let state = self.state.lock();
        if let Some(&fid) = state.page_table.get(&page_id) {
            let frame = &self.frames[fid];
            if is_dirty {
                frame.dirty.store(true, Ordering::Release);
            }
            frame.unpin();
        }
    }

    /// Drops a page from the pool and recycles its id. The page must be
    /// unpinned; its on-disk bytes are left as garbage.
    pub fn delete_page(&self, page_id: PageId) -> Result<()> {
        let mut state = self.state.lock();

        if let Some(&fid) = state.page_table.get(&page_id) {
            let frame = &self.frames[fid];
            let pins = frame.pin_count.load(Ordering::Acquire);
            ensure!(
                pins == 0,
                "cannot delete page {} while pinned (pin_count={})",
                page_id,
                pins
            );
            state.page_table.remove(&page_id);
            frame.page_id.store(INVALID_PAGE_ID, Ordering::Release);
            frame.dirty.store(false, Ordering::Release);
            state.free_frames.push(fid);
        }

        state.free_pages.push(page_id);
        Ok(())
    }

    /// Writes one resident page back to disk if dirty.
    pub fn flush_page(&self, page_id: PageId) -> Result<()> {
        let state = self.state.lock();
        if let Some(&fid) = state.page_table.get(&page_id) {
            self.write_back(fid, page_id)?;
        }
        Ok(())
    }

    /// Writes every dirty resident page back and syncs the file.
    pub fn flush_all(&self) -> Result<()> {
        let state = self.state.lock();
        for (&page_id, &fid) in state.page_table.iter() {
            self.write_back(fid, page_id)?;
        }
        self.file.lock().sync()
    }

    fn write_back(&self, fid: usize, page_id: PageId) -> Result<()> {
        let frame = &self.frames[fid];
        if frame.dirty.load(Ordering::Acquire) {
            // SAFETY: the state lock is held, so the frame cannot be
            // remapped underneath us. Flushing expects quiesced pages;
            // callers flush at operation boundaries.
            let data = unsafe { &**frame.data.get() };
            self.file.lock().write_page(page_id, &data[..])?;
            frame.dirty.store(false, Ordering::Release);
        }
        Ok(())
    }

    fn guard(&self, fid: usize, page_id: PageId) -> PageGuard<'_> {
        PageGuard {
            frame: &self.frames[fid],
            page_id,
            latch: Cell::new(None),
        }
    }

    /// Picks a frame for reuse: the free list first, then a SIEVE sweep.
    /// Evicts the victim's current page (writing it back if dirty).
    fn take_victim(&self, state: &mut PoolState) -> Result<usize> {
        if let Some(fid) = state.free_frames.pop() {
            return Ok(fid);
        }

        let n = self.frames.len();
        // Two sweeps: the first clears visited bits, the second must find
        // an unvisited unpinned frame unless everything is pinned.
        for _ in 0..2 * n {
            let fid = state.hand;
            state.hand = (state.hand + 1) % n;

            let frame = &self.frames[fid];
            if frame.pin_count.load(Ordering::Acquire) > 0 {
                continue;
            }
            if frame.visited.swap(false, Ordering::AcqRel) {
                continue;
            }

            self.evict(state, fid)?;
            return Ok(fid);
        }

        bail!("all {} frames are pinned, cannot evict", n)
    }

    fn evict(&self, state: &mut PoolState, fid: usize) -> Result<()> {
        let frame = &self.frames[fid];
        let old = frame.page_id.load(Ordering::Acquire);
        if old != INVALID_PAGE_ID {
            self.write_back(fid, old)?;
            state.page_table.remove(&old);
            frame.page_id.store(INVALID_PAGE_ID, Ordering::Release);
        }
        Ok(())
    }
}

/// A pinned page. Dropping the guard releases any latch it still holds
/// and unpins the frame, on every path.
#[derive(Debug)]
pub struct PageGuard<'a> {
    frame: &'a Frame,
    page_id: PageId,
    latch: Cell<Option<LatchMode>>,
}

impl<'a> PageGuard<'a> {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The page bytes. Only meaningful while this guard holds at least an
    /// R-latch; the crabbing protocol in the tree guarantees that.
    pub fn data(&self) -> &[u8] {
        // SAFETY: the pin keeps this frame mapped to our page for the
        // guard's lifetime. Concurrent mutation is excluded by the page
        // latch protocol (writers hold the W-latch exclusively).
        unsafe { &(**self.frame.data.get())[..] }
    }

    /// Mutable page bytes; marks the frame dirty. Callers hold the
    /// W-latch.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.frame.dirty.store(true, Ordering::Release);
        // SAFETY: as in data(), plus `&mut self` gives this guard
        // exclusive use of the borrow and the caller holds the W-latch,
        // excluding all other readers and writers.
        unsafe { &mut (**self.frame.data.get())[..] }
    }

    /// Raw pointer into the page bytes, for single-field header writes
    /// that are serialized by a latch on another page (a child's parent
    /// pointer is written under its parent's W-latch).
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: pointer creation only; all dereferences document their
        // own protocol.
        unsafe { (*self.frame.data.get()).as_mut_ptr() }
    }

    pub fn mark_dirty(&self) {
        self.frame.dirty.store(true, Ordering::Release);
    }

    pub fn rlatch(&self) {
        debug_assert!(self.latch.get().is_none(), "guard is already latched");
        self.frame.latch.lock_shared();
        self.latch.set(Some(LatchMode::Read));
    }

    pub fn wlatch(&self) {
        debug_assert!(self.latch.get().is_none(), "guard is already latched");
        self.frame.latch.lock_exclusive();
        self.latch.set(Some(LatchMode::Write));
    }

    pub fn unlatch(&self) {
        match self.latch.take() {
            // SAFETY: this guard set the mode when it acquired the latch,
            // so it releases exactly what it holds.
            Some(LatchMode::Read) => unsafe { self.frame.latch.unlock_shared() },
            Some(LatchMode::Write) => unsafe { self.frame.latch.unlock_exclusive() },
            None => {}
        }
    }

    pub fn latch_mode(&self) -> Option<LatchMode> {
        self.latch.get()
    }
}

impl Drop for PageGuard<'_> {
    fn drop(&mut self) {
        self.unlatch();
        self.frame.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pool(frames: usize) -> (tempfile::TempDir, BufferPoolManager) {
        let dir = tempdir().unwrap();
        let file = PageFile::create(dir.path().join("pool.db")).unwrap();
        let pool = BufferPoolManager::new(frames, file).unwrap();
        (dir, pool)
    }

    #[test]
    fn new_page_is_zeroed_and_pinned() {
        let (_dir, pool) = make_pool(4);

        let mut guard = pool.new_page().unwrap();
        assert_eq!(guard.page_id(), 1);
        assert!(guard.data().iter().all(|&b| b == 0));

        guard.data_mut()[0] = 0x42;
        drop(guard);

        let guard = pool.fetch_page(1).unwrap();
        assert_eq!(guard.data()[0], 0x42);
    }

    #[test]
    fn eviction_writes_dirty_pages_back() {
        let (_dir, pool) = make_pool(2);

        let mut ids = Vec::new();
        for i in 0..6u8 {
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[0] = i;
            ids.push(guard.page_id());
        }

        for (i, &id) in ids.iter().enumerate() {
            let guard = pool.fetch_page(id).unwrap();
            assert_eq!(guard.data()[0], i as u8, "page {} lost its bytes", id);
        }
    }

    #[test]
    fn fetch_fails_when_all_frames_are_pinned() {
        let (_dir, pool) = make_pool(2);

        let _a = pool.new_page().unwrap();
        let _b = pool.new_page().unwrap();

        let err = pool.new_page().unwrap_err();
        assert!(err.to_string().contains("pinned"));
    }

    #[test]
    fn dropping_a_guard_releases_its_frame() {
        let (_dir, pool) = make_pool(2);

        let a = pool.new_page().unwrap();
        let b = pool.new_page().unwrap();
        drop(a);
        drop(b);

        pool.new_page().unwrap();
    }

    #[test]
    fn delete_refuses_pinned_pages() {
        let (_dir, pool) = make_pool(4);

        let guard = pool.new_page().unwrap();
        let id = guard.page_id();

        let err = pool.delete_page(id).unwrap_err();
        assert!(err.to_string().contains("while pinned"));

        drop(guard);
        pool.delete_page(id).unwrap();
    }

    #[test]
    fn deleted_page_ids_are_recycled() {
        let (_dir, pool) = make_pool(4);

        let id = {
            let guard = pool.new_page().unwrap();
            guard.page_id()
        };
        pool.delete_page(id).unwrap();

        let guard = pool.new_page().unwrap();
        assert_eq!(guard.page_id(), id);
    }

    #[test]
    fn flush_all_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.db");

        let page_id;
        {
            let file = PageFile::create(&path).unwrap();
            let pool = BufferPoolManager::new(4, file).unwrap();
            let mut guard = pool.new_page().unwrap();
            guard.data_mut()[100] = 0x77;
            page_id = guard.page_id();
            drop(guard);
            pool.flush_all().unwrap();
        }

        let file = PageFile::open(&path).unwrap();
        let pool = BufferPoolManager::new(4, file).unwrap();
        let guard = pool.fetch_page(page_id).unwrap();
        assert_eq!(guard.data()[100], 0x77);
    }

    #[test]
    fn sieve_gives_visited_frames_a_second_chance() {
        let (_dir, pool) = make_pool(3);

        let p1 = pool.new_page().unwrap().page_id();
        let p2 = pool.new_page().unwrap().page_id();
        let p3 = pool.new_page().unwrap().page_id();

        // First eviction sweep clears every visited bit and reclaims the
        // frame holding p1.
        let _p4 = pool.new_page().unwrap();
        {
            let state = pool.state.lock();
            assert!(!state.page_table.contains_key(&p1));
        }

        // Touch p2 so the next sweep skips it and takes p3 instead.
        drop(pool.fetch_page(p2).unwrap());
        let _p5 = pool.new_page().unwrap();

        let state = pool.state.lock();
        assert!(state.page_table.contains_key(&p2));
        assert!(!state.page_table.contains_key(&p3));
    }

    #[test]
    fn read_latches_are_shared() {
        let (_dir, pool) = make_pool(4);

        let id = pool.new_page().unwrap().page_id();
        let a = pool.fetch_page(id).unwrap();
        let b = pool.fetch_page(id).unwrap();

        a.rlatch();
        b.rlatch();
        assert_eq!(a.latch_mode(), Some(LatchMode::Read));
        assert_eq!(b.latch_mode(), Some(LatchMode::Read));
    }

    #[test]
    fn unpin_page_balances_an_explicit_fetch() {
        let (_dir, pool) = make_pool(2);

        let id = pool.new_page().unwrap().page_id();
        let guard = pool.fetch_page(id).unwrap();
        // Simulate a caller that tracks pages by id rather than by guard.
        std::mem::forget(guard);
        pool.unpin_page(id, true);

        // Both frames must be reclaimable again.
        let _a = pool.new_page().unwrap();
        let _b = pool.new_page().unwrap();
    }
}
