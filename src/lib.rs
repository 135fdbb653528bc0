//! # Arbor: Disk-Backed B+Tree Index
//!
//! Arbor is an ordered index engine: a B+Tree over fixed-size pages,
//! mediated by a pinning buffer pool, mapping fixed-width keys to record
//! ids with unique-key semantics. It supports point lookup, insertion
//! with node splits, deletion with redistribution and merges, and
//! in-order range iteration over linked leaves. Operations run
//! concurrently via per-page latch crabbing.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor::{BPlusTree, BufferPoolManager, GenericComparator, GenericKey,
//!             PageFile, Rid, Transaction};
//!
//! # fn main() -> eyre::Result<()> {
//! let file = PageFile::create("orders.idx")?;
//! let pool = Arc::new(BufferPoolManager::new(64, file)?);
//! let tree = BPlusTree::new("orders_pk", pool, GenericComparator::<8>)?;
//!
//! let txn = Transaction::new();
//! tree.insert(&GenericKey::from_i64(42), &Rid::new(0, 7, 3), &txn)?;
//! assert!(tree.get(&GenericKey::from_i64(42), &txn)?.is_some());
//!
//! for item in tree.begin(&txn)? {
//!     let (key, rid) = item?;
//!     println!("{} -> {}", key.to_i64(), rid);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        BPlusTree / iterators         │   btree
//! ├─────────────────────────────────────┤
//! │   node page views (leaf, internal)   │   btree::{leaf, internal}
//! ├─────────────────────────────────────┤
//! │  BufferPoolManager (pins, latches,   │   buffer
//! │       SIEVE eviction, guards)        │
//! ├─────────────────────────────────────┤
//! │  PageFile (4 KiB pages, mmap I/O)    │   storage
//! └─────────────────────────────────────┘
//! ```
//!
//! Page 0 of the index file is a directory persisting each tree's root
//! page id under its index name; every root change rewrites that record.
//!
//! ## Module Overview
//!
//! - [`btree`]: the tree, its node page views, keys and iterators
//! - [`buffer`]: frame pool with pin/unpin, page latches and eviction
//! - [`storage`]: the paged file, record ids and the header-page
//!   directory
//! - [`txn`]: per-operation context holding latched pages and deferred
//!   deletions
//! - [`config`]: page geometry and pool sizing constants

mod macros;

pub mod btree;
pub mod buffer;
pub mod config;
pub mod storage;
pub mod txn;

pub use btree::{
    BPlusTree, GenericComparator, GenericKey, IndexIterator, IndexKey, KeyComparator,
};
pub use buffer::{BufferPoolManager, PageGuard};
pub use config::{PageId, DEFAULT_POOL_SIZE, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};
pub use storage::{PageFile, Rid};
pub use txn::Transaction;
