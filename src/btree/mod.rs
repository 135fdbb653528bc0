//! # B+Tree Index
//!
//! A disk-oriented B+Tree mapping fixed-width keys to record ids, built
//! on the buffer pool's 4 KiB pages.
//!
//! ## Node Design
//!
//! Two node kinds share a common header and pack their slot arrays into
//! one page each:
//!
//! - **Leaf nodes** hold the `(key, rid)` pairs in key order and chain to
//!   their right sibling for range scans.
//! - **Internal nodes** hold `(separator, child page id)` pairs; slot 0
//!   carries only the leftmost child. A separator is the least key of its
//!   right subtree, and equality routes right.
//!
//! Node access is zero-reinterpretation: borrowed typed views read and
//! write fields at computed offsets via `zerocopy`, never by casting the
//! page buffer to a struct.
//!
//! ## Module Organization
//!
//! - `key`: key trait bounds, [`GenericKey`] and comparators
//! - `node`: the bit-exact node headers shared by both kinds
//! - `leaf` / `internal`: typed page views with the split/merge
//!   primitives
//! - `tree`: [`BPlusTree`] with search, insert, remove, iteration,
//!   latch-crabbing and root maintenance
//! - `iter`: [`IndexIterator`] over the leaf chain

mod internal;
mod iter;
mod key;
mod leaf;
mod node;
mod tree;

pub use internal::{internal_capacity, InternalMut, InternalRef};
pub use iter::IndexIterator;
pub use key::{GenericComparator, GenericKey, IndexKey, KeyComparator};
pub use leaf::{leaf_capacity, LeafMut, LeafRef};
pub use node::{NodeHeader, NodeType};
pub use tree::BPlusTree;
