//! # Buffer Module
//!
//! The page cache between the B+Tree and the [`crate::storage::PageFile`]:
//! a fixed frame array with pin counting, SIEVE eviction, per-frame page
//! latches and RAII pin guards.

mod pool;

pub use pool::{BufferPoolManager, LatchMode, PageGuard};
