//! # Arbor Configuration Constants
//!
//! This module centralizes the crate's configuration values. Constants that
//! depend on each other are co-located and the derivations are enforced with
//! compile-time assertions so the page geometry cannot drift out of sync
//! with the node header layouts.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> NODE_HEADER_SIZE (24 bytes, fixed wire layout)
//!       │
//!       ├─> LEAF_HEADER_SIZE (derived: NODE_HEADER_SIZE + 4)
//!       │
//!       └─> node fan-out (derived per key width in btree::node)
//!
//! HEADER_PAGE_ID (0)
//!       │
//!       └─> PageFile::create always seeds page 0 so the id is valid
//!           from the first open
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `LEAF_HEADER_SIZE == NODE_HEADER_SIZE + 4` (leaf appends one u32)
//! 2. `INVALID_PAGE_ID` is never produced by allocation (`PageFile` grows
//!    one page at a time from 1 and would exhaust disk long before u32::MAX)
//! 3. `DEFAULT_POOL_SIZE` must exceed the deepest latch-crabbing working
//!    set (root-to-leaf chain + sibling + header page); trees deeper than
//!    the pool deadlock on fetch

/// Size of every page in bytes. The unit of disk I/O and buffer residency.
pub const PAGE_SIZE: usize = 4096;

/// Page identifier. `u32` indexes pages within a single index file.
pub type PageId = u32;

/// Sentinel page id: "no page". Used for an empty tree's root, a root
/// node's parent pointer and the rightmost leaf's next pointer.
pub const INVALID_PAGE_ID: PageId = u32::MAX;

/// The reserved directory page holding (index name -> root page id)
/// records. Always page 0 of the index file.
pub const HEADER_PAGE_ID: PageId = 0;

/// Size of the header common to both node kinds:
/// page_type(4) + lsn(4) + size(4) + max_size(4) + parent_page_id(4) +
/// page_id(4).
pub const NODE_HEADER_SIZE: usize = 24;

/// Leaf node header size: the common header plus next_page_id(4).
pub const LEAF_HEADER_SIZE: usize = NODE_HEADER_SIZE + 4;

/// Default number of frames in the buffer pool.
pub const DEFAULT_POOL_SIZE: usize = 64;

const _: () = assert!(
    LEAF_HEADER_SIZE == NODE_HEADER_SIZE + 4,
    "leaf header must be the common header plus one u32 next pointer"
);

const _: () = assert!(
    PAGE_SIZE > LEAF_HEADER_SIZE,
    "pages must have room for slots after the node headers"
);
