//! # Node Page Headers
//!
//! Every tree node overlays one of two headers on the front of its page.
//! The layout is fixed and little-endian; files written on one host parse
//! on any other.
//!
//! ## Common Header (24 bytes, both node kinds)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  -------------------------------------
//! 0       4     page_type        1 = internal, 2 = leaf
//! 4       4     lsn              log sequence number (reserved)
//! 8       4     size             occupied slot count
//! 12      4     max_size         slot capacity; reaching it splits
//! 16      4     parent_page_id   INVALID_PAGE_ID iff this is the root
//! 20      4     page_id          this page's own id
//! ```
//!
//! ## Leaf Header (28 bytes)
//!
//! The common header plus `next_page_id` (4 bytes) linking to the right
//! sibling leaf; `INVALID_PAGE_ID` at the rightmost leaf.
//!
//! The slot array of `(key, value)` pairs starts immediately after the
//! header. `max_size` is stored rather than derived so that pages built
//! with a test-sized capacity stay self-describing.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{INVALID_PAGE_ID, LEAF_HEADER_SIZE, NODE_HEADER_SIZE, PAGE_SIZE};
use crate::zerocopy_accessors;

const PAGE_TYPE_INTERNAL: u32 = 1;
const PAGE_TYPE_LEAF: u32 = 2;

/// Byte offset of `parent_page_id` within a node page. Structure
/// modifications rewrite this one field on moved children through a raw
/// pointer (see `btree::internal::reparent`).
pub(crate) const PARENT_PTR_OFFSET: usize = std::mem::offset_of!(NodeHeader, parent_page_id);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
}

impl NodeType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            PAGE_TYPE_INTERNAL => Some(NodeType::Internal),
            PAGE_TYPE_LEAF => Some(NodeType::Leaf),
            _ => None,
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            NodeType::Internal => PAGE_TYPE_INTERNAL,
            NodeType::Leaf => PAGE_TYPE_LEAF,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    page_type: U32,
    lsn: U32,
    size: U32,
    max_size: U32,
    parent_page_id: U32,
    page_id: U32,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn from_page(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    pub fn from_page_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= NODE_HEADER_SIZE,
            "buffer too small for NodeHeader: {} < {}",
            data.len(),
            NODE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))
    }

    zerocopy_accessors! {
        lsn: u32,
        size: u32,
        max_size: u32,
        parent_page_id: u32,
        page_id: u32,
    }

    pub fn node_type(&self) -> Option<NodeType> {
        NodeType::from_u32(self.page_type.get())
    }

    pub fn set_node_type(&mut self, ty: NodeType) {
        self.page_type = U32::new(ty.as_u32());
    }

    pub fn is_leaf(&self) -> bool {
        self.page_type.get() == PAGE_TYPE_LEAF
    }

    pub fn is_root(&self) -> bool {
        self.parent_page_id() == INVALID_PAGE_ID
    }

    /// Minimum occupancy of a non-root node: ⌊max_size / 2⌋, the size of
    /// the smaller half a split produces.
    pub fn min_size(&self) -> u32 {
        self.max_size() / 2
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafHeader {
    node: NodeHeader,
    next_page_id: U32,
}

const _: () = assert!(std::mem::size_of::<LeafHeader>() == LEAF_HEADER_SIZE);

impl LeafHeader {
    pub fn from_page(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= LEAF_HEADER_SIZE,
            "buffer too small for LeafHeader: {} < {}",
            data.len(),
            LEAF_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..LEAF_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read LeafHeader: {:?}", e))
    }

    pub fn from_page_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= LEAF_HEADER_SIZE,
            "buffer too small for LeafHeader: {} < {}",
            data.len(),
            LEAF_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..LEAF_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read LeafHeader: {:?}", e))
    }

    pub fn node(&self) -> &NodeHeader {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut NodeHeader {
        &mut self.node
    }

    zerocopy_accessors! {
        next_page_id: u32,
    }
}

/// Checks the header fields a freshly fetched node page must satisfy
/// before any typed view is laid over it.
pub fn validate_node(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = NodeHeader::from_page(data)?;
    ensure!(
        header.node_type().is_some(),
        "invalid node page type: {:#x}",
        header.page_type.get()
    );
    ensure!(
        header.size() <= header.max_size(),
        "node size {} exceeds max_size {}",
        header.size(),
        header.max_size()
    );
    Ok(())
}
