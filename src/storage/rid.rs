//! # Record Identifiers
//!
//! A [`Rid`] names one tuple in a heap file: which file, which page of that
//! file, and which slot within the page. The B+Tree stores rids as opaque
//! leaf values; nothing in the tree interprets them beyond equality.
//!
//! Rids are persisted verbatim inside leaf pages, so the struct is a
//! zerocopy wire type with little-endian fields.

use std::fmt;

use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::zerocopy_accessors;

/// On-disk size of a [`Rid`] in bytes.
pub const RID_SIZE: usize = 12;

/// Identifier of a tuple in a heap file: (file, page, slot).
#[repr(C)]
#[derive(
    Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned, Default,
)]
pub struct Rid {
    file_id: U32,
    page_no: U32,
    slot: U32,
}

const _: () = assert!(std::mem::size_of::<Rid>() == RID_SIZE);

impl Rid {
    pub fn new(file_id: u32, page_no: u32, slot: u32) -> Self {
        Self {
            file_id: U32::new(file_id),
            page_no: U32::new(page_no),
            slot: U32::new(slot),
        }
    }

    /// Rid derived from an integer key. The file-driven test entry points
    /// insert each key with itself as the rid.
    pub fn from_key(key: i64) -> Self {
        Self::new(0, (key >> 32) as u32, key as u32)
    }

    zerocopy_accessors! {
        file_id: u32,
        page_no: u32,
        slot: u32,
    }
}

impl fmt::Debug for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rid({}:{}:{})",
            self.file_id(),
            self.page_no(),
            self.slot()
        )
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_id(), self.page_no(), self.slot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn rid_is_twelve_bytes() {
        assert_eq!(std::mem::size_of::<Rid>(), RID_SIZE);
    }

    #[test]
    fn rid_round_trips_through_bytes() {
        let rid = Rid::new(3, 77, 12);
        let bytes = rid.as_bytes().to_vec();

        let parsed = Rid::read_from_bytes(&bytes).unwrap();
        assert_eq!(parsed, rid);
        assert_eq!(parsed.file_id(), 3);
        assert_eq!(parsed.page_no(), 77);
        assert_eq!(parsed.slot(), 12);
    }

    #[test]
    fn rid_from_key_splits_the_integer() {
        let rid = Rid::from_key(0x0000_0001_0000_002A);

        assert_eq!(rid.file_id(), 0);
        assert_eq!(rid.page_no(), 1);
        assert_eq!(rid.slot(), 42);
    }

    #[test]
    fn rid_display_is_colon_separated() {
        assert_eq!(Rid::new(1, 2, 3).to_string(), "1:2:3");
    }
}
