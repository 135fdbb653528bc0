//! # Header Page
//!
//! Page 0 of every index file is a directory mapping index names to root
//! page ids. The B+Tree looks its root up here on open and writes the
//! record back every time the root changes, so a reopened file finds its
//! tree again.
//!
//! ## Page Layout
//!
//! ```text
//! +---------------------------+
//! | magic (8 bytes)           |  "arboridx"
//! | record_count (4 bytes)    |
//! +---------------------------+
//! | IndexRecord 0 (40 bytes)  |  name[36] + root_page_id(4)
//! | IndexRecord 1 (40 bytes)  |
//! | ...                       |
//! +---------------------------+
//! ```
//!
//! Records are unordered; lookups scan. A 4 KiB page holds 102 records,
//! plenty for the indexes one file is expected to carry.
//!
//! Like the node pages, the directory is accessed through borrowed views
//! over the pinned page bytes: [`HeaderRef`] for reads, [`HeaderMut`] for
//! updates. Callers pin the header page through the buffer pool and unpin
//! it dirty after mutation.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PageId, PAGE_SIZE};

pub const HEADER_MAGIC: &[u8; 8] = b"arboridx";

/// Maximum length of an index name, in bytes.
pub const MAX_NAME_LEN: usize = 36;

const RECORD_SIZE: usize = MAX_NAME_LEN + 4;
const RECORDS_START: usize = 12;

/// Maximum number of index records one header page can hold.
pub const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_START) / RECORD_SIZE;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct IndexRecord {
    name: [u8; MAX_NAME_LEN],
    root_page_id: U32,
}

const _: () = assert!(std::mem::size_of::<IndexRecord>() == RECORD_SIZE);

impl IndexRecord {
    fn new(name: &str, root_page_id: PageId) -> Self {
        let mut bytes = [0u8; MAX_NAME_LEN];
        bytes[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            name: bytes,
            root_page_id: U32::new(root_page_id),
        }
    }

    fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        bytes.len() <= MAX_NAME_LEN
            && &self.name[..bytes.len()] == bytes
            && self.name[bytes.len()..].iter().all(|&b| b == 0)
    }
}

#[derive(Debug)]
pub struct HeaderRef<'a> {
    data: &'a [u8],
}

pub struct HeaderMut<'a> {
    data: &'a mut [u8],
}

fn record_count(data: &[u8]) -> usize {
    u32::from_le_bytes([data[8], data[9], data[10], data[11]]) as usize
}

fn record_at(data: &[u8], index: usize) -> Result<&IndexRecord> {
    let offset = RECORDS_START + index * RECORD_SIZE;
    IndexRecord::ref_from_bytes(&data[offset..offset + RECORD_SIZE])
        .map_err(|e| eyre::eyre!("failed to read index record {}: {:?}", index, e))
}

fn find(data: &[u8], name: &str) -> Result<Option<usize>> {
    for i in 0..record_count(data) {
        if record_at(data, i)?.matches(name) {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

impl<'a> HeaderRef<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        ensure!(
            &data[..8] == HEADER_MAGIC,
            "page 0 is not an index directory (bad magic)"
        );
        Ok(Self { data })
    }

    pub fn record_count(&self) -> usize {
        record_count(self.data)
    }

    /// Root page id recorded under `name`, if the index is registered.
    pub fn get_root_id(&self, name: &str) -> Result<Option<PageId>> {
        match find(self.data, name)? {
            Some(i) => Ok(Some(record_at(self.data, i)?.root_page_id.get())),
            None => Ok(None),
        }
    }
}

impl<'a> HeaderMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        ensure!(
            &data[..8] == HEADER_MAGIC,
            "page 0 is not an index directory (bad magic)"
        );
        Ok(Self { data })
    }

    /// Formats a fresh directory onto `data`.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        data[..8].copy_from_slice(HEADER_MAGIC);
        data[8..12].copy_from_slice(&0u32.to_le_bytes());
        Ok(Self { data })
    }

    /// Opens an existing directory, formatting the page first when it is
    /// still the zeroed page seeded by `PageFile::create`.
    pub fn open_or_init(data: &'a mut [u8]) -> Result<Self> {
        if data.len() == PAGE_SIZE && &data[..8] == HEADER_MAGIC {
            Self::from_page(data)
        } else {
            ensure!(
                data.iter().all(|&b| b == 0),
                "page 0 holds unrecognized data, refusing to format it"
            );
            Self::init(data)
        }
    }

    pub fn as_ref(&self) -> HeaderRef<'_> {
        HeaderRef { data: self.data }
    }

    fn set_record_count(&mut self, count: usize) {
        self.data[8..12].copy_from_slice(&(count as u32).to_le_bytes());
    }

    fn write_record(&mut self, index: usize, record: IndexRecord) {
        let offset = RECORDS_START + index * RECORD_SIZE;
        self.data[offset..offset + RECORD_SIZE].copy_from_slice(record.as_bytes());
    }

    /// Appends a new (name -> root) record.
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        ensure!(
            !name.is_empty() && name.len() <= MAX_NAME_LEN,
            "index name '{}' must be 1..={} bytes",
            name,
            MAX_NAME_LEN
        );
        if find(self.data, name)?.is_some() {
            bail!("index '{}' is already registered", name);
        }

        let count = record_count(self.data);
        ensure!(
            count < MAX_RECORDS,
            "index directory is full ({} records)",
            MAX_RECORDS
        );

        self.write_record(count, IndexRecord::new(name, root_page_id));
        self.set_record_count(count + 1);
        Ok(())
    }

    /// Updates the root recorded under an existing name.
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> Result<()> {
        match find(self.data, name)? {
            Some(i) => {
                self.write_record(i, IndexRecord::new(name, root_page_id));
                Ok(())
            }
            None => bail!("index '{}' is not registered", name),
        }
    }

    /// Removes the record under `name`, compacting the tail.
    pub fn delete_record(&mut self, name: &str) -> Result<()> {
        let Some(i) = find(self.data, name)? else {
            bail!("index '{}' is not registered", name);
        };

        let count = record_count(self.data);
        let start = RECORDS_START + (i + 1) * RECORD_SIZE;
        let end = RECORDS_START + count * RECORD_SIZE;
        self.data
            .copy_within(start..end, RECORDS_START + i * RECORD_SIZE);
        self.set_record_count(count - 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::INVALID_PAGE_ID;

    fn make_page() -> Vec<u8> {
        vec![0u8; PAGE_SIZE]
    }

    #[test]
    fn init_writes_magic_and_empty_count() {
        let mut page = make_page();
        let header = HeaderMut::init(&mut page).unwrap();

        assert_eq!(header.as_ref().record_count(), 0);
        assert_eq!(&page[..8], HEADER_MAGIC);
    }

    #[test]
    fn from_page_rejects_unformatted_pages() {
        let page = make_page();
        let err = HeaderRef::from_page(&page).unwrap_err();
        assert!(err.to_string().contains("bad magic"));
    }

    #[test]
    fn insert_then_get_root() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        header.insert_record("orders_pk", 7).unwrap();
        header.insert_record("users_pk", INVALID_PAGE_ID).unwrap();

        let read = header.as_ref();
        assert_eq!(read.record_count(), 2);
        assert_eq!(read.get_root_id("orders_pk").unwrap(), Some(7));
        assert_eq!(read.get_root_id("users_pk").unwrap(), Some(INVALID_PAGE_ID));
        assert_eq!(read.get_root_id("missing").unwrap(), None);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        header.insert_record("idx", 1).unwrap();
        let err = header.insert_record("idx", 2).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn update_changes_the_root_in_place() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        header.insert_record("idx", 1).unwrap();
        header.update_record("idx", 42).unwrap();

        assert_eq!(header.as_ref().get_root_id("idx").unwrap(), Some(42));
        assert_eq!(header.as_ref().record_count(), 1);
    }

    #[test]
    fn update_of_missing_record_fails() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        let err = header.update_record("ghost", 1).unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    fn delete_compacts_the_tail() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        header.insert_record("a", 1).unwrap();
        header.insert_record("b", 2).unwrap();
        header.insert_record("c", 3).unwrap();

        header.delete_record("b").unwrap();

        let read = header.as_ref();
        assert_eq!(read.record_count(), 2);
        assert_eq!(read.get_root_id("a").unwrap(), Some(1));
        assert_eq!(read.get_root_id("b").unwrap(), None);
        assert_eq!(read.get_root_id("c").unwrap(), Some(3));
    }

    #[test]
    fn name_prefixes_do_not_collide() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        header.insert_record("orders", 1).unwrap();
        header.insert_record("orders_pk", 2).unwrap();

        let read = header.as_ref();
        assert_eq!(read.get_root_id("orders").unwrap(), Some(1));
        assert_eq!(read.get_root_id("orders_pk").unwrap(), Some(2));
    }

    #[test]
    fn overlong_names_are_rejected() {
        let mut page = make_page();
        let mut header = HeaderMut::init(&mut page).unwrap();

        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(header.insert_record(&long, 1).is_err());
    }
}
