//! # Paged Index File
//!
//! [`PageFile`] is the on-disk store underneath the buffer pool: a single
//! file holding 4 KiB pages, addressed by page number. The buffer pool owns
//! all caching; this layer only moves whole pages between its frames and
//! the file.
//!
//! ## File Format
//!
//! Pages are simply concatenated:
//!
//! ```text
//! Offset 0:     Page 0 (4 KiB)   <- header page (index directory)
//! Offset 4096:  Page 1 (4 KiB)
//! Offset 8192:  Page 2 (4 KiB)
//! ...
//! ```
//!
//! The file size is always a whole multiple of `PAGE_SIZE`; creation seeds
//! page 0 zeroed so the header page id is valid from the first open.
//!
//! ## Access Model
//!
//! The file is memory-mapped and pages are copied in and out of buffer
//! pool frames. The copy is deliberate: the mapping is remapped on
//! [`PageFile::allocate`], which would invalidate any slice handed out of
//! it, while frames stay put for as long as a page is pinned. The borrow
//! checker enforces the same rule locally (`grow` takes `&mut self`), and
//! the buffer pool serializes callers with a lock.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path, the
//! operation and the offending page number in context.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::{PageId, PAGE_SIZE};

#[derive(Debug)]
pub struct PageFile {
    file: std::fs::File,
    mmap: MmapMut,
    path: PathBuf,
    page_count: u32,
}

impl PageFile {
    /// Creates a new index file seeded with a zeroed page 0.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;

        file.set_len(PAGE_SIZE as u64)
            .wrap_err_with(|| format!("failed to size index file '{}'", path.display()))?;

        // SAFETY: MmapMut::map_mut is unsafe because externally modified
        // files invalidate the mapping. The file was just created with
        // truncate=true and is not shared with other processes; its size is
        // one full page; all access goes through read_page/write_page which
        // bounds-check the page number.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            page_count: 1,
        })
    }

    /// Opens an existing index file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        ensure!(
            file_size > 0,
            "cannot open empty index file '{}'",
            path.display()
        );
        ensure!(
            file_size % PAGE_SIZE as u64 == 0,
            "index file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            PAGE_SIZE
        );

        // SAFETY: same argument as in create(); the file is opened
        // read+write, not shared, and every access is bounds-checked
        // against page_count.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            page_count: (file_size / PAGE_SIZE as u64) as u32,
        })
    }

    /// Copies a page out of the file into `buf`.
    pub fn read_page(&self, page_no: PageId, buf: &mut [u8]) -> Result<()> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        ensure!(
            buf.len() == PAGE_SIZE,
            "read buffer is {} bytes, expected {}",
            buf.len(),
            PAGE_SIZE
        );

        let offset = page_no as usize * PAGE_SIZE;
        buf.copy_from_slice(&self.mmap[offset..offset + PAGE_SIZE]);
        Ok(())
    }

    /// Copies `buf` into the file at `page_no`.
    pub fn write_page(&mut self, page_no: PageId, buf: &[u8]) -> Result<()> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );
        ensure!(
            buf.len() == PAGE_SIZE,
            "write buffer is {} bytes, expected {}",
            buf.len(),
            PAGE_SIZE
        );

        let offset = page_no as usize * PAGE_SIZE;
        self.mmap[offset..offset + PAGE_SIZE].copy_from_slice(buf);
        Ok(())
    }

    /// Extends the file by one page and returns the new page's number.
    pub fn allocate(&mut self) -> Result<PageId> {
        let page_no = self.page_count;
        let new_count = page_no
            .checked_add(1)
            .ok_or_else(|| eyre::eyre!("page id space exhausted in '{}'", self.path.display()))?;

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        let new_size = new_count as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: the old mapping becomes invalid at remap. No references
        // into it can exist: allocate() takes &mut self, and read/write
        // hand out no borrows that outlive their call.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap index file after grow")?
        };

        self.page_count = new_count;
        Ok(page_no)
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Flushes all written pages to durable storage.
    pub fn sync(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync index file")
    }
}
