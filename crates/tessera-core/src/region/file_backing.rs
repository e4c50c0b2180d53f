//! File storage behind a file-backed region
//!
//! ```text
//! <prefix>_0   header (memory-mapped)
//!   0  magic            [u8; 8]  "TSRAGRPH"
//!   8  layout version   u32
//!  12  pages per file   u32
//!  16  page size        u64
//!  24  latest blob idx  u64      durable boundary
//!  32  last update      i64      unix millis
//!  40  graph uid        [u8; 16]
//!  56  page count       u32
//!  60  reserved         u32
//!  64  occupied table   one bit per page
//! <prefix>_1.. page data, PAGES_PER_FILE pages each
//! ```
//!
//! The header file carries an exclusive advisory lock for as long as the
//! backing is open.

use super::PAGE_SIZE;
use crate::{Error, Result};
use memmap2::{MmapMut, MmapOptions};
use roaring::RoaringBitmap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Header magic
pub const MAGIC: &[u8; 8] = b"TSRAGRPH";
/// Current header layout version
pub const LAYOUT_VERSION: u32 = 1;
/// Number of pages stored in each data file
pub const PAGES_PER_FILE: usize = 16;

const OFF_VERSION: usize = 8;
const OFF_PAGES_PER_FILE: usize = 12;
const OFF_PAGE_SIZE: usize = 16;
const OFF_LATEST_BLOB: usize = 24;
const OFF_LAST_UPDATE: usize = 32;
const OFF_UID: usize = 40;
const OFF_PAGE_COUNT: usize = 56;
const OFF_TABLE: usize = 64;

/// Persistent storage for one file-backed region
pub struct FileBacking {
    prefix: PathBuf,
    header_file: File,
    header: MmapMut,
    data_files: Vec<Option<File>>,
    page_count: usize,
}

impl FileBacking {
    /// Open (or initialize) the backing files at `prefix`.
    ///
    /// A header written by a different layout, page size or graph is
    /// rejected with a storage error; the caller decides whether to start
    /// over with [`FileBacking::create_fresh`].
    pub fn open(prefix: impl AsRef<Path>, graph_uid: [u8; 16], page_count: usize) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        if let Some(dir) = prefix.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let header_path = file_path(&prefix, 0);
        let header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&header_path)?;
        lock_exclusive(&header_file).map_err(|e| {
            Error::storage(format!("{} is in use: {}", header_path.display(), e))
        })?;

        let header_len = header_len(page_count);
        let fresh = header_file.metadata()?.len() == 0;
        if fresh {
            header_file.set_len(header_len as u64)?;
        } else if (header_file.metadata()?.len() as usize) < OFF_TABLE {
            return Err(Error::storage(format!(
                "{} is truncated",
                header_path.display()
            )));
        }

        let header = unsafe { MmapOptions::new().map_mut(&header_file)? };
        let mut backing = Self {
            prefix,
            header_file,
            header,
            data_files: Vec::new(),
            page_count,
        };

        if fresh {
            backing.init_header(graph_uid);
            backing.header.flush()?;
        } else {
            backing.validate_header(graph_uid)?;
        }
        Ok(backing)
    }

    /// Delete any existing backing files at `prefix` and open a new one
    pub fn create_fresh(prefix: impl AsRef<Path>, graph_uid: [u8; 16], page_count: usize) -> Result<Self> {
        remove_files(prefix.as_ref())?;
        Self::open(prefix, graph_uid, page_count)
    }

    fn init_header(&mut self, graph_uid: [u8; 16]) {
        self.header[..8].copy_from_slice(MAGIC);
        self.put_u32(OFF_VERSION, LAYOUT_VERSION);
        self.put_u32(OFF_PAGES_PER_FILE, PAGES_PER_FILE as u32);
        self.put_u64(OFF_PAGE_SIZE, PAGE_SIZE as u64);
        self.put_u64(OFF_LATEST_BLOB, 0);
        self.put_u64(OFF_LAST_UPDATE, chrono::Utc::now().timestamp_millis() as u64);
        self.header[OFF_UID..OFF_UID + 16].copy_from_slice(&graph_uid);
        self.put_u32(OFF_PAGE_COUNT, self.page_count as u32);
    }

    fn validate_header(&self, graph_uid: [u8; 16]) -> Result<()> {
        if &self.header[..8] != MAGIC {
            return Err(Error::storage(format!(
                "{} is not a graph header",
                self.prefix.display()
            )));
        }
        let version = self.get_u32(OFF_VERSION);
        if version != LAYOUT_VERSION {
            return Err(Error::storage(format!(
                "Graph files at {} have layout version {}, expected {}",
                self.prefix.display(),
                version,
                LAYOUT_VERSION
            )));
        }
        if self.get_u32(OFF_PAGES_PER_FILE) as usize != PAGES_PER_FILE
            || self.get_u64(OFF_PAGE_SIZE) as usize != PAGE_SIZE
        {
            return Err(Error::storage("Graph files use a different page geometry"));
        }
        if self.get_u32(OFF_PAGE_COUNT) as usize != self.page_count
            || self.header.len() < header_len(self.page_count)
        {
            return Err(Error::storage("Graph files were created for a different region size"));
        }
        if self.header[OFF_UID..OFF_UID + 16] != graph_uid {
            return Err(Error::storage(format!(
                "Graph files at {} belong to graph {}",
                self.prefix.display(),
                hex::encode(&self.header[OFF_UID..OFF_UID + 16])
            )));
        }
        Ok(())
    }

    /// Prefix the files were opened under
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Pages the backing can hold
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Whether a page has ever been written to storage
    pub fn is_page_in_file(&self, page: usize) -> bool {
        page < self.page_count && self.header[OFF_TABLE + page / 8] & (1 << (page % 8)) != 0
    }

    /// Pages present in storage
    pub fn occupied_pages(&self) -> RoaringBitmap {
        (0..self.page_count)
            .filter(|&p| self.is_page_in_file(p))
            .map(|p| p as u32)
            .collect()
    }

    /// File descriptor and offset holding `page`, growing storage as needed
    pub fn page_location(&mut self, page: usize) -> Result<(RawFd, u64)> {
        if page >= self.page_count {
            return Err(Error::storage(format!(
                "Page {} outside region of {} pages",
                page, self.page_count
            )));
        }
        let file_index = page / PAGES_PER_FILE;
        let slot = (page % PAGES_PER_FILE) as u64;
        let needed = (slot + 1) * PAGE_SIZE as u64;

        if self.data_files.len() <= file_index {
            self.data_files.resize_with(file_index + 1, || None);
        }
        if self.data_files[file_index].is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(file_path(&self.prefix, file_index + 1))?;
            self.data_files[file_index] = Some(file);
        }
        let file = self.data_files[file_index]
            .as_ref()
            .ok_or_else(|| Error::internal("data file slot empty after open"))?;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        let fd = file.as_raw_fd();

        self.header[OFF_TABLE + page / 8] |= 1 << (page % 8);
        Ok((fd, slot * PAGE_SIZE as u64))
    }

    /// Durable boundary recorded by the last flush
    pub fn latest_blob_index(&self) -> u64 {
        self.get_u64(OFF_LATEST_BLOB)
    }

    /// Record the durable boundary and stamp the update time
    pub fn set_latest_blob_index(&mut self, index: u64) {
        self.put_u64(OFF_LATEST_BLOB, index);
        self.put_u64(OFF_LAST_UPDATE, chrono::Utc::now().timestamp_millis() as u64);
    }

    /// Time of the last recorded boundary
    pub fn last_update(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.get_u64(OFF_LAST_UPDATE) as i64)
    }

    /// Persist the header
    pub fn flush(&self) -> Result<()> {
        self.header.flush()?;
        Ok(())
    }

    fn get_u32(&self, off: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.header[off..off + 4]);
        u32::from_le_bytes(buf)
    }

    fn get_u64(&self, off: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.header[off..off + 8]);
        u64::from_le_bytes(buf)
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.header[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.header[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

impl Drop for FileBacking {
    fn drop(&mut self) {
        if let Err(e) = self.header.flush() {
            tracing::warn!("Failed to flush graph header {}: {}", self.prefix.display(), e);
        }
        unsafe { libc::flock(self.header_file.as_raw_fd(), libc::LOCK_UN) };
    }
}

impl std::fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBacking")
            .field("prefix", &self.prefix)
            .field("page_count", &self.page_count)
            .field("latest_blob_index", &self.latest_blob_index())
            .finish()
    }
}

/// `<prefix>_<index>`
pub fn file_path(prefix: &Path, index: usize) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("_{}", index));
    PathBuf::from(name)
}

/// Whether a header exists at `prefix`
pub fn exists(prefix: &Path) -> bool {
    file_path(prefix, 0).exists()
}

/// Remove the header and every data file at `prefix`
pub fn remove_files(prefix: &Path) -> Result<()> {
    let mut index = 0;
    loop {
        let path = file_path(prefix, index);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound && index > 0 => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index += 1;
    }
    Ok(())
}

fn header_len(page_count: usize) -> usize {
    (OFF_TABLE + page_count.div_ceil(8)).next_multiple_of(4096)
}

fn lock_exclusive(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "locked by another handle",
        )),
        _ => Err(err),
    }
}
