//! Paged blob regions
//!
//! Every graph owns one [`Region`]: a fixed-size virtual address range
//! reserved once at open and backed page by page as the graph grows.
//! Addresses inside the region never move, so blob positions can be stored
//! as plain byte offsets from the region base.
//!
//! ```text
//! base                                                     base + max_size
//! |  page 0  |  page 1  |  page 2  |  ...                  |  page N-1  |
//! [ loaded  ][ loaded  ][ reserved ] ...
//!      ^ occupied: physically backed (memory or file)
//!      ^ loaded:   mapped read-write in this process
//! ```
//!
//! | style            | reservation        | backing                        |
//! |------------------|--------------------|--------------------------------|
//! | `InMemory`       | committed up front | anonymous memory               |
//! | `AnonymousPaged` | inaccessible       | anonymous, zeroed per page     |
//! | `FileBacked`     | inaccessible       | `<prefix>_N` files, shared map |
//!
//! Failing to map a page leaves the region without the stable-address
//! guarantee the graph format relies on, so such failures abort the process.

#[cfg(not(unix))]
compile_error!("tessera-core regions require a unix platform");

pub mod file_backing;
mod reservation;

pub use file_backing::FileBacking;

use crate::{Error, Result};
use reservation::Reservation;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use std::io;
use std::ops::Deref;

/// Size of one region page
pub const PAGE_SIZE: usize = 4 * 1024 * 1024;

/// Reserved address range per graph unless configured otherwise
pub const DEFAULT_MAX_REGION_SIZE: usize = 2 * 1024 * 1024 * 1024;

/// How a region's pages are backed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStyle {
    /// Whole range committed at creation
    InMemory,
    /// Anonymous memory committed page by page
    AnonymousPaged,
    /// Pages mapped from backing files
    FileBacked,
}

impl std::str::FromStr for RegionStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "in_memory" | "inmemory" => Ok(Self::InMemory),
            "anonymous" | "anonymous_paged" => Ok(Self::AnonymousPaged),
            "file_backed" | "filebacked" => Ok(Self::FileBacked),
            other => Err(Error::config(format!("Unknown region style '{}'", other))),
        }
    }
}

/// Occupied/loaded byte totals of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionSizes {
    /// Bytes physically backed
    pub occupied: usize,
    /// Bytes mapped in this process
    pub loaded: usize,
}

/// One graph's reserved address range
pub struct Region {
    reservation: Reservation,
    style: RegionStyle,
    occupied: RoaringBitmap,
    loaded: RoaringBitmap,
    backing: Option<FileBacking>,
}

impl Region {
    /// Reserve a region of `max_size` bytes.
    ///
    /// `FileBacked` requires `backing`; its `occupied` set is restored from
    /// the backing header while `loaded` starts empty. Other styles must not
    /// be given a backing.
    pub fn create(style: RegionStyle, max_size: usize, backing: Option<FileBacking>) -> Result<Self> {
        if max_size == 0 || max_size % PAGE_SIZE != 0 {
            return Err(Error::storage(format!(
                "Region size {} is not a positive multiple of the page size",
                max_size
            )));
        }
        match (style, &backing) {
            (RegionStyle::FileBacked, None) => {
                return Err(Error::storage("File-backed region needs backing files"));
            }
            (RegionStyle::InMemory | RegionStyle::AnonymousPaged, Some(_)) => {
                return Err(Error::storage(format!(
                    "{:?} region cannot take backing files",
                    style
                )));
            }
            (RegionStyle::FileBacked, Some(files)) if files.page_count() != max_size / PAGE_SIZE => {
                return Err(Error::storage(format!(
                    "Backing files at {} hold {} pages but the region needs {}",
                    files.prefix().display(),
                    files.page_count(),
                    max_size / PAGE_SIZE
                )));
            }
            _ => {}
        }

        let committed = style == RegionStyle::InMemory;
        let reservation = match Reservation::reserve(max_size, committed) {
            Ok(r) => r,
            Err(e) => fatal("Unable to reserve region address range", e),
        };

        let page_count = (max_size / PAGE_SIZE) as u32;
        let (occupied, loaded) = match style {
            RegionStyle::InMemory => {
                let all: RoaringBitmap = (0..page_count).collect();
                (all.clone(), all)
            }
            RegionStyle::AnonymousPaged => (RoaringBitmap::new(), RoaringBitmap::new()),
            RegionStyle::FileBacked => (
                backing
                    .as_ref()
                    .map(FileBacking::occupied_pages)
                    .unwrap_or_default(),
                RoaringBitmap::new(),
            ),
        };

        tracing::debug!(
            "Reserved {:?} region of {} pages at {:p}",
            style,
            page_count,
            reservation.base()
        );

        Ok(Self {
            reservation,
            style,
            occupied,
            loaded,
            backing,
        })
    }

    /// Backing style
    pub fn style(&self) -> RegionStyle {
        self.style
    }

    /// Start of the reserved range
    pub fn base(&self) -> *const u8 {
        self.reservation.base()
    }

    /// Reserved size in bytes
    pub fn max_size(&self) -> usize {
        self.reservation.len()
    }

    /// Number of pages in the reserved range
    pub fn page_count(&self) -> usize {
        self.reservation.len() / PAGE_SIZE
    }

    /// Whether `page` is physically backed
    pub fn is_occupied(&self, page: usize) -> bool {
        self.occupied.contains(page as u32)
    }

    /// Whether `page` is mapped in this process
    pub fn is_loaded(&self, page: usize) -> bool {
        self.loaded.contains(page as u32)
    }

    /// Backing files, for file-backed regions
    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    fn check_page(&self, page: usize) -> Result<()> {
        if page >= self.page_count() {
            return Err(Error::storage(format!(
                "Page {} outside region of {} pages",
                page,
                self.page_count()
            )));
        }
        Ok(())
    }

    /// Make `page` readable and writable. Idempotent.
    pub fn ensure_page(&mut self, page: usize) -> Result<()> {
        self.check_page(page)?;
        if self.is_loaded(page) {
            return Ok(());
        }
        let offset = page * PAGE_SIZE;

        match self.style {
            // Always loaded
            RegionStyle::InMemory => {}
            RegionStyle::AnonymousPaged => {
                if let Err(e) = self.reservation.commit_anonymous(offset, PAGE_SIZE) {
                    fatal("Unable to commit anonymous page", e);
                }
            }
            RegionStyle::FileBacked => {
                let backing = self
                    .backing
                    .as_mut()
                    .ok_or_else(|| Error::internal("file-backed region without backing"))?;
                let (fd, file_offset) = backing.page_location(page)?;
                if let Err(e) = self.reservation.map_file(offset, PAGE_SIZE, fd, file_offset) {
                    fatal("Unable to map file-backed page", e);
                }
            }
        }

        self.occupied.insert(page as u32);
        self.loaded.insert(page as u32);
        Ok(())
    }

    /// Ensure every page overlapping `[offset, offset + len)`
    pub fn ensure_range(&mut self, offset: usize, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = self.check_range(offset, len)?;
        for page in offset / PAGE_SIZE..end.div_ceil(PAGE_SIZE) {
            self.ensure_page(page)?;
        }
        Ok(())
    }

    /// Write back and unmap a file-backed page, keeping its addresses
    /// reserved. `occupied` is kept.
    pub fn unload_page(&mut self, page: usize) -> Result<()> {
        if self.style != RegionStyle::FileBacked {
            return Err(Error::storage(format!(
                "Cannot unload pages of a {:?} region",
                self.style
            )));
        }
        self.check_page(page)?;
        if !self.is_loaded(page) {
            return Ok(());
        }
        let offset = page * PAGE_SIZE;
        self.reservation.sync(offset, PAGE_SIZE)?;
        if let Err(e) = self.reservation.decommit(offset, PAGE_SIZE) {
            fatal("Unable to release file-backed page", e);
        }
        self.loaded.remove(page as u32);
        Ok(())
    }

    /// Persist dirty pages. For file-backed regions `durable_boundary`
    /// is recorded in the header as the latest durable blob index.
    pub fn flush(&mut self, durable_boundary: Option<u64>) -> Result<()> {
        if self.style != RegionStyle::FileBacked {
            return Ok(());
        }
        for page in self.loaded.iter() {
            self.reservation
                .sync(page as usize * PAGE_SIZE, PAGE_SIZE)?;
        }
        if let Some(backing) = self.backing.as_mut() {
            if let Some(boundary) = durable_boundary {
                backing.set_latest_blob_index(boundary);
            }
            backing.flush()?;
        }
        Ok(())
    }

    /// Flush, then let the kernel drop resident copies of file-backed pages
    /// while keeping them mapped
    pub fn page_out(&mut self) -> Result<()> {
        self.flush(None)?;
        if self.style == RegionStyle::FileBacked {
            for page in self.loaded.iter() {
                self.reservation
                    .advise_dontneed(page as usize * PAGE_SIZE, PAGE_SIZE)?;
            }
        }
        Ok(())
    }

    /// Occupied and loaded byte totals
    pub fn report_sizes(&self) -> RegionSizes {
        RegionSizes {
            occupied: self.occupied.len() as usize * PAGE_SIZE,
            loaded: self.loaded.len() as usize * PAGE_SIZE,
        }
    }

    /// Flush and release the region
    pub fn destroy(mut self) -> Result<()> {
        self.flush(None)
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.max_size() => Ok(end),
            _ => Err(Error::storage(format!(
                "Range {}+{} outside region of {} bytes",
                offset,
                len,
                self.max_size()
            ))),
        }
    }

    fn check_loaded(&self, offset: usize, end: usize) -> Result<()> {
        if offset == end {
            return Ok(());
        }
        for page in offset / PAGE_SIZE..end.div_ceil(PAGE_SIZE) {
            if !self.is_loaded(page) {
                return Err(Error::storage(format!("Page {} is not loaded", page)));
            }
        }
        Ok(())
    }

    /// Borrow `[offset, offset + len)`. Every page in the range must be
    /// loaded.
    pub fn view(&self, offset: usize, len: usize) -> Result<RegionView<'_>> {
        let end = self.check_range(offset, len)?;
        self.check_loaded(offset, end)?;
        Ok(RegionView {
            offset,
            bytes: self.reservation.as_slice(offset, len),
        })
    }

    /// Copy `data` to `offset`, backing pages as needed
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.ensure_range(offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.reservation
            .as_mut_slice(offset, data.len())
            .copy_from_slice(data);
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(e) = self.flush(None) {
            tracing::warn!("Failed to flush region on close: {}", e);
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("style", &self.style)
            .field("base", &self.base())
            .field("pages", &self.page_count())
            .field("sizes", &self.report_sizes())
            .field("backing", &self.backing)
            .finish()
    }
}

/// Read-only view of a loaded byte range
///
/// Holding a view borrows the region immutably, so nothing can be written
/// or unloaded underneath it.
#[derive(Debug, Clone, Copy)]
pub struct RegionView<'a> {
    offset: usize,
    bytes: &'a [u8],
}

impl<'a> RegionView<'a> {
    /// Offset of the first byte from the region base
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The viewed bytes
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl Deref for RegionView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

fn fatal(context: &str, err: io::Error) -> ! {
    tracing::error!("{}: {}. Region addresses are no longer stable, aborting", context, err);
    std::process::abort()
}
