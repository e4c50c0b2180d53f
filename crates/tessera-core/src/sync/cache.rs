//! Auxiliary append-only caches synchronized alongside the blob range
//!
//! Each cache is a list of opaque entries with a revision counter bumped on
//! every local append batch, plus the size and revision the upstream is
//! known to hold.
//!
//! Diff encoding: `[len:u32 LE][entry bytes]` repeated once per entry.

use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Every cache a graph carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKind {
    /// Entity types in use
    EtsUsed,
    /// Relation types in use
    RtsUsed,
    /// Enum values in use
    EnsUsed,
    /// UID to blob index
    UidLookup,
    /// External UID to blob index
    EuidLookup,
    /// Tag name to blob index
    TagLookup,
}

const CACHE_TABLE: [(CacheKind, &str); 6] = [
    (CacheKind::EtsUsed, "_ETs_used"),
    (CacheKind::RtsUsed, "_RTs_used"),
    (CacheKind::EnsUsed, "_ENs_used"),
    (CacheKind::UidLookup, "_uid_lookup"),
    (CacheKind::EuidLookup, "_euid_lookup"),
    (CacheKind::TagLookup, "_tag_lookup"),
];

impl CacheKind {
    /// All kinds in wire order
    pub const ALL: [CacheKind; 6] = [
        CacheKind::EtsUsed,
        CacheKind::RtsUsed,
        CacheKind::EnsUsed,
        CacheKind::UidLookup,
        CacheKind::EuidLookup,
        CacheKind::TagLookup,
    ];

    /// Wire name
    pub fn name(&self) -> &'static str {
        CACHE_TABLE
            .iter()
            .find(|(kind, _)| kind == self)
            .map(|(_, name)| *name)
            .unwrap_or_default()
    }

    /// Look up a wire name. Unknown names are an [`Error::UnknownCache`].
    pub fn from_name(name: &str) -> Result<Self> {
        CACHE_TABLE
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
            .ok_or_else(|| Error::UnknownCache(name.to_string()))
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// One append-only cache
#[derive(Debug, Clone, Default)]
pub struct AppendOnlyCache {
    entries: Vec<Bytes>,
    revision: u64,
    upstream_size: u64,
    upstream_revision: u64,
}

impl AppendOnlyCache {
    /// Empty cache at revision 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size the upstream is known to hold
    pub fn upstream_size(&self) -> u64 {
        self.upstream_size
    }

    /// Current revision
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Revision the upstream is known to hold
    pub fn upstream_revision(&self) -> u64 {
        self.upstream_revision
    }

    /// Entry at `index`
    pub fn get(&self, index: u64) -> Option<&Bytes> {
        self.entries.get(index as usize)
    }

    /// Append a batch of entries as one revision
    pub fn append<I, B>(&mut self, entries: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let before = self.entries.len();
        self.entries.extend(entries.into_iter().map(Into::into));
        if self.entries.len() > before {
            self.revision += 1;
        }
    }

    /// Record what the upstream acknowledged
    pub fn mark_upstream(&mut self, size: u64, revision: u64) {
        self.upstream_size = size;
        self.upstream_revision = revision;
    }

    /// Encode entries `[from, to)`
    pub fn create_diff(&self, from: u64, to: u64) -> Result<Bytes> {
        if from > to || to > self.len() {
            return Err(Error::malformed(format!(
                "Cache diff {}..{} outside cache of size {}",
                from,
                to,
                self.len()
            )));
        }
        let entries = &self.entries[from as usize..to as usize];
        let mut out = BytesMut::with_capacity(entries.iter().map(|e| e.len() + 4).sum());
        for entry in entries {
            out.put_u32_le(entry.len() as u32);
            out.put_slice(entry);
        }
        Ok(out.freeze())
    }

    /// Append the entries of a received diff and move to `revision_after`
    pub fn apply_diff(&mut self, diff: &[u8], revision_after: u64) -> Result<u64> {
        let entries = decode_diff(diff)?;
        let count = entries.len() as u64;
        self.extend_received(entries, revision_after);
        Ok(count)
    }

    pub(crate) fn extend_received(&mut self, entries: Vec<Bytes>, revision_after: u64) {
        self.entries.extend(entries);
        self.revision = revision_after;
    }
}

pub(crate) fn decode_diff(mut diff: &[u8]) -> Result<Vec<Bytes>> {
    let mut entries = Vec::new();
    while !diff.is_empty() {
        let Some((len, rest)) = diff.split_first_chunk::<4>() else {
            return Err(Error::malformed("Truncated cache diff entry length"));
        };
        let len = u32::from_le_bytes(*len) as usize;
        if rest.len() < len {
            return Err(Error::malformed(format!(
                "Cache diff entry of {} bytes with only {} left",
                len,
                rest.len()
            )));
        }
        entries.push(Bytes::copy_from_slice(&rest[..len]));
        diff = &rest[len..];
    }
    Ok(entries)
}
