//! Synchronized graph state
//!
//! A [`GraphState`] is one graph's blob region plus its caches and sync
//! bookkeeping. Blobs are addressed by index; blob `i` starts at byte
//! `i * BLOB_STEP` of the region. The graph only appends, so a byte range
//! once written below the write head never changes and can be sent without
//! copying it under a lock for longer than the payload build.
//!
//! ```text
//! region:  [ reserved | root ... sync_head ......... write_head | free ... ]
//!                       ^ ROOT_BLOB_INDEX
//!                       |<- acknowledged ->|<- next update ->|
//! ```

use super::cache::{AppendOnlyCache, CacheKind, decode_diff};
use super::heads::{BlobRange, CacheHeads, UpdateHeads};
use crate::config::StorageConfig;
use crate::region::{FileBacking, PAGE_SIZE, Region, RegionStyle};
use crate::{Error, Result};
use bytes::Bytes;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tessera_protocol::{CacheRange, DataLayout, PayloadHeader};
use xxhash_rust::xxh3::{Xxh3, xxh3_128};

/// Bytes per blob index step
pub const BLOB_STEP: u64 = 16;

/// Index of the first blob of every graph
pub const ROOT_BLOB_INDEX: u64 = 42;

/// Whether sync may run for a graph
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorState {
    /// Normal operation
    #[default]
    Ok,
    /// Sync paused until cleared
    Invalid(String),
}

/// Size and revision of one cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMark {
    /// Number of entries
    pub size: u64,
    /// Revision counter
    pub revision: u64,
}

/// Progress markers of a graph: write head plus every cache's mark.
///
/// This is what an update has to line up with before it may be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphHeads {
    /// Blob write head
    pub blobs: u64,
    /// Cache marks
    pub caches: BTreeMap<CacheKind, CacheMark>,
}

impl Default for GraphHeads {
    fn default() -> Self {
        Self {
            blobs: ROOT_BLOB_INDEX,
            caches: CacheKind::ALL
                .into_iter()
                .map(|kind| (kind, CacheMark::default()))
                .collect(),
        }
    }
}

impl GraphHeads {
    /// Markers of a graph holding only its root
    pub fn new() -> Self {
        Self::default()
    }

    /// Check that `heads` starts exactly where these markers are
    pub fn check(&self, heads: &UpdateHeads) -> Result<()> {
        if heads.blobs.from != self.blobs {
            return Err(Error::malformed(format!(
                "Update starts at blob {} but the graph is at {}",
                heads.blobs.from, self.blobs
            )));
        }
        if heads.blobs.from > heads.blobs.to {
            return Err(Error::malformed(format!(
                "Update blob range {}..{} is reversed",
                heads.blobs.from, heads.blobs.to
            )));
        }
        for cache in &heads.caches {
            let mark = self.caches.get(&cache.kind).copied().unwrap_or_default();
            if mark.size != cache.from || mark.revision != cache.revision {
                return Err(Error::malformed(format!(
                    "Update expects {} at size {} revision {} but it is at size {} revision {}",
                    cache.kind, cache.from, cache.revision, mark.size, mark.revision
                )));
            }
            if cache.from > cache.to {
                return Err(Error::malformed(format!(
                    "Update range of {} is reversed",
                    cache.kind
                )));
            }
        }
        Ok(())
    }

    /// Validate `heads` and move the markers to its `to` side
    pub fn apply_heads(&mut self, heads: &UpdateHeads) -> Result<()> {
        self.check(heads)?;
        self.blobs = heads.blobs.to;
        for cache in &heads.caches {
            self.caches.insert(
                cache.kind,
                CacheMark {
                    size: cache.to,
                    revision: cache.revision_after,
                },
            );
        }
        Ok(())
    }
}

/// Bytes of one `full_graph` / `graph_update` message
#[derive(Debug, Clone)]
pub struct UpdatePayload {
    /// JSON fields
    pub header: PayloadHeader,
    /// Blob bytes followed by one diff per changed cache
    pub segments: Vec<Bytes>,
}

impl UpdatePayload {
    /// Message carrying this payload
    pub fn into_message(self, msg_type: &str) -> Result<(Value, Vec<Bytes>)> {
        let mut message = json!({"msg_type": msg_type, "msg_version": 1});
        self.header.merge_into(&mut message)?;
        Ok((message, self.segments))
    }

    /// Payload carried by a received message
    pub fn from_message(message: &Value, segments: Vec<Bytes>) -> Result<Self> {
        let header = PayloadHeader::from_message(message)?;
        if segments.len() != header.segment_count() {
            return Err(Error::malformed(format!(
                "Update payload lists {} segments but carries {}",
                header.segment_count(),
                segments.len()
            )));
        }
        Ok(Self { header, segments })
    }

    /// Total trailer bytes
    pub fn byte_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }
}

/// One graph tracked for synchronization
pub struct GraphState {
    uid: String,
    region: Region,
    write_head: u64,
    latest_complete_tx: u64,
    sync_head: u64,
    caches: BTreeMap<CacheKind, AppendOnlyCache>,
    error_state: ErrorState,
    subscribed: bool,
}

impl GraphState {
    /// Fresh graph holding only its root
    pub fn new(uid: impl Into<String>, region: Region) -> Self {
        Self {
            uid: uid.into(),
            region,
            write_head: ROOT_BLOB_INDEX,
            latest_complete_tx: ROOT_BLOB_INDEX,
            sync_head: 0,
            caches: CacheKind::ALL
                .into_iter()
                .map(|kind| (kind, AppendOnlyCache::new()))
                .collect(),
            error_state: ErrorState::Ok,
            subscribed: false,
        }
    }

    /// Open a graph with the configured region style.
    ///
    /// File-backed graphs live at `<filegraph_dir>/<uid>` and resume from the
    /// durable boundary recorded in the backing header.
    pub fn open(uid: &str, storage: &StorageConfig) -> Result<Self> {
        let style = storage.memory_style.unwrap_or(RegionStyle::AnonymousPaged);
        let backing = match style {
            RegionStyle::FileBacked => {
                let dir = storage.filegraph_dir.as_ref().ok_or_else(|| {
                    Error::config("File-backed graphs need storage.filegraph_dir")
                })?;
                Some(FileBacking::open(
                    dir.join(uid),
                    graph_key(uid),
                    storage.max_region_size / PAGE_SIZE,
                )?)
            }
            _ => None,
        };
        let region = Region::create(style, storage.max_region_size, backing)?;
        let durable = region.backing().map_or(0, FileBacking::latest_blob_index);

        let mut state = Self::new(uid, region);
        if durable > ROOT_BLOB_INDEX {
            state.region.ensure_range(0, byte_offset(durable)?)?;
            state.write_head = durable;
            tracing::debug!("Graph {} resumed at blob {}", uid, durable);
        }
        Ok(state)
    }

    /// Graph identity
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Local write boundary
    pub fn write_head(&self) -> u64 {
        self.write_head
    }

    /// Boundary acknowledged by the upstream, 0 if never synced
    pub fn sync_head(&self) -> u64 {
        self.sync_head
    }

    /// Latest transaction known complete
    pub fn latest_complete_tx(&self) -> u64 {
        self.latest_complete_tx
    }

    /// Backing region
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Cache of `kind`
    pub fn cache(&self, kind: CacheKind) -> &AppendOnlyCache {
        // Every kind is inserted at construction
        &self.caches[&kind]
    }

    /// Whether the upstream is sending and accepting updates for this graph
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Set the subscription flag
    pub fn set_subscribed(&mut self, subscribed: bool) {
        self.subscribed = subscribed;
    }

    /// Current error state
    pub fn error_state(&self) -> &ErrorState {
        &self.error_state
    }

    /// Pause sync until [`GraphState::clear_invalid_state`]
    pub fn set_invalid(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!("Graph {} is now in an invalid state: {}", self.uid, reason);
        self.error_state = ErrorState::Invalid(reason);
    }

    /// Resume sync after an invalid state
    pub fn clear_invalid_state(&mut self) {
        if self.error_state != ErrorState::Ok {
            tracing::info!("Clearing invalid state of graph {}", self.uid);
        }
        self.error_state = ErrorState::Ok;
    }

    /// Append whole blobs at the write head as one transaction.
    /// Returns the blob range written.
    pub fn append_blobs(&mut self, data: &[u8]) -> Result<BlobRange> {
        if data.len() as u64 % BLOB_STEP != 0 {
            return Err(Error::malformed(format!(
                "Blob data of {} bytes is not a multiple of {}",
                data.len(),
                BLOB_STEP
            )));
        }
        let from = self.write_head;
        let to = from + data.len() as u64 / BLOB_STEP;
        self.region.write_at(byte_offset(from)?, data)?;
        self.write_head = to;
        if to > from {
            self.latest_complete_tx = from;
        }
        Ok(BlobRange { from, to })
    }

    /// Append entries to a cache as one revision
    pub fn append_cache<I, B>(&mut self, kind: CacheKind, entries: I)
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        self.caches.entry(kind).or_default().append(entries);
    }

    /// Blob bytes `[from, to)`
    pub fn blob_bytes(&self, from: u64, to: u64) -> Result<&[u8]> {
        if from > to || to > self.write_head {
            return Err(Error::malformed(format!(
                "Blob range {}..{} outside written range ..{}",
                from, to, self.write_head
            )));
        }
        let offset = byte_offset(from)?;
        let len = byte_offset(to)? - offset;
        Ok(self.region.view(offset, len)?.as_bytes())
    }

    /// Hash of every blob from the root up to `to`
    pub fn hash_up_to(&self, to: u64) -> Result<u64> {
        let mut hasher = Xxh3::new();
        hasher.update(self.blob_bytes(ROOT_BLOB_INDEX, to)?);
        Ok(hasher.digest())
    }

    /// Markers an incoming update must line up with
    pub fn graph_heads(&self) -> GraphHeads {
        GraphHeads {
            blobs: self.write_head,
            caches: self
                .caches
                .iter()
                .map(|(kind, cache)| {
                    (
                        *kind,
                        CacheMark {
                            size: cache.len(),
                            revision: cache.revision(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// What the upstream holds against what this graph holds
    pub fn local_heads(&self) -> UpdateHeads {
        let from = if self.sync_head == 0 {
            ROOT_BLOB_INDEX
        } else {
            self.sync_head
        };
        UpdateHeads {
            blobs: BlobRange {
                from,
                to: self.write_head,
            },
            caches: self
                .caches
                .iter()
                .map(|(kind, cache)| CacheHeads {
                    kind: *kind,
                    from: cache.upstream_size(),
                    to: cache.len(),
                    revision: cache.upstream_revision(),
                    revision_after: cache.revision(),
                })
                .collect(),
        }
    }

    /// Render the update covering `heads`
    pub fn build_payload(&self, heads: &UpdateHeads, layout: DataLayout) -> Result<UpdatePayload> {
        if heads.blobs.from > heads.blobs.to {
            return Err(Error::malformed(format!(
                "Update heads run backwards: {}..{}",
                heads.blobs.from, heads.blobs.to
            )));
        }

        let mut segments = vec![Bytes::copy_from_slice(
            self.blob_bytes(heads.blobs.from, heads.blobs.to)?,
        )];
        let mut caches = Vec::new();
        for range in heads.changed_caches() {
            segments.push(self.cache(range.kind).create_diff(range.from, range.to)?);
            caches.push(CacheRange {
                name: range.kind.name().to_string(),
                index_lo: range.from,
                index_hi: range.to,
                revision: range.revision,
                revision_after: Some(range.revision_after),
            });
        }

        Ok(UpdatePayload {
            header: PayloadHeader {
                blob_index_lo: heads.blobs.from,
                blob_index_hi: heads.blobs.to,
                graph_uid: self.uid.clone(),
                index_of_latest_complete_tx_node: self.latest_complete_tx,
                hash_full_graph: Some(self.hash_up_to(heads.blobs.to)?),
                data_layout_version: layout.as_str().to_string(),
                caches,
            },
            segments,
        })
    }

    /// Record `heads` as acknowledged by the upstream
    pub fn apply_sync_heads(&mut self, heads: &UpdateHeads) {
        self.sync_head = heads.blobs.to;
        self.subscribed = true;
        for range in &heads.caches {
            self.caches
                .entry(range.kind)
                .or_default()
                .mark_upstream(range.to, range.revision_after);
        }
    }

    /// Append a payload received from the upstream.
    ///
    /// The payload has to start exactly at this graph's markers; nothing is
    /// written unless every segment checks out.
    pub fn apply_update(&mut self, payload: &UpdatePayload) -> Result<UpdateHeads> {
        let header = &payload.header;
        if header.graph_uid != self.uid {
            return Err(Error::malformed(format!(
                "Update for graph {} applied to {}",
                header.graph_uid, self.uid
            )));
        }
        header.layout()?;
        let heads = UpdateHeads::from_payload(header)?;
        self.graph_heads().check(&heads)?;

        let [blobs, diffs @ ..] = payload.segments.as_slice() else {
            return Err(Error::malformed("Update payload without blob segment"));
        };
        let expected = byte_offset(heads.blobs.to)? - byte_offset(heads.blobs.from)?;
        if blobs.len() != expected {
            return Err(Error::malformed(format!(
                "Blob segment of {} bytes for {} expected",
                blobs.len(),
                expected
            )));
        }
        if diffs.len() != heads.caches.len() {
            return Err(Error::malformed(format!(
                "{} cache diffs for {} caches",
                diffs.len(),
                heads.caches.len()
            )));
        }

        if let Some(hash) = header.hash_full_graph {
            let mut hasher = Xxh3::new();
            hasher.update(self.blob_bytes(ROOT_BLOB_INDEX, heads.blobs.from)?);
            hasher.update(blobs);
            if hasher.digest() != hash {
                return Err(Error::malformed(format!(
                    "Hash mismatch applying update up to blob {}",
                    heads.blobs.to
                )));
            }
        }

        // Diffs follow the header's cache order, not the sorted heads order
        let mut decoded = Vec::with_capacity(diffs.len());
        for (range, diff) in header.caches.iter().zip(diffs) {
            let kind = CacheKind::from_name(&range.name)?;
            let entries = decode_diff(diff)?;
            if entries.len() as u64 != range.index_hi - range.index_lo {
                return Err(Error::malformed(format!(
                    "{} diff holds {} entries for range {}..{}",
                    kind,
                    entries.len(),
                    range.index_lo,
                    range.index_hi
                )));
            }
            decoded.push((kind, entries, range.revision_after.unwrap_or(range.revision)));
        }

        self.region.write_at(byte_offset(heads.blobs.from)?, blobs)?;
        self.write_head = heads.blobs.to;
        self.latest_complete_tx = header.index_of_latest_complete_tx_node;
        for (kind, entries, revision_after) in decoded {
            self.caches
                .entry(kind)
                .or_default()
                .extend_received(entries, revision_after);
        }
        self.apply_sync_heads(&heads);
        Ok(heads)
    }

    /// Persist the region, recording the write head as durable
    pub fn flush(&mut self) -> Result<()> {
        self.region.flush(Some(self.write_head))
    }
}

impl std::fmt::Debug for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphState")
            .field("uid", &self.uid)
            .field("write_head", &self.write_head)
            .field("sync_head", &self.sync_head)
            .field("subscribed", &self.subscribed)
            .field("error_state", &self.error_state)
            .finish()
    }
}

fn byte_offset(index: u64) -> Result<usize> {
    index
        .checked_mul(BLOB_STEP)
        .and_then(|b| usize::try_from(b).ok())
        .ok_or_else(|| Error::storage(format!("Blob index {} out of range", index)))
}

/// Backing-file identity of a graph uid
fn graph_key(uid: &str) -> [u8; 16] {
    xxh3_128(uid.as_bytes()).to_le_bytes()
}
