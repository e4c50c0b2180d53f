//! Update heads: the ranges one update covers
//!
//! `from` is what the upstream already holds, `to` is what the local graph
//! holds. Heads are computed from a [`GraphState`](super::GraphState) under
//! its lock and compared or converted without touching the graph again.

use super::cache::CacheKind;
use crate::{Error, Result};
use serde_json::Value;
use tessera_protocol::{CacheHead, HeadsJson, PayloadHeader};

/// Blob index range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRange {
    /// Boundary the upstream holds
    pub from: u64,
    /// Local boundary
    pub to: u64,
}

/// Range of one changed cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeads {
    /// Which cache
    pub kind: CacheKind,
    /// Size the upstream holds
    pub from: u64,
    /// Local size
    pub to: u64,
    /// Revision the upstream holds
    pub revision: u64,
    /// Local revision
    pub revision_after: u64,
}

/// Blob range plus every cache range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateHeads {
    /// Blob range
    pub blobs: BlobRange,
    /// Cache ranges, in [`CacheKind::ALL`] order
    pub caches: Vec<CacheHeads>,
}

impl UpdateHeads {
    /// Nothing left to send
    pub fn is_up_to_date(&self) -> bool {
        self.blobs.from >= self.blobs.to && self.caches.iter().all(|c| c.from >= c.to)
    }

    /// Caches that changed
    pub fn changed_caches(&self) -> impl Iterator<Item = &CacheHeads> {
        self.caches.iter().filter(|c| c.from != c.to)
    }

    /// Range for `kind`
    pub fn cache(&self, kind: CacheKind) -> Option<&CacheHeads> {
        self.caches.iter().find(|c| c.kind == kind)
    }

    /// `{blobs_head, cache_heads}` of the `from` side
    pub fn to_json_from(&self) -> HeadsJson {
        HeadsJson {
            blobs_head: self.blobs.from,
            cache_heads: self
                .caches
                .iter()
                .map(|c| {
                    (
                        c.kind.name().to_string(),
                        CacheHead {
                            head: c.from,
                            revision: c.revision,
                        },
                    )
                })
                .collect(),
        }
    }

    /// `{blobs_head, cache_heads}` of the `to` side
    pub fn to_json_to(&self) -> HeadsJson {
        HeadsJson {
            blobs_head: self.blobs.to,
            cache_heads: self
                .caches
                .iter()
                .map(|c| {
                    (
                        c.kind.name().to_string(),
                        CacheHead {
                            head: c.to,
                            revision: c.revision_after,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Heads reported by the upstream. Only the `to` side is known, so
    /// every `from` is 0.
    pub fn from_heads_json(heads: &HeadsJson) -> Result<Self> {
        let caches = heads
            .cache_heads
            .iter()
            .map(|(name, head)| {
                Ok(CacheHeads {
                    kind: CacheKind::from_name(name)?,
                    from: 0,
                    to: head.head,
                    revision: head.revision,
                    revision_after: head.revision,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blobs: BlobRange {
                from: 0,
                to: heads.blobs_head,
            },
            caches: sorted(caches),
        })
    }

    /// Heads implied by a received payload
    pub fn from_payload(header: &PayloadHeader) -> Result<Self> {
        if header.blob_index_lo > header.blob_index_hi {
            return Err(Error::malformed(format!(
                "Payload blob range {}..{} is reversed",
                header.blob_index_lo, header.blob_index_hi
            )));
        }
        let caches = header
            .caches
            .iter()
            .map(|c| {
                Ok(CacheHeads {
                    kind: CacheKind::from_name(&c.name)?,
                    from: c.index_lo,
                    to: c.index_hi,
                    revision: c.revision,
                    revision_after: c.revision_after.unwrap_or(c.revision),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            blobs: BlobRange {
                from: header.blob_index_lo,
                to: header.blob_index_hi,
            },
            caches: sorted(caches),
        })
    }
}

fn sorted(mut caches: Vec<CacheHeads>) -> Vec<CacheHeads> {
    caches.sort_by_key(|c| c.kind);
    caches
}

/// Heads the upstream attached to a message, typically a failure reply
pub fn parse_message_heads(message: &Value) -> Result<Option<UpdateHeads>> {
    if !HeadsJson::present_in(message) {
        return Ok(None);
    }
    let heads = HeadsJson::from_message(message)?;
    UpdateHeads::from_heads_json(&heads).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_protocol::CacheRange;

    fn sample() -> UpdateHeads {
        UpdateHeads {
            blobs: BlobRange { from: 100, to: 180 },
            caches: vec![
                CacheHeads {
                    kind: CacheKind::EtsUsed,
                    from: 3,
                    to: 3,
                    revision: 1,
                    revision_after: 1,
                },
                CacheHeads {
                    kind: CacheKind::RtsUsed,
                    from: 4,
                    to: 6,
                    revision: 1,
                    revision_after: 2,
                },
            ],
        }
    }

    #[test]
    fn test_up_to_date() {
        let mut heads = sample();
        assert!(!heads.is_up_to_date());
        heads.blobs.from = 180;
        assert!(!heads.is_up_to_date());
        heads.caches[1].from = 6;
        assert!(heads.is_up_to_date());
        assert_eq!(heads.changed_caches().count(), 0);
    }

    #[test]
    fn test_json_sides() {
        let heads = sample();
        let from = heads.to_json_from();
        assert_eq!(from.blobs_head, 100);
        assert_eq!(from.cache_heads["_RTs_used"], CacheHead { head: 4, revision: 1 });
        let to = heads.to_json_to();
        assert_eq!(to.blobs_head, 180);
        assert_eq!(to.cache_heads["_RTs_used"], CacheHead { head: 6, revision: 2 });
        assert_eq!(heads.changed_caches().count(), 1);
    }

    #[test]
    fn test_parse_message_heads() {
        let message = json!({
            "success": false,
            "blobs_head": 150,
            "cache_heads": {"_uid_lookup": {"head": 9, "revision": 4}},
        });
        let heads = parse_message_heads(&message).unwrap().unwrap();
        assert_eq!(heads.blobs, BlobRange { from: 0, to: 150 });
        let uid = heads.cache(CacheKind::UidLookup).unwrap();
        assert_eq!((uid.to, uid.revision_after), (9, 4));

        assert!(parse_message_heads(&json!({"success": false})).unwrap().is_none());
        let unknown = json!({"blobs_head": 1, "cache_heads": {"_bogus": {"head": 1, "revision": 1}}});
        assert!(matches!(
            parse_message_heads(&unknown),
            Err(Error::UnknownCache(_))
        ));
    }

    #[test]
    fn test_from_payload() {
        let header = PayloadHeader {
            blob_index_lo: 100,
            blob_index_hi: 180,
            graph_uid: "g".into(),
            index_of_latest_complete_tx_node: 170,
            hash_full_graph: Some(7),
            data_layout_version: "0.3.0".into(),
            caches: vec![CacheRange {
                name: "_RTs_used".into(),
                index_lo: 4,
                index_hi: 6,
                revision: 1,
                revision_after: None,
            }],
        };
        let heads = UpdateHeads::from_payload(&header).unwrap();
        assert_eq!(heads.blobs, BlobRange { from: 100, to: 180 });
        assert_eq!(heads.caches[0].revision_after, 1);

        let reversed = PayloadHeader {
            blob_index_lo: 5,
            blob_index_hi: 4,
            ..header
        };
        assert!(UpdateHeads::from_payload(&reversed).is_err());
    }
}
