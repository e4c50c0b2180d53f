//! Inbound chunk reassembly
//!
//! Transfers are keyed by `chunk_uid`. Payload chunks may arrive out of
//! order; a chunk whose `bytes_start` is ahead of what has been assembled
//! for its segment waits in a pending list until the gap fills. When every
//! segment reaches its announced size the inner message is handed back as
//! if it had been received directly.

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tessera_protocol::chunk::{self, ChunkMessage};
use tessera_protocol::WireMessage;

struct PendingChunk {
    rest_index: usize,
    bytes_start: u64,
    data: Bytes,
}

struct ReceivingTransfer {
    rest_sizes: Vec<u64>,
    rest: Vec<BytesMut>,
    pending: Vec<PendingChunk>,
    msg: Value,
    last_activity: Instant,
}

impl ReceivingTransfer {
    fn is_complete(&self) -> bool {
        self.rest
            .iter()
            .zip(&self.rest_sizes)
            .all(|(buf, size)| buf.len() as u64 == *size)
    }

    /// Move every pending chunk that now lines up. `Err` on overlapping or
    /// oversized data.
    fn drain_pending(&mut self) -> Result<(), String> {
        loop {
            let mut applied = false;
            let mut i = 0;
            while i < self.pending.len() {
                let chunk = &self.pending[i];
                let current = self.rest[chunk.rest_index].len() as u64;
                if chunk.bytes_start < current {
                    return Err(format!(
                        "chunk for segment {} starts at {} but {} bytes are already assembled",
                        chunk.rest_index, chunk.bytes_start, current
                    ));
                }
                if chunk.bytes_start == current {
                    let chunk = self.pending.swap_remove(i);
                    let end = current + chunk.data.len() as u64;
                    if end > self.rest_sizes[chunk.rest_index] {
                        return Err(format!(
                            "chunk for segment {} ends at {} beyond the announced size {}",
                            chunk.rest_index, end, self.rest_sizes[chunk.rest_index]
                        ));
                    }
                    self.rest[chunk.rest_index].extend_from_slice(&chunk.data);
                    applied = true;
                } else {
                    i += 1;
                }
            }
            if !applied {
                return Ok(());
            }
        }
    }

    fn into_message(self) -> WireMessage {
        let segments = self.rest.into_iter().map(BytesMut::freeze).collect();
        WireMessage::with_segments(self.msg, segments)
    }
}

/// Result of feeding one `chunked` message to the assembler
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    /// Acknowledgement to send back, already addressed to the sender's task
    pub ack: Option<Value>,
    /// Inner message of a transfer that just completed
    pub completed: Option<WireMessage>,
}

/// Reassembles inbound chunked transfers
pub struct ChunkAssembler {
    transfers: HashMap<String, ReceivingTransfer>,
    timeout: Duration,
}

impl ChunkAssembler {
    /// Assembler that drops transfers idle for longer than `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            transfers: HashMap::new(),
            timeout,
        }
    }

    /// Number of transfers in progress
    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }

    /// Drop every transfer in progress
    pub fn clear(&mut self) {
        self.transfers.clear();
    }

    /// Feed one inbound `chunked` message
    pub fn handle(&mut self, message: WireMessage) -> ChunkOutcome {
        let task_uid = message.task_uid().map(str::to_string);
        let failure = |reason: &str| ChunkOutcome {
            ack: Some(chunk::ack(task_uid.as_deref(), false, reason)),
            completed: None,
        };

        let parsed = match ChunkMessage::from_json(&message.json) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Rejecting chunk message: {}", e);
                return failure("Don't know how to handle chunk type");
            }
        };

        match parsed {
            ChunkMessage::New {
                chunk_uid,
                rest_sizes,
                msg,
            } => {
                let allowed = msg
                    .get("msg_type")
                    .and_then(Value::as_str)
                    .is_some_and(chunk::is_chunkable);
                if !allowed {
                    return failure("msg_type not allowed for chunked transfer");
                }
                let transfer = ReceivingTransfer {
                    rest: rest_sizes.iter().map(|_| BytesMut::new()).collect(),
                    rest_sizes,
                    pending: Vec::new(),
                    msg,
                    last_activity: Instant::now(),
                };
                let ack = Some(chunk::ack(task_uid.as_deref(), true, "Started new chunk"));
                if transfer.is_complete() {
                    return ChunkOutcome {
                        ack,
                        completed: Some(transfer.into_message()),
                    };
                }
                tracing::debug!(
                    "Receiving chunked transfer {} with segment sizes {:?}",
                    chunk_uid,
                    transfer.rest_sizes
                );
                self.transfers.insert(chunk_uid, transfer);
                ChunkOutcome {
                    ack,
                    completed: None,
                }
            }
            ChunkMessage::Payload {
                chunk_uid,
                rest_index,
                bytes_start,
            } => {
                let Some(transfer) = self.transfers.get_mut(&chunk_uid) else {
                    return failure(&format!("Don't know about chunk: {}", chunk_uid));
                };
                if rest_index >= transfer.rest_sizes.len() {
                    return failure("Invalid rest_index");
                }
                let Some(data) = message.segments.into_iter().next() else {
                    return failure("Payload chunk without data");
                };
                let size = transfer.rest_sizes[rest_index];
                let end = bytes_start.saturating_add(data.len() as u64);
                if end > size {
                    tracing::error!(
                        "Abandoning chunked transfer {}: chunk for segment {} ends at {} beyond the announced size {}",
                        chunk_uid,
                        rest_index,
                        end,
                        size
                    );
                    self.transfers.remove(&chunk_uid);
                    return failure("Chunk lies outside its segment");
                }

                transfer.last_activity = Instant::now();
                transfer.pending.push(PendingChunk {
                    rest_index,
                    bytes_start,
                    data,
                });
                let ack = Some(chunk::ack(task_uid.as_deref(), true, "Accepted chunk"));

                if let Err(reason) = transfer.drain_pending() {
                    tracing::error!("Abandoning chunked transfer {}: {}", chunk_uid, reason);
                    self.transfers.remove(&chunk_uid);
                    return ChunkOutcome {
                        ack,
                        completed: None,
                    };
                }

                let completed = if transfer.is_complete() {
                    self.transfers
                        .remove(&chunk_uid)
                        .map(ReceivingTransfer::into_message)
                } else {
                    None
                };
                ChunkOutcome { ack, completed }
            }
            ChunkMessage::Cancel { chunk_uid } => {
                if self.transfers.remove(&chunk_uid).is_some() {
                    tracing::debug!("Sender cancelled chunked transfer {}", chunk_uid);
                }
                ChunkOutcome {
                    ack: Some(chunk::ack(task_uid.as_deref(), true, "Cancelled")),
                    completed: None,
                }
            }
        }
    }

    /// Drop transfers idle past the timeout; returns their ids
    pub fn check_overdue(&mut self) -> Vec<String> {
        let timeout = self.timeout;
        let overdue: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, t)| t.last_activity.elapsed() > timeout)
            .map(|(uid, _)| uid.clone())
            .collect();
        for uid in &overdue {
            tracing::warn!("Dropping chunked transfer {} after {:?} idle", uid, timeout);
            self.transfers.remove(uid);
        }
        overdue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn new_chunk(uid: &str, sizes: &[u64]) -> WireMessage {
        WireMessage::new(
            ChunkMessage::New {
                chunk_uid: uid.into(),
                rest_sizes: sizes.to_vec(),
                msg: json!({"msg_type": "graph_update", "blob_index_lo": 3}),
            }
            .to_json(Some("t-new"))
            .unwrap(),
        )
    }

    fn payload(uid: &str, rest_index: usize, start: u64, data: &[u8]) -> WireMessage {
        WireMessage::with_segments(
            ChunkMessage::Payload {
                chunk_uid: uid.into(),
                rest_index,
                bytes_start: start,
            }
            .to_json(Some("t-payload"))
            .unwrap(),
            vec![Bytes::copy_from_slice(data)],
        )
    }

    /// Split every segment into chunks of the given sizes, cycling
    fn split(segments: &[Vec<u8>], sizes: &[usize]) -> Vec<(usize, u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut k = 0;
        for (index, segment) in segments.iter().enumerate() {
            let mut start = 0;
            while start < segment.len() {
                let size = sizes[k % sizes.len()].max(1);
                k += 1;
                let end = (start + size).min(segment.len());
                out.push((index, start as u64, segment[start..end].to_vec()));
                start = end;
            }
        }
        out
    }

    #[test]
    fn test_in_order_transfer() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        let outcome = assembler.handle(new_chunk("c", &[5, 3]));
        assert_eq!(outcome.ack.unwrap()["success"], true);
        assert!(outcome.completed.is_none());

        assert!(assembler.handle(payload("c", 0, 0, b"hel")).completed.is_none());
        assert!(assembler.handle(payload("c", 0, 3, b"lo")).completed.is_none());
        let outcome = assembler.handle(payload("c", 1, 0, b"abc"));
        let done = outcome.completed.unwrap();
        assert_eq!(done.msg_type(), Some("graph_update"));
        assert_eq!(&done.segments[0][..], b"hello");
        assert_eq!(&done.segments[1][..], b"abc");
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn test_gap_is_buffered() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        assembler.handle(new_chunk("c", &[6]));
        let outcome = assembler.handle(payload("c", 0, 3, b"def"));
        assert_eq!(outcome.ack.unwrap()["success"], true);
        assert!(outcome.completed.is_none());
        let done = assembler.handle(payload("c", 0, 0, b"abc")).completed.unwrap();
        assert_eq!(&done.segments[0][..], b"abcdef");
    }

    #[test]
    fn test_unknown_transfer_and_bad_index() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        let ack = assembler.handle(payload("nope", 0, 0, b"x")).ack.unwrap();
        assert_eq!(ack["success"], false);
        assert_eq!(ack["task_uid"], "t-payload");

        assembler.handle(new_chunk("c", &[1]));
        let ack = assembler.handle(payload("c", 1, 0, b"x")).ack.unwrap();
        assert_eq!(ack["success"], false);
        assert_eq!(ack["reason"], "Invalid rest_index");
    }

    #[test]
    fn test_disallowed_inner_type() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        let msg = WireMessage::new(
            ChunkMessage::New {
                chunk_uid: "c".into(),
                rest_sizes: vec![1],
                msg: json!({"msg_type": "token"}),
            }
            .to_json(None)
            .unwrap(),
        );
        assert_eq!(assembler.handle(msg).ack.unwrap()["success"], false);
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn test_overlap_abandons_transfer() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        assembler.handle(new_chunk("c", &[4]));
        assembler.handle(payload("c", 0, 0, b"ab"));
        assembler.handle(payload("c", 0, 1, b"bc"));
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn test_chunk_past_segment_end_rejected_on_arrival() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        assembler.handle(new_chunk("c", &[4]));
        let outcome = assembler.handle(payload("c", 0, 10, b"xy"));
        assert_eq!(outcome.ack.unwrap()["success"], false);
        assert!(outcome.completed.is_none());
        assert_eq!(assembler.in_progress(), 0);

        assembler.handle(new_chunk("d", &[4]));
        let ack = assembler.handle(payload("d", 0, 3, b"xy")).ack.unwrap();
        assert_eq!(ack["success"], false);
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn test_empty_transfer_completes_immediately() {
        let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
        let outcome = assembler.handle(new_chunk("c", &[0]));
        let done = outcome.completed.unwrap();
        assert!(done.segments[0].is_empty());
    }

    #[test]
    fn test_check_overdue() {
        let mut assembler = ChunkAssembler::new(Duration::from_millis(10));
        assembler.handle(new_chunk("c", &[4]));
        assert!(assembler.check_overdue().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(assembler.check_overdue(), vec!["c".to_string()]);
        assert_eq!(assembler.in_progress(), 0);
    }

    #[test]
    fn test_reassembly_at_chunk_boundaries() {
        let chunk_size = 64;
        for total in [0, 1, chunk_size - 1, chunk_size, chunk_size + 1, 10 * chunk_size] {
            let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
            let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
            let mut done = assembler.handle(new_chunk("c", &[total as u64])).completed;
            for (index, start, bytes) in split(&[data.clone()], &[chunk_size]) {
                done = assembler.handle(payload("c", index, start, &bytes)).completed;
            }
            assert_eq!(&done.unwrap().segments[0][..], &data[..], "size {}", total);
        }
    }

    proptest! {
        #[test]
        fn prop_out_of_order_reassembly(
            segments in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..600), 1..4),
            sizes in prop::collection::vec(1usize..200, 1..8),
            seed in any::<u64>(),
        ) {
            let mut chunks = split(&segments, &sizes);
            // deterministic shuffle
            let mut state = seed | 1;
            for i in (1..chunks.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                chunks.swap(i, (state % (i as u64 + 1)) as usize);
            }

            let sizes: Vec<u64> = segments.iter().map(|s| s.len() as u64).collect();
            let mut assembler = ChunkAssembler::new(Duration::from_secs(10));
            let mut done = assembler.handle(new_chunk("p", &sizes)).completed;
            for (index, start, bytes) in chunks {
                prop_assert!(done.is_none());
                done = assembler.handle(payload("p", index, start, &bytes)).completed;
            }
            let done = done.expect("transfer should complete");
            prop_assert_eq!(done.segments.len(), segments.len());
            for (got, want) in done.segments.iter().zip(&segments) {
                prop_assert_eq!(&got[..], &want[..]);
            }
        }
    }
}
