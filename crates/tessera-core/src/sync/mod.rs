//! Graph synchronization with the upstream
//!
//! ```text
//!  caller writes ──▶ GraphState (region + caches)
//!                        │ local_heads / build_payload   (graph lock held)
//!                        ▼
//!                  SyncReconciler::send_update ──▶ ChunkedTransferEngine
//!                        ▲                               │
//!  SyncWorker ───────────┘  requests, events, interval   ▼
//!                                                     upstream
//! ```

pub mod cache;
pub mod graph;
pub mod heads;
pub mod reconciler;
pub mod worker;

pub use cache::{AppendOnlyCache, CacheKind};
pub use graph::{
    BLOB_STEP, CacheMark, ErrorState, GraphHeads, GraphState, ROOT_BLOB_INDEX, UpdatePayload,
};
pub use heads::{BlobRange, CacheHeads, UpdateHeads, parse_message_heads};
pub use reconciler::{SyncOutcome, SyncReconciler};
pub use worker::{SyncRequest, SyncWorker};
