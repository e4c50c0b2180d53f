//! Tessera Core - client engine for a replicated graph store
//!
//! This crate keeps graphs locally and streams their changes to an upstream
//! authority:
//! - Paged regions with stable addresses (in memory, anonymous or file-backed)
//! - Task registry correlating requests with responses
//! - Connection manager (handshake, reconnect, login, token mirror)
//! - Adaptive chunked transfers with inbound reassembly
//! - Update heads, payloads and the sync reconciler
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Session                     │
//! │     (tracked graphs, one SyncWorker each)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        SyncReconciler / GraphState          │
//! │   (heads, payloads, caches, error state)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │         ChunkedTransferEngine               │
//! │   (windowed chunks, adaptive chunk size)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │  ConnectionManager ── TaskRegistry          │
//! │  (auth, dispatch)      (per-request waits)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │              Transport                      │
//! └─────────────────────────────────────────────┘
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod chunked;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod region;
pub mod session;
pub mod sync;
pub mod tasks;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{Error, Result};
pub use region::{PAGE_SIZE, Region, RegionStyle};
pub use session::Session;
pub use sync::{GraphState, SyncOutcome, SyncReconciler, UpdateHeads};
pub use tasks::{Response, TaskRegistry};
pub use transport::{TcpTransport, Transport};
