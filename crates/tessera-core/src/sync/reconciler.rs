//! Sending local graph updates upstream
//!
//! One `send_update` snapshots the graph under its lock, releases the lock
//! and then talks to the upstream. Network trouble is retried a few times
//! and otherwise left for the next sync round; only an upstream rejection
//! the client cannot make sense of pauses the graph.
//!
//! | attempt result                      | effect                                   |
//! |-------------------------------------|------------------------------------------|
//! | not connected                       | unsubscribe, return                      |
//! | timeout / disconnect                | back off, retry                          |
//! | failure carrying upstream heads     | adopt the upstream heads                 |
//! | any other failure                   | graph becomes invalid                    |
//! | success                             | subscribe, adopt the sent heads          |

use super::graph::{ErrorState, GraphState};
use super::heads::{UpdateHeads, parse_message_heads};
use crate::chunked::ChunkedTransferEngine;
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tessera_protocol::DataLayout;

/// How one `send_update` call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to send
    UpToDate,
    /// No authenticated connection; the graph is now unsubscribed
    NotConnected,
    /// Synced before but not resubscribed since the last disconnect
    AwaitingResubscribe,
    /// Upstream accepted the update
    Acknowledged(UpdateHeads),
    /// Upstream refused and told us what it holds
    Resynced(UpdateHeads),
    /// Upstream refused for an unknown reason; sync paused
    Invalidated(String),
    /// Every attempt timed out or lost the connection
    Exhausted,
}

/// Pushes local graph changes to the upstream
pub struct SyncReconciler {
    conn: Arc<ConnectionManager>,
    engine: Arc<ChunkedTransferEngine>,
    config: SyncConfig,
}

impl SyncReconciler {
    /// Reconciler sending through `engine`
    pub fn new(
        conn: Arc<ConnectionManager>,
        engine: Arc<ChunkedTransferEngine>,
        config: SyncConfig,
    ) -> Self {
        Self {
            conn,
            engine,
            config,
        }
    }

    /// Send whatever the upstream is missing of `graph`.
    ///
    /// Only an already invalid graph or an update that cannot be built is
    /// an error; network failures end in [`SyncOutcome::Exhausted`] and are
    /// retried by the next call.
    pub fn send_update(&self, graph: &Mutex<GraphState>) -> Result<SyncOutcome> {
        if let ErrorState::Invalid(reason) = graph.lock().error_state() {
            return Err(Error::graph_invalid(reason.clone()));
        }
        if !self.conn.is_authenticated() {
            graph.lock().set_subscribed(false);
            return Ok(SyncOutcome::NotConnected);
        }
        let layout = DataLayout::for_protocol_version(self.conn.protocol_version()?);

        let (uid, msg_type, heads, payload) = {
            let g = graph.lock();
            if g.sync_head() > 0 && !g.is_subscribed() {
                return Ok(SyncOutcome::AwaitingResubscribe);
            }
            let heads = g.local_heads();
            if heads.is_up_to_date() {
                return Ok(SyncOutcome::UpToDate);
            }
            let msg_type = if g.sync_head() == 0 {
                "full_graph"
            } else {
                "graph_update"
            };
            let payload = g.build_payload(&heads, layout)?;
            (g.uid().to_string(), msg_type, heads, payload)
        };

        tracing::debug!(
            "Sending {} for graph {}: blobs {}..{}, {} bytes",
            msg_type,
            uid,
            heads.blobs.from,
            heads.blobs.to,
            payload.byte_len()
        );
        let (message, segments) = payload.into_message(msg_type)?;

        let attempts = self.config.max_attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                thread::sleep(self.config.retry_backoff);
            }
            if !self.conn.is_authenticated() {
                graph.lock().set_subscribed(false);
                return Ok(SyncOutcome::NotConnected);
            }

            let result = self.engine.request(
                message.clone(),
                segments.clone(),
                Some(self.config.update_timeout),
            );
            match result {
                Ok(response) if response.generic.success => {
                    graph.lock().apply_sync_heads(&heads);
                    tracing::debug!("Graph {} synced up to blob {}", uid, heads.blobs.to);
                    return Ok(SyncOutcome::Acknowledged(heads));
                }
                Ok(response) => {
                    if let Some(upstream) = parse_message_heads(&response.json)? {
                        tracing::info!(
                            "Upstream refused update of graph {} ({}); resyncing from blob {}",
                            uid,
                            response.generic.reason,
                            upstream.blobs.to
                        );
                        graph.lock().apply_sync_heads(&upstream);
                        return Ok(SyncOutcome::Resynced(upstream));
                    }
                    let reason = format!("Upstream refused update: {}", response.generic.reason);
                    graph.lock().set_invalid(reason.clone());
                    return Ok(SyncOutcome::Invalidated(reason));
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        "Attempt {}/{} to sync graph {} failed: {}",
                        attempt + 1,
                        attempts,
                        uid,
                        e
                    );
                }
                Err(e) => {
                    let reason = format!("Sending update failed: {}", e);
                    graph.lock().set_invalid(reason.clone());
                    return Ok(SyncOutcome::Invalidated(reason));
                }
            }
        }

        tracing::warn!(
            "Giving up on syncing graph {} after {} attempts; the next sync will retry",
            uid,
            attempts
        );
        Ok(SyncOutcome::Exhausted)
    }
}
