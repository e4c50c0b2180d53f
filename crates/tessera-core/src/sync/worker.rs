//! Background sync worker, one thread per tracked graph
//!
//! The worker drains a request queue, follows connection events and runs
//! `send_update` every `interval`. Incoming `graph_update` messages for its
//! graph are applied in the same thread.

use super::graph::{ErrorState, GraphState, UpdatePayload};
use super::reconciler::{SyncOutcome, SyncReconciler};
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tessera_protocol::WireMessage;

const MAX_POLL: Duration = Duration::from_millis(100);

/// Work for a [`SyncWorker`]
pub enum SyncRequest {
    /// Run `send_update` now, optionally reporting the outcome
    SendUpdate(Option<Sender<Result<SyncOutcome>>>),
    /// Connection re-established: resubscribe and sync
    Reconnected,
    /// Connection lost: unsubscribe
    Disconnected,
    /// Leave the invalid state and sync again
    ClearInvalid,
    /// Exit the worker thread
    Stop,
}

/// Handle to a running sync thread
pub struct SyncWorker {
    graph: Arc<Mutex<GraphState>>,
    sender: Sender<SyncRequest>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    /// Start syncing `graph`, following `conn`'s events
    pub fn spawn(
        graph: Arc<Mutex<GraphState>>,
        reconciler: Arc<SyncReconciler>,
        conn: &ConnectionManager,
        interval: Duration,
    ) -> Result<Self> {
        let (sender, requests) = unbounded();
        let (event_tx, events) = unbounded();
        conn.add_listener(event_tx);

        let uid = graph.lock().uid().to_string();
        let state = WorkerState {
            graph: Arc::clone(&graph),
            reconciler,
            uid: uid.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("tessera-sync-{}", uid))
            .spawn(move || state.run(requests, events, interval))?;

        Ok(Self {
            graph,
            sender,
            handle: Some(handle),
        })
    }

    /// The synchronized graph
    pub fn graph(&self) -> &Arc<Mutex<GraphState>> {
        &self.graph
    }

    /// Queue a request
    pub fn request(&self, request: SyncRequest) -> Result<()> {
        self.sender
            .send(request)
            .map_err(|_| Error::internal("Sync worker has stopped"))
    }

    /// Run `send_update` on the worker and wait for its outcome
    pub fn sync_now(&self) -> Result<SyncOutcome> {
        let (reply, outcome) = bounded(1);
        self.request(SyncRequest::SendUpdate(Some(reply)))?;
        outcome
            .recv()
            .map_err(|_| Error::internal("Sync worker stopped before replying"))?
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) -> Result<()> {
        let _ = self.sender.send(SyncRequest::Stop);
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::internal("Sync worker panicked"))?;
        }
        Ok(())
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Stopping sync worker: {}", e);
        }
    }
}

struct WorkerState {
    graph: Arc<Mutex<GraphState>>,
    reconciler: Arc<SyncReconciler>,
    uid: String,
}

impl WorkerState {
    fn run(
        self,
        requests: Receiver<SyncRequest>,
        events: Receiver<ConnectionEvent>,
        interval: Duration,
    ) {
        let poll = interval.min(MAX_POLL).max(Duration::from_millis(1));
        let mut last_sync = Instant::now();

        loop {
            while let Ok(event) = events.try_recv() {
                self.on_event(event);
            }

            match requests.recv_timeout(poll) {
                Ok(SyncRequest::SendUpdate(reply)) => {
                    let outcome = self.sync();
                    last_sync = Instant::now();
                    if let Some(reply) = reply {
                        let _ = reply.send(outcome);
                    }
                }
                Ok(SyncRequest::Reconnected) => {
                    self.on_event(ConnectionEvent::Reconnected);
                    last_sync = Instant::now();
                }
                Ok(SyncRequest::Disconnected) => self.on_event(ConnectionEvent::Disconnected),
                Ok(SyncRequest::ClearInvalid) => {
                    self.graph.lock().clear_invalid_state();
                    self.sync_logged();
                    last_sync = Instant::now();
                }
                Ok(SyncRequest::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if last_sync.elapsed() >= interval {
                let paused = matches!(self.graph.lock().error_state(), ErrorState::Invalid(_));
                if !paused {
                    self.sync_logged();
                }
                last_sync = Instant::now();
            }
        }
        tracing::debug!("Sync worker for graph {} stopped", self.uid);
    }

    fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Reconnected => {
                self.graph.lock().set_subscribed(true);
                self.sync_logged();
            }
            ConnectionEvent::Disconnected => self.graph.lock().set_subscribed(false),
            ConnectionEvent::Unsolicited(message) => self.apply_incoming(message),
        }
    }

    fn apply_incoming(&self, message: WireMessage) {
        if message.msg_type() != Some("graph_update") {
            return;
        }
        if message.json.get("graph_uid").and_then(|v| v.as_str()) != Some(self.uid.as_str()) {
            return;
        }
        let applied = UpdatePayload::from_message(&message.json, message.segments)
            .and_then(|payload| self.graph.lock().apply_update(&payload));
        match applied {
            Ok(heads) => tracing::debug!(
                "Applied upstream update to graph {} up to blob {}",
                self.uid,
                heads.blobs.to
            ),
            Err(e) => tracing::warn!("Dropping upstream update for graph {}: {}", self.uid, e),
        }
    }

    fn sync(&self) -> Result<SyncOutcome> {
        self.reconciler.send_update(&self.graph)
    }

    fn sync_logged(&self) {
        match self.sync() {
            Ok(SyncOutcome::Invalidated(reason)) => {
                tracing::error!("Sync of graph {} paused: {}", self.uid, reason)
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Sync of graph {} skipped: {}", self.uid, e),
        }
    }
}
