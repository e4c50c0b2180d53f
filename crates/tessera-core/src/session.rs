//! Client session
//!
//! A [`Session`] owns everything one upstream connection needs: the task
//! registry, the connection manager, the chunked transfer engine and one
//! sync worker per tracked graph. Dropping the session stops the workers
//! and the connection.

use crate::chunked::ChunkedTransferEngine;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, CredentialStore, HttpTokenExchange};
use crate::sync::{GraphState, SyncOutcome, SyncReconciler, SyncRequest, SyncWorker};
use crate::tasks::TaskRegistry;
use crate::transport::{TcpTransport, Transport};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One client's connection plus its tracked graphs
pub struct Session {
    config: ClientConfig,
    tasks: Arc<TaskRegistry>,
    conn: Arc<ConnectionManager>,
    engine: Arc<ChunkedTransferEngine>,
    reconciler: Arc<SyncReconciler>,
    workers: Mutex<HashMap<String, SyncWorker>>,
}

impl Session {
    /// Session over TCP with credentials from the config directory
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(TcpTransport::new(config.generic_timeout));
        let exchange = Arc::new(HttpTokenExchange::new(config.login.token_endpoint.clone()));
        let credentials = Arc::new(CredentialStore::new(&config, exchange));
        Self::with_transport(config, transport, credentials)
    }

    /// Session over a caller-supplied transport and credential store
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialStore>,
    ) -> Result<Self> {
        config.validate()?;
        let tasks = Arc::new(TaskRegistry::new(config.wait_grace_period));
        let conn = ConnectionManager::new(config.clone(), transport, Arc::clone(&tasks), credentials);
        let engine = Arc::new(ChunkedTransferEngine::new(
            Arc::clone(&conn),
            config.chunking.clone(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            Arc::clone(&conn),
            Arc::clone(&engine),
            config.sync.clone(),
        ));

        if conn.want_connection() {
            conn.start_connection()?;
        }

        Ok(Self {
            config,
            tasks,
            conn,
            engine,
            reconciler,
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Outstanding requests
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Upstream connection
    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    /// Chunked transfer engine
    pub fn engine(&self) -> &Arc<ChunkedTransferEngine> {
        &self.engine
    }

    /// Update sender shared by every worker
    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    /// Open a graph with the configured storage settings. It is not synced
    /// until tracked.
    pub fn open_graph(&self, uid: &str) -> Result<Arc<Mutex<GraphState>>> {
        Ok(Arc::new(Mutex::new(GraphState::open(uid, &self.config.storage)?)))
    }

    /// Start a sync worker for `graph`
    pub fn track_graph(&self, graph: Arc<Mutex<GraphState>>) -> Result<()> {
        let uid = graph.lock().uid().to_string();
        let mut workers = self.workers.lock();
        if workers.contains_key(&uid) {
            return Err(Error::config(format!("Graph {} is already tracked", uid)));
        }
        let worker = SyncWorker::spawn(
            graph,
            Arc::clone(&self.reconciler),
            &self.conn,
            self.config.sync.interval,
        )?;
        tracing::debug!("Tracking graph {}", uid);
        workers.insert(uid, worker);
        Ok(())
    }

    /// Stop syncing a graph. Returns whether it was tracked.
    pub fn untrack_graph(&self, uid: &str) -> Result<bool> {
        let worker = self.workers.lock().remove(uid);
        match worker {
            Some(mut worker) => {
                worker.shutdown()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Uids of tracked graphs
    pub fn tracked_graphs(&self) -> Vec<String> {
        let mut uids: Vec<_> = self.workers.lock().keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Queue a request for a tracked graph's worker
    pub fn send_request(&self, uid: &str, request: SyncRequest) -> Result<()> {
        match self.workers.lock().get(uid) {
            Some(worker) => worker.request(request),
            None => Err(Error::config(format!("Graph {} is not tracked", uid))),
        }
    }

    /// Sync a tracked graph now and wait for the outcome
    pub fn sync_graph(&self, uid: &str) -> Result<SyncOutcome> {
        let (reply, outcome) = crossbeam_channel::bounded(1);
        self.send_request(uid, SyncRequest::SendUpdate(Some(reply)))?;
        outcome
            .recv()
            .map_err(|_| Error::internal("Sync worker stopped before replying"))?
    }

    /// Stop every worker and the connection
    pub fn close(&self) {
        let workers: Vec<_> = self.workers.lock().drain().collect();
        for (uid, mut worker) in workers {
            if let Err(e) = worker.shutdown() {
                tracing::warn!("Stopping sync of graph {}: {}", uid, e);
            }
        }
        self.conn.stop_connection();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
