//! Upstream session lifecycle
//!
//! ```text
//!               start_connection
//! Disconnected ───────────────────▶ Connecting
//!      ▲                                │ transport up
//!      │ transport closed               ▼
//!      │ (cancel online tasks,    Authenticating ── failed_auth / too old ──▶ fatal, stop
//!      │  back off, reconnect)          │ auth_success      └─ redirect ──▶ reconnect
//!      │                                ▼
//!      └──────────────────────────  Authenticated
//! ```
//!
//! One connection thread owns the transport's event channel: it performs the
//! handshake, dispatches inbound messages to tasks and listeners, and
//! reconnects with exponential backoff (1s doubling to 60s). Caller threads
//! only enqueue sends and block on their own task.

pub mod auth_server;
pub mod credentials;
pub mod tokens;

use crate::chunked::ChunkAssembler;
use crate::config::{AutoConnect, ClientConfig};
use crate::tasks::{Response, TaskHandle, TaskRegistry};
use crate::transport::{Transport, TransportEvent};
use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tessera_protocol::envelope::{self, EnvelopeHeader, MAX_PROTOCOL_VERSION};
use tessera_protocol::handshake::{self, AuthReply, TokenGroup};
use tessera_protocol::{GenericResponse, WireMessage};

pub use credentials::{Credential, CredentialStore, HttpTokenExchange, TokenExchange};
pub use tokens::TokenStore;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// How often the connection thread wakes up when idle
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Transport being opened
    Connecting,
    /// Handshake in flight
    Authenticating,
    /// Ready for requests
    Authenticated,
}

/// Notifications for connection listeners
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Authentication completed on a fresh connection
    Reconnected,
    /// An authenticated connection dropped
    Disconnected,
    /// Upstream pushed a message not tied to any request (e.g. `graph_update`)
    Unsolicited(WireMessage),
}

/// Connection counters
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Connection attempts after the first
    pub reconnects: u64,
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Messages received from the transport
    pub messages_received: u64,
}

struct ConnState {
    state: ConnectionState,
    negotiated_version: Option<i32>,
    uri: Option<String>,
    fatal: Option<String>,
    no_credentials: Option<String>,
}

enum SessionEnd {
    Closed {
        reason: Option<String>,
        authenticated: bool,
    },
    Redirect(String),
    Stopped,
}

/// Owns the upstream session
pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    tasks: Arc<TaskRegistry>,
    credentials: Arc<CredentialStore>,
    tokens: Arc<TokenStore>,
    assembler: Mutex<ChunkAssembler>,
    state: Mutex<ConnState>,
    changed: Condvar,
    listeners: Mutex<Vec<Sender<ConnectionEvent>>>,
    hint_chunk_size: Mutex<Option<f64>>,
    running: AtomicBool,
    requested: AtomicBool,
    stop: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    reconnects: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager; nothing is connected until asked
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        tasks: Arc<TaskRegistry>,
        credentials: Arc<CredentialStore>,
    ) -> Arc<Self> {
        let uri = config.upstream_uri.clone();
        let chunk_timeout = config.chunking.timeout;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            transport,
            tasks,
            credentials,
            tokens: Arc::new(TokenStore::new()),
            assembler: Mutex::new(ChunkAssembler::new(chunk_timeout)),
            state: Mutex::new(ConnState {
                state: ConnectionState::Disconnected,
                negotiated_version: None,
                uri,
                fatal: None,
                no_credentials: None,
            }),
            changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            hint_chunk_size: Mutex::new(None),
            running: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Task registry shared with request issuers
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Credential store
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Local token mirror
    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Whether requests can be sent right now
    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    /// Negotiated protocol version, once authenticated
    pub fn negotiated_version(&self) -> Option<i32> {
        self.state.lock().negotiated_version
    }

    /// Negotiated protocol version; `Disconnected` when not authenticated
    pub fn protocol_version(&self) -> Result<i32> {
        self.negotiated_version().ok_or(Error::Disconnected)
    }

    /// Counters snapshot
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            reconnects: self.reconnects.load(Ordering::SeqCst),
            messages_sent: self.messages_sent.load(Ordering::SeqCst),
            messages_received: self.messages_received.load(Ordering::SeqCst),
        }
    }

    /// Register for connection events
    pub fn add_listener(&self, listener: Sender<ConnectionEvent>) {
        self.listeners.lock().push(listener);
    }

    /// Chunk size hint attached to every outgoing message
    pub fn set_hint_chunk_size(&self, hint: Option<f64>) {
        *self.hint_chunk_size.lock() = hint;
    }

    fn has_upstream(&self) -> bool {
        !self.config.offline_mode && self.state.lock().uri.is_some()
    }

    /// Whether an upstream connection should exist
    pub fn want_connection(&self) -> bool {
        if !self.has_upstream() {
            return false;
        }
        if self.is_authenticated() || self.requested.load(Ordering::SeqCst) {
            return true;
        }
        match self.config.login.auto_connect {
            AutoConnect::Always => true,
            AutoConnect::Auto => self.credentials.have_credentials(),
            AutoConnect::Off => false,
        }
    }

    /// Resolve credentials (interactively if needed) in the calling thread,
    /// then start the connection thread. No-op when already running.
    pub fn start_connection(&self) -> Result<()> {
        if self.config.offline_mode {
            return Err(Error::config("Can't connect in offline mode"));
        }
        if self.state.lock().uri.is_none() {
            return Err(Error::config("No upstream URI configured"));
        }
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.credentials.ensure(true)?;
        self.requested.store(true, Ordering::SeqCst);

        let mut thread_slot = self.thread.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Reap a thread that exited on its own
        if let Some(old) = thread_slot.take() {
            let _ = old.join();
        }
        {
            let mut st = self.state.lock();
            st.fatal = None;
            st.no_credentials = None;
        }
        self.stop.store(false, Ordering::SeqCst);

        let me = self
            .me
            .upgrade()
            .ok_or_else(|| Error::internal("Connection manager is being dropped"))?;
        let handle = thread::Builder::new()
            .name("tessera-connection".into())
            .spawn(move || me.run())
            .inspect_err(|_| self.running.store(false, Ordering::SeqCst))?;
        *thread_slot = Some(handle);
        Ok(())
    }

    /// Close the connection and stop reconnecting
    pub fn stop_connection(&self) {
        self.requested.store(false, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
        {
            let _st = self.state.lock();
            self.changed.notify_all();
        }
        self.transport.close();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.on_disconnected();
    }

    /// Block until authenticated. `None` or a zero timeout waits indefinitely
    /// (warning once after the grace period); otherwise returns `false` on
    /// timeout.
    pub fn wait_for_auth(&self, timeout: Option<Duration>) -> Result<bool> {
        if !self.has_upstream() {
            return Err(Error::config("No upstream connection is configured"));
        }
        if !self.want_connection() {
            return Err(Error::no_credentials(
                "Not connecting to the upstream: no credentials are available and auto-connect does not allow prompting",
            ));
        }
        if !self.running.load(Ordering::SeqCst) {
            self.start_connection()?;
        }

        let timeout = timeout.filter(|limit| !limit.is_zero());
        let started = Instant::now();
        let mut warned = false;
        let mut st = self.state.lock();
        loop {
            if st.state == ConnectionState::Authenticated {
                return Ok(true);
            }
            if let Some(reason) = &st.fatal {
                return Err(Error::fatal_auth(reason.clone()));
            }
            if let Some(reason) = &st.no_credentials {
                return Err(Error::no_credentials(reason.clone()));
            }
            if !self.running.load(Ordering::SeqCst) {
                return Err(Error::Disconnected);
            }

            let elapsed = started.elapsed();
            let wait = match timeout {
                Some(limit) if elapsed >= limit => return Ok(false),
                Some(limit) => (limit - elapsed).min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            self.changed.wait_for(&mut st, wait);

            if timeout.is_none() && !warned && started.elapsed() >= self.config.wait_grace_period {
                tracing::warn!(
                    "Still waiting to authenticate with the upstream after {:?}",
                    started.elapsed()
                );
                warned = true;
            }
        }
    }

    /// Stamp the envelope (version, credential, hint) onto a message
    pub fn stamp(&self, message: &mut Value) -> Result<()> {
        let header = EnvelopeHeader {
            protocol_version: self.protocol_version()?,
            who: self.credentials.who()?,
            hint_chunk_size: *self.hint_chunk_size.lock(),
        };
        header.stamp(message)?;
        Ok(())
    }

    /// Stamp and send one message, waiting for authentication up to the
    /// generic timeout
    pub fn send(&self, mut message: Value, segments: Vec<Bytes>) -> Result<()> {
        if self.config.offline_mode {
            return Err(Error::config("Can't talk to the upstream in offline mode"));
        }
        if !self.want_connection() {
            return Err(Error::Disconnected);
        }
        if !self.wait_for_auth(Some(self.config.generic_timeout))? {
            return Err(Error::Disconnected);
        }
        self.stamp(&mut message)?;
        self.send_raw(WireMessage::with_segments(message, segments))
    }

    fn send_raw(&self, message: WireMessage) -> Result<()> {
        if self.config.logging.debug {
            tracing::debug!(
                target: "tessera::wire",
                "-> {} segment sizes {:?}",
                message.json,
                message.segments.iter().map(Bytes::len).collect::<Vec<_>>()
            );
        }
        let encoded = message.encode()?;
        self.transport.send(encoded)?;
        self.messages_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Send a request and wait for its response (inactivity `timeout`)
    pub fn request(
        &self,
        message: Value,
        segments: Vec<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.request_with_messages(message, segments, timeout, None)
    }

    /// Like [`request`](Self::request), delivering interim messages to
    /// `on_message`
    pub fn request_with_messages(
        &self,
        mut message: Value,
        segments: Vec<Bytes>,
        timeout: Option<Duration>,
        on_message: Option<&mut dyn FnMut(Response)>,
    ) -> Result<Response> {
        let task = self.tasks.add_task(true, timeout);
        set_task_uid(&mut message, task.id())?;
        if let Err(e) = self.send(message, segments) {
            self.tasks.forget(task.id());
            return Err(e);
        }
        let result = self.tasks.await_result(&task, timeout, on_message);
        self.tasks.forget(task.id());
        result
    }

    /// Interactive login, then connect.
    ///
    /// Refused when a forced key or stored credentials already exist.
    pub fn user_login(&self) -> Result<()> {
        self.credentials.set_session_key(None);
        if self.credentials.forced_key().is_some() {
            return Err(Error::config("Can't login when an explicit key is given"));
        }
        if self.credentials.have_credentials() {
            return Err(Error::config("Can't login when credentials already present"));
        }
        self.credentials.ensure(true)?;
        if self.has_upstream() {
            self.start_connection()?;
        }
        Ok(())
    }

    /// Forget stored credentials and disconnect
    pub fn user_logout(&self) -> Result<()> {
        self.credentials.logout()?;
        self.stop_connection();
        Ok(())
    }

    /// Identity plus connection state, without secrets
    pub fn who_am_i(&self) -> String {
        let identity = self.credentials.describe();
        if identity.is_empty() {
            return String::new();
        }
        let st = self.state.lock();
        let suffix = if st.state == ConnectionState::Authenticated {
            " (CONNECTED)"
        } else if st.fatal.is_some() || st.no_credentials.is_some() {
            " (CONNECTION ERROR)"
        } else {
            " (DISCONNECTED)"
        };
        format!("{}{}", identity, suffix)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut st = self.state.lock();
        st.state = state;
        self.changed.notify_all();
    }

    fn broadcast(&self, event: ConnectionEvent) {
        self.listeners
            .lock()
            .retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn on_disconnected(&self) {
        let was_authenticated = {
            let mut st = self.state.lock();
            let was = st.state == ConnectionState::Authenticated;
            st.state = ConnectionState::Disconnected;
            st.negotiated_version = None;
            self.changed.notify_all();
            was
        };
        self.assembler.lock().clear();
        self.tasks.cancel_online_tasks();
        if was_authenticated {
            tracing::info!("Disconnected from upstream");
            self.broadcast(ConnectionEvent::Disconnected);
        }
    }

    /// Connection thread body
    fn run(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u64;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let Some(uri) = self.state.lock().uri.clone() else {
                break;
            };
            if attempts > 0 {
                self.reconnects.fetch_add(1, Ordering::SeqCst);
            }
            attempts += 1;

            match self.run_session(&uri) {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Redirect(target)) => {
                    tracing::info!("Upstream redirected us to {}", target);
                    self.transport.close();
                    self.on_disconnected();
                    self.state.lock().uri = Some(target);
                    backoff = INITIAL_BACKOFF;
                    continue;
                }
                Ok(SessionEnd::Closed {
                    reason,
                    authenticated,
                }) => {
                    match reason {
                        Some(reason) => tracing::warn!("Upstream connection lost: {}", reason),
                        None => tracing::info!("Upstream closed the connection"),
                    }
                    if authenticated {
                        backoff = INITIAL_BACKOFF;
                    }
                }
                Err(Error::FatalAuth(reason)) => {
                    tracing::error!("Problem in authentication: {}", reason);
                    self.transport.close();
                    self.on_disconnected();
                    self.state.lock().fatal = Some(reason);
                    break;
                }
                Err(Error::NoCredentials(reason)) => {
                    tracing::warn!("Not connecting: {}", reason);
                    self.transport.close();
                    self.on_disconnected();
                    self.state.lock().no_credentials = Some(reason);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Connection to {} failed: {}. Reconnecting in {:?}",
                        uri,
                        e,
                        backoff
                    );
                }
            }

            self.transport.close();
            self.on_disconnected();

            let mut st = self.state.lock();
            if !self.stop.load(Ordering::SeqCst) {
                self.changed.wait_for(&mut st, backoff);
            }
            drop(st);
            backoff = std::cmp::min(backoff * 2, MAX_BACKOFF);
        }

        self.running.store(false, Ordering::SeqCst);
        let _st = self.state.lock();
        self.changed.notify_all();
    }

    fn run_session(&self, uri: &str) -> Result<SessionEnd> {
        let (events_tx, events) = unbounded();
        self.set_state(ConnectionState::Connecting);
        self.transport.connect(uri, events_tx)?;
        if self.stop.load(Ordering::SeqCst) {
            return Ok(SessionEnd::Stopped);
        }

        self.set_state(ConnectionState::Authenticating);
        let who = self.credentials.who()?;
        self.send_raw(WireMessage::new(handshake::auth_request(&who)))?;

        let deadline = Instant::now() + self.config.generic_timeout;
        let reply = loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(SessionEnd::Stopped);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match events.recv_timeout(remaining.min(POLL_INTERVAL)) {
                Ok(TransportEvent::Message(bytes)) => {
                    self.messages_received.fetch_add(1, Ordering::SeqCst);
                    break WireMessage::decode(&bytes)?;
                }
                Ok(TransportEvent::Closed(reason)) => {
                    return Ok(SessionEnd::Closed {
                        reason,
                        authenticated: false,
                    });
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(SessionEnd::Closed {
                        reason: None,
                        authenticated: false,
                    });
                }
            }
        };

        match AuthReply::from_message(&reply.json)? {
            AuthReply::Success { negotiated_version } => {
                {
                    let mut st = self.state.lock();
                    st.state = ConnectionState::Authenticated;
                    st.negotiated_version = Some(negotiated_version);
                    st.fatal = None;
                    self.changed.notify_all();
                }
                tracing::info!(
                    "Authenticated with upstream, protocol version {}",
                    negotiated_version
                );
                if self.credentials.is_guest() {
                    tracing::info!("Connected as a guest; some features are unavailable");
                }
                if let Some(me) = self.me.upgrade() {
                    thread::Builder::new()
                        .name("tessera-post-auth".into())
                        .spawn(move || me.after_auth())?;
                }
            }
            AuthReply::TooOld { upstream_version } => {
                return Err(Error::fatal_auth(format!(
                    "Upstream protocol version {} is older than the minimum {}",
                    upstream_version,
                    envelope::MIN_PROTOCOL_VERSION
                )));
            }
            AuthReply::Failed => {
                return Err(Error::fatal_auth("Upstream rejected our credentials"));
            }
            AuthReply::Redirect { target } => return Ok(SessionEnd::Redirect(target)),
        }

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(SessionEnd::Stopped);
            }
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(TransportEvent::Message(bytes)) => {
                    self.messages_received.fetch_add(1, Ordering::SeqCst);
                    self.handle_inbound(&bytes);
                }
                Ok(TransportEvent::Closed(reason)) => {
                    return Ok(SessionEnd::Closed {
                        reason,
                        authenticated: true,
                    });
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.assembler.lock().check_overdue();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(SessionEnd::Closed {
                        reason: None,
                        authenticated: true,
                    });
                }
            }
        }
    }

    /// Registration and token cache validation after each authentication
    fn after_auth(self: Arc<Self>) {
        let queries = match self.register_session() {
            Ok(queries) => queries,
            Err(e) => {
                tracing::warn!("Post-authentication registration failed: {}", e);
                Vec::new()
            }
        };
        self.broadcast(ConnectionEvent::Reconnected);

        let timeout = Some(self.config.generic_timeout);
        let mut problem = false;
        for task in queries {
            match self.tasks.await_result(&task, timeout, None) {
                Ok(response) if response.generic.success => {}
                Ok(response) => {
                    tracing::debug!("Token query failed: {}", response.generic.reason);
                    problem = true;
                }
                Err(e) => {
                    tracing::debug!("Token query failed: {}", e);
                    problem = true;
                }
            }
            self.tasks.forget(task.id());
        }
        if problem {
            tracing::warn!("Problem verifying cached tokens; the local token cache may be stale");
        }
    }

    fn register_session(&self) -> Result<Vec<TaskHandle>> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        self.send(handshake::register_metadata(&host, MAX_PROTOCOL_VERSION), Vec::new())?;
        self.send(handshake::token_list(), Vec::new())?;

        let mut queries = Vec::with_capacity(TokenGroup::ALL.len());
        for group in TokenGroup::ALL {
            let task = self.tasks.add_task(true, Some(self.config.generic_timeout));
            let mut query = handshake::token_query(group, &self.tokens.indices(group));
            set_task_uid(&mut query, task.id())?;
            if let Err(e) = self.send(query, Vec::new()) {
                self.tasks.forget(task.id());
                return Err(e);
            }
            queries.push(task);
        }
        Ok(queries)
    }

    fn handle_inbound(&self, bytes: &[u8]) {
        let message = match WireMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping undecodable upstream message: {}", e);
                return;
            }
        };
        if self.config.logging.debug {
            tracing::debug!(target: "tessera::wire", "<- {}", message.json);
        }
        let Some(version) = self.negotiated_version() else {
            return;
        };
        if let Err(e) = envelope::validate_incoming(&message.json, version) {
            tracing::warn!("Dropping upstream message: {}", e);
            return;
        }
        self.dispatch(message);
    }

    fn dispatch(&self, message: WireMessage) {
        let msg_type = message.msg_type().unwrap_or_default().to_string();
        match msg_type.as_str() {
            "terminate" => {
                let reason = message.json.get("reason").and_then(Value::as_str);
                tracing::warn!(
                    "Upstream terminated the session: {}",
                    reason.unwrap_or("no reason given")
                );
                return;
            }
            tessera_protocol::chunk::MSG_TYPE_CHUNKED => {
                self.handle_chunk(message);
                return;
            }
            _ => {}
        }

        let Some(task_uid) = message.task_uid().map(str::to_string) else {
            self.handle_untasked(&msg_type, message);
            return;
        };

        if msg_type == "poke" {
            match self.tasks.find_task(&task_uid, false) {
                Some(task) if message.json.get("message").is_some_and(|m| !m.is_null()) => {
                    let interim = WireMessage::new(message.json["message"].clone());
                    match Response::from_message(interim) {
                        Ok(response) => task.post(response),
                        Err(_) => task.touch(),
                    }
                }
                Some(task) => task.touch(),
                None => tracing::debug!("Poke for unknown task {}", task_uid),
            }
            return;
        }

        let Some(task) = self.tasks.find_task(&task_uid, true) else {
            tracing::warn!("Task uid {} isn't in the waiting list ({})", task_uid, msg_type);
            return;
        };
        tracing::debug!("Task {} answered after {:?}", task_uid, task.age());

        if msg_type == "token_response" {
            if let Err(e) = self.apply_token_response(&message.json) {
                task.resolve(Err(e));
                return;
            }
        }
        task.resolve(Response::from_message(message));
    }

    fn handle_untasked(&self, msg_type: &str, message: WireMessage) {
        match msg_type {
            "graph_update" => self.broadcast(ConnectionEvent::Unsolicited(message)),
            "token_response" => {
                let reason = message.json.get("reason").and_then(Value::as_str);
                if reason != Some("list") {
                    tracing::warn!("Unexpected untasked token response: {:?}", reason);
                    return;
                }
                match self.tokens.apply_list(&message.json) {
                    Ok(count) => tracing::debug!("Token list holds {} tokens", count),
                    Err(e) => tracing::error!(
                        "Token list disagrees with the local token cache: {}",
                        e
                    ),
                }
            }
            other => tracing::warn!("Unknown message without a task: {}", other),
        }
    }

    fn apply_token_response(&self, json: &Value) -> Result<()> {
        let generic = GenericResponse::from_json(json)?;
        if !generic.success {
            return Ok(());
        }
        match generic.reason.as_str() {
            "added" | "found" => {
                self.tokens.apply_pairs(json)?;
            }
            other => tracing::warn!("Unexpected reason '{}' in token response", other),
        }
        Ok(())
    }

    fn handle_chunk(&self, message: WireMessage) {
        let outcome = self.assembler.lock().handle(message);
        if let Some(ack) = outcome.ack {
            let mut ack = ack;
            let sent = self
                .stamp(&mut ack)
                .and_then(|_| self.send_raw(WireMessage::new(ack)));
            if let Err(e) = sent {
                tracing::warn!("Could not acknowledge chunk: {}", e);
            }
        }
        if let Some(inner) = outcome.completed {
            self.dispatch(inner);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.transport.close();
    }
}

pub(crate) fn set_task_uid(message: &mut Value, task_uid: &str) -> Result<()> {
    let obj = message
        .as_object_mut()
        .ok_or_else(|| Error::internal("Request is not a JSON object"))?;
    obj.insert("task_uid".into(), Value::String(task_uid.to_string()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::credentials::BearerToken;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct NullTransport {
        connects: AtomicUsize,
    }

    impl Transport for NullTransport {
        fn connect(&self, _uri: &str, _events: Sender<TransportEvent>) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )))
        }
        fn send(&self, _message: Bytes) -> Result<()> {
            Err(Error::Disconnected)
        }
        fn close(&self) {}
        fn is_connected(&self) -> bool {
            false
        }
    }

    struct PassThrough;

    impl TokenExchange for PassThrough {
        fn exchange(&self, refresh_token: &str) -> Result<BearerToken> {
            Ok(BearerToken {
                token: refresh_token.to_string(),
                expires_in: Duration::from_secs(3600),
            })
        }
    }

    fn manager(config: ClientConfig, key: Option<&str>) -> Arc<ConnectionManager> {
        let key = key.map(str::to_string);
        let credentials = Arc::new(
            CredentialStore::new(&config, Arc::new(PassThrough)).with_env_key(move || key.clone()),
        );
        ConnectionManager::new(
            config,
            Arc::new(NullTransport {
                connects: AtomicUsize::new(0),
            }),
            Arc::new(TaskRegistry::default()),
            credentials,
        )
    }

    fn config(dir: &TempDir) -> ClientConfig {
        ClientConfig::default()
            .with_config_dir(dir.path())
            .with_upstream("tcp://127.0.0.1:1")
    }

    #[test]
    fn test_want_connection_policies() {
        let dir = TempDir::new().unwrap();
        let offline = manager(config(&dir).with_offline_mode(true), Some("key"));
        assert!(!offline.want_connection());

        let no_uri = manager(ClientConfig::default().with_config_dir(dir.path()), Some("key"));
        assert!(!no_uri.want_connection());

        let auto_without = manager(config(&dir), None);
        assert!(!auto_without.want_connection());

        let auto_with = manager(config(&dir), Some("key"));
        assert!(auto_with.want_connection());

        let always = manager(config(&dir).with_auto_connect(AutoConnect::Always), None);
        assert!(always.want_connection());

        let off = manager(config(&dir).with_auto_connect(AutoConnect::Off), Some("key"));
        assert!(!off.want_connection());
    }

    #[test]
    fn test_wait_for_auth_errors() {
        let dir = TempDir::new().unwrap();
        let offline = manager(config(&dir).with_offline_mode(true), Some("key"));
        assert!(matches!(
            offline.wait_for_auth(Some(Duration::from_millis(10))),
            Err(Error::Config(_))
        ));

        let nobody = manager(config(&dir), None);
        assert!(matches!(
            nobody.wait_for_auth(Some(Duration::from_millis(10))),
            Err(Error::NoCredentials(_))
        ));
    }

    #[test]
    fn test_wait_for_auth_times_out_while_unreachable() {
        let dir = TempDir::new().unwrap();
        let conn = manager(config(&dir), Some("key"));
        assert!(!conn.wait_for_auth(Some(Duration::from_millis(100))).unwrap());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.stop_connection();
        assert!(!conn.running.load(Ordering::SeqCst));
    }

    #[test]
    fn test_login_refused_with_forced_key() {
        let dir = TempDir::new().unwrap();
        let conn = manager(config(&dir), Some("key"));
        assert!(matches!(conn.user_login(), Err(Error::Config(_))));
        assert!(matches!(conn.user_logout(), Err(Error::Config(_))));
    }

    #[test]
    fn test_who_am_i() {
        let dir = TempDir::new().unwrap();
        let conn = manager(config(&dir), Some("abcdefgh"));
        let who = conn.who_am_i();
        assert!(who.starts_with("API key beginning with abcd"));
        assert!(who.ends_with("(DISCONNECTED)"));
        assert!(!who.contains("efgh"));

        let nobody = manager(config(&dir), None);
        assert_eq!(nobody.who_am_i(), "");
    }

    #[test]
    fn test_send_requires_connection() {
        let dir = TempDir::new().unwrap();
        let conn = manager(config(&dir), None);
        assert!(matches!(
            conn.send(serde_json::json!({"msg_type": "x"}), Vec::new()),
            Err(Error::Disconnected)
        ));
    }
}
