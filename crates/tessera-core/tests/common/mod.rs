//! Scripted in-memory upstream for integration tests
#![allow(dead_code)]

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tessera_core::chunked::ChunkAssembler;
use tessera_core::config::{AutoConnect, ChunkingConfig, ClientConfig, SyncConfig};
use tessera_core::connection::{ConnectionManager, CredentialStore, HttpTokenExchange};
use tessera_core::region::{PAGE_SIZE, Region, RegionStyle};
use tessera_core::sync::{GraphHeads, GraphState, UpdateHeads, UpdatePayload};
use tessera_core::transport::{Transport, TransportEvent};
use tessera_core::{Error, Result};
use tessera_protocol::{CacheHead, HeadsJson, PROTOCOL_TYPE, WireMessage};

/// How the upstream answers `full_graph` / `graph_update`
#[derive(Debug, Clone)]
pub enum UpdateBehavior {
    /// Validate against the upstream's markers and accept or refuse with heads
    Accept,
    /// Never answer
    Ignore,
    /// Refuse without heads
    Reject(String),
    /// Refuse, attaching these heads
    RejectWithHeads(HeadsJson),
}

struct MockState {
    events: Option<Sender<TransportEvent>>,
    behavior: UpdateBehavior,
    graphs: HashMap<String, GraphHeads>,
    assembler: ChunkAssembler,
    received: Vec<Value>,
    updates: Vec<(String, UpdatePayload)>,
    update_attempts: usize,
    chunk_messages: usize,
}

/// Upstream living inside the test process
pub struct MockUpstream {
    version: i32,
    state: Mutex<MockState>,
}

impl MockUpstream {
    pub fn new(version: i32) -> Arc<Self> {
        Arc::new(Self {
            version,
            state: Mutex::new(MockState {
                events: None,
                behavior: UpdateBehavior::Accept,
                graphs: HashMap::new(),
                assembler: ChunkAssembler::new(Duration::from_secs(30)),
                received: Vec::new(),
                updates: Vec::new(),
                update_attempts: 0,
                chunk_messages: 0,
            }),
        })
    }

    pub fn set_behavior(&self, behavior: UpdateBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Seed the markers the upstream holds for a graph
    pub fn set_graph_heads(&self, uid: &str, heads: GraphHeads) {
        self.state.lock().graphs.insert(uid.to_string(), heads);
    }

    /// Markers the upstream holds for a graph
    pub fn graph_heads(&self, uid: &str) -> Option<GraphHeads> {
        self.state.lock().graphs.get(uid).cloned()
    }

    pub fn update_attempts(&self) -> usize {
        self.state.lock().update_attempts
    }

    pub fn chunk_messages(&self) -> usize {
        self.state.lock().chunk_messages
    }

    /// Payloads received, with the message type they came in
    pub fn updates(&self) -> Vec<(String, UpdatePayload)> {
        self.state.lock().updates.clone()
    }

    /// Every message received, in order
    pub fn received_types(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|m| m.get("msg_type").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    /// Upstream closes the connection
    pub fn drop_connection(&self) {
        if let Some(events) = self.state.lock().events.take() {
            let _ = events.send(TransportEvent::Closed(Some("upstream went away".into())));
        }
    }

    /// Push a message as the upstream would, with the envelope filled in
    pub fn push(&self, json: Value, segments: Vec<Bytes>) {
        let state = self.state.lock();
        self.reply(&state, json, segments);
    }

    fn reply(&self, state: &MockState, mut json: Value, segments: Vec<Bytes>) {
        json["protocol_type"] = json!(PROTOCOL_TYPE);
        json["protocol_version"] = json!(self.version);
        let Some(events) = &state.events else {
            return;
        };
        let encoded = WireMessage::with_segments(json, segments).encode().unwrap();
        let _ = events.send(TransportEvent::Message(encoded));
    }

    fn handle(&self, state: &mut MockState, message: WireMessage) {
        if message.json.get("desired_protocol_version").is_some() {
            let reply = json!({"msg_type": "auth_success", "desired_protocol_version": self.version});
            let encoded = WireMessage::new(reply).encode().unwrap();
            if let Some(events) = &state.events {
                let _ = events.send(TransportEvent::Message(encoded));
            }
            return;
        }

        let task_uid = message.task_uid().map(str::to_string);
        match message.msg_type().unwrap_or_default() {
            "token" => match message.json["action"].as_str() {
                Some("list") => self.reply(
                    state,
                    json!({"msg_type": "token_response", "reason": "list", "groups": {}}),
                    Vec::new(),
                ),
                _ => self.reply(
                    state,
                    json!({
                        "msg_type": "token_response",
                        "task_uid": task_uid,
                        "success": true,
                        "reason": "found",
                        "group": message.json["group"],
                        "pairs": [],
                    }),
                    Vec::new(),
                ),
            },
            "chunked" => {
                state.chunk_messages += 1;
                let outcome = state.assembler.handle(message);
                if let Some(ack) = outcome.ack {
                    self.reply(state, ack, Vec::new());
                }
                if let Some(inner) = outcome.completed {
                    self.handle(state, inner);
                }
            }
            msg_type @ ("full_graph" | "graph_update") => {
                state.update_attempts += 1;
                let msg_type = msg_type.to_string();
                self.handle_update(state, msg_type, task_uid, message);
            }
            _ => {}
        }
    }

    fn handle_update(
        &self,
        state: &mut MockState,
        msg_type: String,
        task_uid: Option<String>,
        message: WireMessage,
    ) {
        let payload = UpdatePayload::from_message(&message.json, message.segments).unwrap();
        let uid = payload.header.graph_uid.clone();
        state.updates.push((msg_type, payload.clone()));

        let response = match state.behavior.clone() {
            UpdateBehavior::Ignore => return,
            UpdateBehavior::Reject(reason) => json!({"success": false, "reason": reason}),
            UpdateBehavior::RejectWithHeads(heads) => {
                let mut response = serde_json::to_value(heads).unwrap();
                response["success"] = json!(false);
                response["reason"] = json!("behind");
                response
            }
            UpdateBehavior::Accept => {
                let heads = UpdateHeads::from_payload(&payload.header).unwrap();
                let held = state.graphs.entry(uid).or_default();
                match held.apply_heads(&heads) {
                    Ok(()) => json!({"success": true}),
                    Err(e) => {
                        let mut response = serde_json::to_value(heads_json(held)).unwrap();
                        response["success"] = json!(false);
                        response["reason"] = json!(e.to_string());
                        response
                    }
                }
            }
        };
        let mut response = response;
        response["msg_type"] = json!("graph_update_response");
        response["task_uid"] = json!(task_uid);
        self.reply(state, response, Vec::new());
    }
}

impl Transport for MockUpstream {
    fn connect(&self, _uri: &str, events: Sender<TransportEvent>) -> Result<()> {
        self.state.lock().events = Some(events);
        Ok(())
    }

    fn send(&self, message: Bytes) -> Result<()> {
        let message = WireMessage::decode(&message)?;
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(Error::Disconnected);
        }
        state.received.push(message.json.clone());
        self.handle(&mut state, message);
        Ok(())
    }

    fn close(&self) {
        self.state.lock().events = None;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }
}

/// `{blobs_head, cache_heads}` of the upstream's markers
pub fn heads_json(heads: &GraphHeads) -> HeadsJson {
    HeadsJson {
        blobs_head: heads.blobs,
        cache_heads: heads
            .caches
            .iter()
            .map(|(kind, mark)| {
                (
                    kind.name().to_string(),
                    CacheHead {
                        head: mark.size,
                        revision: mark.revision,
                    },
                )
            })
            .collect(),
    }
}

/// Config pointing at the mock, with short timeouts and small chunks
pub fn test_config(dir: &TempDir) -> ClientConfig {
    let mut config = ClientConfig::default()
        .with_config_dir(dir.path())
        .with_upstream("mock://upstream")
        .with_auto_connect(AutoConnect::Auto);
    config.generic_timeout = Duration::from_secs(5);
    config.chunking = ChunkingConfig {
        size: 64,
        min_size: 16,
        window: 4,
        timeout: Duration::from_secs(5),
        ..ChunkingConfig::default()
    };
    config.sync = SyncConfig {
        max_attempts: 3,
        retry_backoff: Duration::from_millis(20),
        interval: Duration::from_secs(3600),
        update_timeout: Duration::from_secs(5),
    };
    config.storage.max_region_size = 4 * PAGE_SIZE;
    config
}

/// Credential store with a forced key and no environment lookups
pub fn credentials(config: &ClientConfig, key: &str) -> Arc<CredentialStore> {
    let key = key.to_string();
    Arc::new(
        CredentialStore::new(config, Arc::new(HttpTokenExchange::new(None)))
            .with_env_key(move || Some(key.clone())),
    )
}

/// Block until `conn` is authenticated
pub fn wait_authenticated(conn: &ConnectionManager) {
    assert!(
        conn.wait_for_auth(Some(Duration::from_secs(5))).unwrap(),
        "connection did not authenticate"
    );
}

/// Poll `condition` for up to five seconds
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Anonymous-paged graph small enough for tests
pub fn small_graph(uid: &str) -> GraphState {
    let region = Region::create(RegionStyle::AnonymousPaged, 4 * PAGE_SIZE, None).unwrap();
    GraphState::new(uid, region)
}

/// `count` blobs filled with `fill`
pub fn blobs(count: u64, fill: u8) -> Vec<u8> {
    vec![fill; (count * tessera_core::sync::BLOB_STEP) as usize]
}
