//! In-memory collaborators for exercising the handshake in unit tests.

use crate::auth::{AuthorizationEvaluator, MembershipRules};
use crate::services::{
    EventIngestion, IngestError, IngestOutcome, LeaveContext, ResolveError, RoomStateSource,
    RoomVersionResolver, ServiceError, SignatureVerifier, VerifyJsonRequest, VerifyResult,
};
use adieu_types::signing::{self, signatures_from};
use adieu_types::{
    CreateEvent, Membership, MembershipEvent, OwnedRoomId, OwnedServerName, RoomId, RoomSnapshot,
    RoomState, ServerName, ServerSigningKey, UserId, VersionedEvent,
};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ROOM: &str = "!r:a.org";
pub const USER: &str = "@u:b.org";
pub const KEY_ID: &str = "ed25519:1";

/// Signing key derived from a fixed seed, published as [`KEY_ID`].
pub fn test_key(seed: u8) -> ServerSigningKey {
    ServerSigningKey::new(&SigningKey::from_bytes(&[seed; 32]), KEY_ID).unwrap()
}

/// The signing key `b.org` uses in these tests.
pub fn remote_key() -> ServerSigningKey {
    test_key(2)
}

fn create_event() -> CreateEvent {
    serde_json::from_value(json!({
        "event_id": "$create:a.org",
        "room_id": ROOM,
        "sender": "@creator:a.org",
        "type": "m.room.create",
        "state_key": "",
        "origin": "a.org",
        "origin_server_ts": 1_000,
        "content": { "creator": "@creator:a.org" },
        "prev_events": [],
        "auth_events": [],
        "depth": 1,
        "hashes": { "sha256": "unused" }
    }))
    .unwrap()
}

fn join_event(user: &str) -> MembershipEvent {
    serde_json::from_value(json!({
        "event_id": "$join:b.org",
        "room_id": ROOM,
        "sender": user,
        "type": "m.room.member",
        "state_key": user,
        "origin": "b.org",
        "origin_server_ts": 2_000,
        "content": { "membership": "join" },
        "prev_events": ["$create:a.org"],
        "auth_events": ["$create:a.org"],
        "depth": 2,
        "hashes": { "sha256": "unused" }
    }))
    .unwrap()
}

fn initial_snapshot() -> RoomSnapshot {
    let mut state = RoomState {
        create: Some(create_event()),
        members: Default::default(),
    };
    state
        .members
        .insert(UserId::parse(USER).unwrap(), join_event(USER));
    RoomSnapshot {
        state,
        prev_events: vec![adieu_types::EventId::parse("$join:b.org").unwrap()],
        max_depth: 2,
    }
}

type Rooms = Arc<Mutex<HashMap<OwnedRoomId, RoomSnapshot>>>;

#[derive(Default)]
pub struct FakeResolver {
    versions: Mutex<HashMap<String, String>>,
    pub fail: AtomicBool,
}

impl FakeResolver {
    pub fn insert(&self, room_id: &str, version: &str) {
        self.versions
            .lock()
            .unwrap()
            .insert(room_id.to_string(), version.to_string());
    }
}

#[async_trait]
impl RoomVersionResolver for FakeResolver {
    async fn room_version(&self, room_id: &RoomId) -> Result<String, ResolveError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ResolveError::Transport("connection reset".to_string()));
        }
        self.versions
            .lock()
            .unwrap()
            .get(room_id.as_str())
            .cloned()
            .ok_or(ResolveError::UnknownRoom)
    }
}

pub struct FakeState {
    rooms: Rooms,
}

impl FakeState {
    /// Changes `user`'s current membership to `ban`.
    pub fn ban(&self, user: &str) {
        let user = UserId::parse(user).unwrap();
        let mut rooms = self.rooms.lock().unwrap();
        for snapshot in rooms.values_mut() {
            if let Some(member) = snapshot.state.members.get_mut(&user) {
                member.draft.content.membership = Membership::Ban;
            }
        }
    }
}

#[async_trait]
impl RoomStateSource for FakeState {
    async fn snapshot(&self, room_id: &RoomId) -> Result<Option<RoomSnapshot>, ServiceError> {
        Ok(self.rooms.lock().unwrap().get(room_id).cloned())
    }
}

/// Verifies against a fixed key ring and counts how often it is consulted.
pub struct FakeVerifier {
    keys: HashMap<(String, String), (String, u64)>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeVerifier {
    fn verify_one(&self, request: &VerifyJsonRequest) -> VerifyResult {
        let value: Value = match serde_json::from_slice(&request.message) {
            Ok(value) => value,
            Err(e) => return VerifyResult::failed(e.to_string()),
        };
        let signatures = signatures_from(&value, &request.server_name);
        if signatures.is_empty() {
            return VerifyResult::failed(format!("no signatures from {}", request.server_name));
        }
        for (key_id, _) in signatures {
            let Some((key, valid_until)) = self
                .keys
                .get(&(request.server_name.to_string(), key_id.clone()))
            else {
                continue;
            };
            if request.strict_validity && request.at_ts > *valid_until {
                return VerifyResult::failed(format!("key {key_id} expired"));
            }
            if signing::verify_json(&request.server_name, &key_id, key, &value).is_ok() {
                return VerifyResult::ok();
            }
        }
        VerifyResult::failed("no valid signature")
    }
}

#[async_trait]
impl SignatureVerifier for FakeVerifier {
    async fn verify_json(
        &self,
        requests: &[VerifyJsonRequest],
    ) -> Result<Vec<VerifyResult>, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError("key server unreachable".to_string()));
        }
        Ok(requests.iter().map(|r| self.verify_one(r)).collect())
    }
}

/// Re-authorizes against the shared room state, stores, and dedupes by id.
pub struct FakeIngestion {
    rooms: Rooms,
    stored: Mutex<Vec<VersionedEvent>>,
    send_as: Mutex<Option<String>>,
    pub submissions: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeIngestion {
    pub fn stored(&self) -> Vec<VersionedEvent> {
        self.stored.lock().unwrap().clone()
    }

    pub fn last_send_as(&self) -> Option<String> {
        self.send_as.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventIngestion for FakeIngestion {
    async fn submit(
        &self,
        events: Vec<VersionedEvent>,
        send_as: &ServerName,
        _extra_destinations: Option<Vec<OwnedServerName>>,
    ) -> Result<IngestOutcome, IngestError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(IngestError::Internal("disk full".to_string()));
        }
        let mut stored = self.stored.lock().unwrap();
        let mut outcome = IngestOutcome::Duplicate;
        for event in events {
            if stored
                .iter()
                .any(|e| e.event.event_id == event.event.event_id)
            {
                continue;
            }
            let state = self
                .rooms
                .lock()
                .unwrap()
                .get(event.event.room_id())
                .map(|s| s.state.clone())
                .unwrap_or_default();
            MembershipRules
                .is_allowed(event.rules, &event.event.draft, &state)
                .map_err(|r| IngestError::Rejected(r.0))?;
            stored.push(event);
            outcome = IngestOutcome::Accepted;
        }
        *self.send_as.lock().unwrap() = Some(send_as.to_string());
        Ok(outcome)
    }
}

/// A room `!r:a.org` hosted on `a.org` in which `@u:b.org` is joined.
pub struct World {
    pub server_name: OwnedServerName,
    pub resolver: FakeResolver,
    pub state: FakeState,
    pub authorizer: MembershipRules,
    pub verifier: FakeVerifier,
    pub ingestion: FakeIngestion,
}

impl World {
    pub fn new(room_version: &str) -> Self {
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::from([(
            RoomId::parse(ROOM).unwrap(),
            initial_snapshot(),
        )])));
        let resolver = FakeResolver::default();
        resolver.insert(ROOM, room_version);

        Self {
            server_name: ServerName::parse("a.org").unwrap(),
            resolver,
            state: FakeState {
                rooms: rooms.clone(),
            },
            authorizer: MembershipRules,
            verifier: FakeVerifier {
                keys: HashMap::new(),
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            },
            ingestion: FakeIngestion {
                rooms,
                stored: Mutex::new(Vec::new()),
                send_as: Mutex::new(None),
                submissions: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            },
        }
        .with_server_key("b.org", &remote_key())
    }

    /// Makes `key` known to the key ring as `server`'s [`KEY_ID`].
    pub fn with_server_key(mut self, server: &str, key: &ServerSigningKey) -> Self {
        self.verifier.keys.insert(
            (server.to_string(), key.key_id().to_string()),
            (key.public_key().to_string(), u64::MAX),
        );
        self
    }

    /// Keeps the room's version known but drops all of its state.
    pub fn without_state(self) -> Self {
        self.state.rooms.lock().unwrap().clear();
        self
    }

    pub fn with_resolver_failure(self) -> Self {
        self.resolver.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_key_valid_until(mut self, valid_until_ts: u64) -> Self {
        for entry in self.verifier.keys.values_mut() {
            entry.1 = valid_until_ts;
        }
        self
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.state
            .rooms
            .lock()
            .unwrap()
            .get(&RoomId::parse(ROOM).unwrap())
            .cloned()
            .unwrap()
    }

    pub fn ctx(&self) -> LeaveContext<'_> {
        LeaveContext {
            server_name: &self.server_name,
            resolver: &self.resolver,
            state: &self.state,
            authorizer: &self.authorizer,
            verifier: &self.verifier,
            ingestion: &self.ingestion,
        }
    }
}
