#![allow(dead_code)]

use adieu_db::keys::{upsert_server_key, ServerKey};
use adieu_db::{events, open_database, rooms, DbPool, DbRuntimeSettings};
use adieu_federation::ServiceError;
use adieu_server::keys::{record_local_key, KeyFetcher};
use adieu_server::{app, middleware::sign_request, AppState};
use adieu_types::signing::finalize_event;
use adieu_types::{
    rules_for, EventId, OwnedServerName, RoomId, RoomVersionId, ServerName, ServerSigningKey,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use ed25519_dalek::SigningKey;
use serde_json::{json, Value};
use std::sync::Arc;

pub const ROOM: &str = "!r:a.org";
pub const USER: &str = "@u:b.org";
pub const REMOTE_KEY_ID: &str = "ed25519:b1";

pub fn server(name: &str) -> OwnedServerName {
    ServerName::parse(name).unwrap()
}

pub fn remote_key() -> ServerSigningKey {
    key_from_seed(2)
}

pub fn key_from_seed(seed: u8) -> ServerSigningKey {
    ServerSigningKey::new(&SigningKey::from_bytes(&[seed; 32]), REMOTE_KEY_ID).unwrap()
}

/// A network where no server publishes keys.
pub struct Offline;

#[async_trait]
impl KeyFetcher for Offline {
    async fn fetch(&self, server: &ServerName) -> Result<Value, ServiceError> {
        Err(ServiceError(format!("{server} is unreachable")))
    }
}

pub struct TestServer {
    _dir: tempfile::TempDir,
    pub pool: DbPool,
    pub app: Router,
}

/// Serves `a.org` with one room in which `@creator:a.org`, `@u:b.org` and
/// `@v:c.org` are joined. `b.org` and `c.org` share [`remote_key`]; `b.org`'s
/// copy is valid until `key_valid_until`.
pub fn setup_app(version: RoomVersionId, key_valid_until: u64) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("adieu.db");
    let pool = open_database(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();

    let conn = pool.get().unwrap();
    rooms::create_room(&conn, &RoomId::parse(ROOM).unwrap(), &version).unwrap();
    let create = json!({
        "event_id": "$create:a.org", "room_id": ROOM, "sender": "@creator:a.org",
        "type": "m.room.create", "state_key": "", "origin": "a.org",
        "origin_server_ts": 1, "content": { "creator": "@creator:a.org" },
        "prev_events": [], "auth_events": [], "depth": 1, "hashes": { "sha256": "h" }
    });
    events::store_event(&conn, &EventId::parse("$create:a.org").unwrap(), &create).unwrap();
    for (id, user, origin, depth) in [
        ("$j1:a.org", "@creator:a.org", "a.org", 2),
        ("$j2:b.org", USER, "b.org", 3),
        ("$j3:c.org", "@v:c.org", "c.org", 4),
    ] {
        let join = json!({
            "event_id": id, "room_id": ROOM, "sender": user,
            "type": "m.room.member", "state_key": user, "origin": origin,
            "origin_server_ts": 2, "content": { "membership": "join" },
            "prev_events": ["$create:a.org"], "auth_events": ["$create:a.org"],
            "depth": depth, "hashes": { "sha256": "h" }
        });
        events::store_event(&conn, &EventId::parse(id).unwrap(), &join).unwrap();
    }
    for (name, valid_until_ts) in [("b.org", key_valid_until), ("c.org", u64::MAX)] {
        upsert_server_key(
            &conn,
            &ServerKey {
                server_name: server(name),
                key_id: REMOTE_KEY_ID.to_string(),
                public_key: remote_key().public_key().to_string(),
                valid_until_ts,
            },
        )
        .unwrap();
    }
    drop(conn);

    let local_key = ServerSigningKey::new(&SigningKey::from_bytes(&[9u8; 32]), "ed25519:a1").unwrap();
    record_local_key(&pool, &server("a.org"), &local_key).unwrap();
    let state = AppState::new(
        pool.clone(),
        server("a.org"),
        Arc::new(local_key),
        Arc::new(Offline),
    );

    TestServer {
        _dir: dir,
        pool,
        app: app(state),
    }
}

/// Builds a federation request signed by `origin` with `key`.
pub fn signed_request(
    method: &str,
    uri: &str,
    origin: &str,
    key: &ServerSigningKey,
    body: Option<&Value>,
) -> Request<Body> {
    let authorization = sign_request(
        method,
        uri,
        &server(origin),
        &server("a.org"),
        body,
        key,
    )
    .unwrap();
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", authorization);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Signs a leave built from a `make_leave` template as `b.org`.
///
/// Returns the event id and the signed event.
pub fn sign_template(version: &RoomVersionId, template: &Value, event_id: &str) -> (String, Value) {
    sign_as("b.org", version, template, event_id)
}

/// Signs a leave built from a `make_leave` template as `signer`, using
/// [`remote_key`].
pub fn sign_as(
    signer: &str,
    version: &RoomVersionId,
    template: &Value,
    event_id: &str,
) -> (String, Value) {
    let rules = rules_for(version).unwrap();
    let mut draft = template.clone();
    if rules.event_id_in_body() {
        draft["event_id"] = json!(event_id);
    }
    let (id, event) = finalize_event(rules, draft, &server(signer), &remote_key()).unwrap();
    (id.to_string(), event)
}

/// Path form of an event id; reference hashes may contain `/` and `+`.
pub fn encode_path(segment: &str) -> String {
    segment.replace('+', "%2B").replace('/', "%2F")
}
