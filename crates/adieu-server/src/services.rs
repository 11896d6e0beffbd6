//! SQLite-backed implementations of the handshake's collaborators.
//!
//! Every implementation moves its database work onto the blocking pool.

use crate::keys::{parse_key_response, KeyFetcher};
use adieu_db::{events, keys, outbox, rooms, DbError, DbPool};
use adieu_federation::{
    AuthorizationEvaluator, EventIngestion, IngestError, IngestOutcome, ResolveError,
    RoomStateSource, RoomVersionResolver, ServiceError, SignatureVerifier, VerifyJsonRequest,
    VerifyResult,
};
use adieu_types::signing::{signatures_from, verify_json, SignatureError};
use adieu_types::{OwnedServerName, RoomId, RoomSnapshot, ServerName, VersionedEvent};
use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Runs `f` with a pooled connection on the blocking thread pool.
async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, DbError>
where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get()?;
        f(&mut conn)
    })
    .await
    .map_err(|e| DbError::Corrupt(format!("blocking task failed: {e}")))?
}

/// Room versions from the `rooms` table.
#[derive(Clone)]
pub struct DbRoomVersions {
    pub pool: DbPool,
}

#[async_trait]
impl RoomVersionResolver for DbRoomVersions {
    async fn room_version(&self, room_id: &RoomId) -> Result<String, ResolveError> {
        let room_id = room_id.to_owned();
        with_conn(&self.pool, move |conn| rooms::get_room_version(conn, &room_id))
            .await
            .map_err(|e| ResolveError::Transport(e.to_string()))?
            .ok_or(ResolveError::UnknownRoom)
    }
}

/// Current state from `current_state` and `forward_extremities`.
#[derive(Clone)]
pub struct DbRoomState {
    pub pool: DbPool,
}

#[async_trait]
impl RoomStateSource for DbRoomState {
    async fn snapshot(&self, room_id: &RoomId) -> Result<Option<RoomSnapshot>, ServiceError> {
        let room_id = room_id.to_owned();
        with_conn(&self.pool, move |conn| rooms::load_snapshot(conn, &room_id))
            .await
            .map_err(|e| ServiceError(e.to_string()))
    }
}

/// Verifies signatures against the keys stored in `server_keys`, fetching
/// keys it does not hold from the signing server.
#[derive(Clone)]
pub struct DbKeyRing {
    pub pool: DbPool,
    pub fetcher: Arc<dyn KeyFetcher>,
}

/// Servers whose signatures in `requests` use no key we have stored.
fn servers_missing_keys(
    conn: &Connection,
    requests: &[VerifyJsonRequest],
) -> Result<BTreeSet<OwnedServerName>, DbError> {
    let mut missing = BTreeSet::new();
    for request in requests {
        let Ok(value) = serde_json::from_slice::<Value>(&request.message) else {
            continue;
        };
        let signatures = signatures_from(&value, &request.server_name);
        if signatures.is_empty() {
            continue;
        }
        let known = keys::get_server_keys(conn, &request.server_name)?;
        if !signatures
            .iter()
            .any(|(key_id, _)| known.iter().any(|k| &k.key_id == key_id))
        {
            missing.insert(request.server_name.clone());
        }
    }
    Ok(missing)
}

impl DbKeyRing {
    /// Fetches, checks and stores the published keys of `server`.
    ///
    /// Failing to reach the server fails the key ring. A response that does
    /// not check out is logged and dropped, and the signatures it would have
    /// covered then fail verification.
    async fn refresh_keys(&self, server: &ServerName) -> Result<(), ServiceError> {
        let response = self.fetcher.fetch(server).await.map_err(|e| {
            tracing::warn!(%server, error = %e, "failed to fetch server keys");
            ServiceError(format!("fetching keys of {server}: {e}"))
        })?;
        let fetched = match parse_key_response(server, &response) {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(%server, error = %e, "discarding fetched server keys");
                return Ok(());
            }
        };

        let count = fetched.len();
        with_conn(&self.pool, move |conn| {
            for key in &fetched {
                keys::upsert_server_key(conn, key)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ServiceError(e.to_string()))?;
        tracing::info!(%server, keys = count, "stored fetched server keys");
        Ok(())
    }
}

fn verify_one(conn: &Connection, request: &VerifyJsonRequest) -> Result<VerifyResult, DbError> {
    let value: Value = match serde_json::from_slice(&request.message) {
        Ok(value) => value,
        Err(e) => return Ok(VerifyResult::failed(format!("message is not JSON: {e}"))),
    };
    let signatures = signatures_from(&value, &request.server_name);
    if signatures.is_empty() {
        return Ok(VerifyResult::failed(format!(
            "no ed25519 signature from {}",
            request.server_name
        )));
    }

    let known = keys::get_server_keys(conn, &request.server_name)?;
    let mut reason = format!("no known key of {} signed the message", request.server_name);
    for (key_id, _) in signatures {
        let Some(key) = known.iter().find(|k| k.key_id == key_id) else {
            continue;
        };
        if request.strict_validity && request.at_ts > key.valid_until_ts {
            reason = format!("key {key_id} of {} expired before the signature", request.server_name);
            continue;
        }
        match verify_json(&request.server_name, &key_id, &key.public_key, &value) {
            Ok(()) => return Ok(VerifyResult::ok()),
            Err(SignatureError::MalformedKey(e)) => {
                tracing::warn!(server = %request.server_name, key_id = %key_id, error = %e, "stored key is unusable");
            }
            Err(e) => reason = format!("signature with {key_id} is invalid: {e}"),
        }
    }
    Ok(VerifyResult::failed(reason))
}

#[async_trait]
impl SignatureVerifier for DbKeyRing {
    async fn verify_json(
        &self,
        requests: &[VerifyJsonRequest],
    ) -> Result<Vec<VerifyResult>, ServiceError> {
        let requests = requests.to_vec();
        let lookup = requests.clone();
        let missing = with_conn(&self.pool, move |conn| servers_missing_keys(conn, &lookup))
            .await
            .map_err(|e| ServiceError(e.to_string()))?;
        for server in &missing {
            self.refresh_keys(server).await?;
        }

        with_conn(&self.pool, move |conn| {
            requests.iter().map(|r| verify_one(conn, r)).collect()
        })
        .await
        .map_err(|e| ServiceError(e.to_string()))
    }
}

/// Authorizes and stores events, and queues them for the rest of the room.
#[derive(Clone)]
pub struct DbIngestion {
    pub pool: DbPool,
    /// This server; never queued as a destination.
    pub server_name: OwnedServerName,
    pub authorizer: Arc<dyn AuthorizationEvaluator>,
}

enum Ingest {
    Done(IngestOutcome),
    Rejected(String),
}

fn ingest(
    conn: &mut Connection,
    authorizer: &dyn AuthorizationEvaluator,
    local: &ServerName,
    batch: &[VersionedEvent],
    send_as: &ServerName,
    extra_destinations: &[OwnedServerName],
) -> Result<Ingest, DbError> {
    let tx = conn.transaction()?;
    let mut outcome = IngestOutcome::Duplicate;

    for versioned in batch {
        let event = &versioned.event;
        if events::event_exists(&tx, &event.event_id)? {
            continue;
        }

        let Some(snapshot) = rooms::load_snapshot(&tx, event.room_id())? else {
            return Ok(Ingest::Rejected(format!("room {} is not known", event.room_id())));
        };
        if let Err(rejection) =
            authorizer.is_allowed(versioned.rules, &event.draft, &snapshot.state)
        {
            return Ok(Ingest::Rejected(rejection.0));
        }

        // Destinations come from the state before this event.
        let mut destinations: BTreeSet<OwnedServerName> = snapshot
            .state
            .joined_members()
            .map(|user| user.server_name().to_owned())
            .collect();
        destinations.extend(extra_destinations.iter().cloned());
        destinations.remove(local);

        events::store_event(&tx, &event.event_id, &versioned.json)?;
        for destination in &destinations {
            outbox::enqueue(&tx, destination, &event.event_id, send_as)?;
        }
        tracing::info!(
            event_id = %event.event_id,
            room_id = %event.room_id(),
            destinations = destinations.len(),
            "persisted event"
        );
        outcome = IngestOutcome::Accepted;
    }

    tx.commit()?;
    Ok(Ingest::Done(outcome))
}

#[async_trait]
impl EventIngestion for DbIngestion {
    async fn submit(
        &self,
        batch: Vec<VersionedEvent>,
        send_as: &ServerName,
        extra_destinations: Option<Vec<OwnedServerName>>,
    ) -> Result<IngestOutcome, IngestError> {
        let authorizer = self.authorizer.clone();
        let local = self.server_name.clone();
        let send_as = send_as.to_owned();
        let extra = extra_destinations.unwrap_or_default();

        let result = with_conn(&self.pool, move |conn| {
            ingest(conn, authorizer.as_ref(), &local, &batch, &send_as, &extra)
        })
        .await
        .map_err(|e| IngestError::Internal(e.to_string()))?;

        match result {
            Ingest::Done(outcome) => Ok(outcome),
            Ingest::Rejected(reason) => Err(IngestError::Rejected(reason)),
        }
    }
}
