//! Background tasks for the Adieu server.
//!
//! Includes:
//! - Draining the federation outbox to remote servers.

use crate::middleware::sign_request;
use crate::AppState;
use adieu_db::{events, outbox, rooms, DbError};
use adieu_types::canonical::to_wire;
use adieu_types::{now_millis, parse_room_version, OwnedServerName, RoomId, ServerName};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Most PDUs sent in one transaction.
const MAX_PDUS_PER_TXN: usize = 50;

/// Queued events for one destination, ready to send.
#[derive(Debug)]
pub struct OutboundBatch {
    pub destination: OwnedServerName,
    pub send_as: OwnedServerName,
    /// Outbox row ids covered by this batch.
    pub entry_ids: Vec<i64>,
    /// Events in their wire form.
    pub pdus: Vec<Value>,
}

/// Groups pending outbox rows into per-destination batches.
///
/// Rows whose event or room version can no longer be loaded are marked as
/// failed and skipped.
pub fn collect_batches(conn: &Connection, limit: usize) -> Result<Vec<OutboundBatch>, DbError> {
    let mut batches: BTreeMap<(OwnedServerName, OwnedServerName), OutboundBatch> =
        BTreeMap::new();

    for entry in outbox::pending(conn, limit)? {
        let Some(json) = events::get_event_json(conn, &entry.event_id)? else {
            outbox::record_failure(conn, entry.id, "event no longer stored")?;
            continue;
        };
        let rules = json
            .get("room_id")
            .and_then(Value::as_str)
            .and_then(|s| RoomId::parse(s).ok())
            .map(|room_id| rooms::get_room_version(conn, &room_id))
            .transpose()?
            .flatten()
            .and_then(|tag| parse_room_version(&tag).ok());
        let Some(rules) = rules else {
            outbox::record_failure(conn, entry.id, "room version unavailable")?;
            continue;
        };
        let wire = to_wire(rules, &json)
            .map_err(|e| DbError::Corrupt(format!("stored event {}: {e}", entry.event_id)))?;

        let batch = batches
            .entry((entry.destination.clone(), entry.send_as.clone()))
            .or_insert_with(|| OutboundBatch {
                destination: entry.destination.clone(),
                send_as: entry.send_as.clone(),
                entry_ids: Vec::new(),
                pdus: Vec::new(),
            });
        if batch.pdus.len() < MAX_PDUS_PER_TXN {
            batch.entry_ids.push(entry.id);
            batch.pdus.push(wire);
        }
    }

    Ok(batches.into_values().collect())
}

/// Body of `PUT /_matrix/federation/v1/send/{txnId}`.
pub fn transaction_body(origin: &ServerName, origin_server_ts: u64, pdus: &[Value]) -> Value {
    json!({
        "origin": origin.as_str(),
        "origin_server_ts": origin_server_ts,
        "pdus": pdus,
        "edus": []
    })
}

async fn send_batch(
    client: &reqwest::Client,
    state: &AppState,
    batch: &OutboundBatch,
) -> Result<(), String> {
    let txn_id = uuid::Uuid::new_v4().simple().to_string();
    let path = format!("/_matrix/federation/v1/send/{txn_id}");
    let body = transaction_body(&batch.send_as, now_millis(), &batch.pdus);
    let authorization = sign_request(
        "PUT",
        &path,
        &batch.send_as,
        &batch.destination,
        Some(&body),
        &state.signing_key,
    )
    .map_err(|e| e.to_string())?;

    let url = format!("https://{}{}", batch.destination, path);
    let response = client
        .put(&url)
        .header(reqwest::header::AUTHORIZATION, authorization)
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("{url} returned status {}", response.status()));
    }
    Ok(())
}

/// Sends one round of queued events and records the outcome of each batch.
pub async fn drain_outbox_once(state: Arc<AppState>, client: &reqwest::Client) {
    let pool = state.pool.clone();
    let batches = tokio::task::spawn_blocking(move || -> Result<Vec<OutboundBatch>, DbError> {
        let conn = pool.get()?;
        collect_batches(&conn, MAX_PDUS_PER_TXN * 4)
    })
    .await;

    let batches = match batches {
        Ok(Ok(batches)) => batches,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to read federation outbox");
            return;
        }
        Err(e) => {
            tracing::error!(error = %e, "outbox task join error");
            return;
        }
    };

    for batch in batches {
        let result = send_batch(client, &state, &batch).await;
        match &result {
            Ok(()) => tracing::debug!(
                destination = %batch.destination,
                pdus = batch.pdus.len(),
                "delivered federation transaction"
            ),
            Err(e) => tracing::warn!(
                destination = %batch.destination,
                error = %e,
                "federation transaction failed, will retry"
            ),
        }

        let pool = state.pool.clone();
        let ids = batch.entry_ids;
        let recorded = tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let conn = pool.get()?;
            for id in ids {
                match &result {
                    Ok(()) => outbox::mark_delivered(&conn, id)?,
                    Err(e) => outbox::record_failure(&conn, id, e)?,
                }
            }
            Ok(())
        })
        .await;
        if let Ok(Err(e)) | Err(e) = recorded.map_err(|e| DbError::Corrupt(e.to_string())) {
            tracing::error!(error = %e, "failed to record outbox delivery");
        }
    }
}

/// Starts the outbox sender.
///
/// Runs indefinitely, sweeping the outbox every `interval_secs` seconds.
pub async fn start_outbox_task(state: Arc<AppState>, interval_secs: u64) {
    let interval = Duration::from_secs(interval_secs.max(1));
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error = %e, "failed to build federation client, outbox disabled");
            return;
        }
    };

    tracing::info!(interval_secs = interval.as_secs(), "starting federation outbox task");

    loop {
        sleep(interval).await;
        drain_outbox_once(state.clone(), &client).await;
    }
}
