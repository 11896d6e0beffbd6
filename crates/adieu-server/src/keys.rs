//! Server signing keys, ours and our peers'.
//!
//! The local key seed lives in a file next to the database. It is generated
//! on first start, recorded in the key table so the local key ring can
//! resolve it, and published at `GET /_matrix/key/v2/server`.
//!
//! Remote keys are fetched from the same endpoint on the remote server when
//! the key ring meets a signature it has no key for. A response is only
//! stored once it is signed by every key it lists.

use crate::AppState;
use adieu_db::keys::{upsert_server_key, ServerKey};
use adieu_db::DbPool;
use adieu_federation::ServiceError;
use adieu_types::signing::{sign_json, verify_json, ServerSigningKey, SignatureError};
use adieu_types::{now_millis, ServerName};
use async_trait::async_trait;
use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::SigningKey;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How long a published key response stays valid.
pub const KEY_VALIDITY_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Path of the key endpoint, local and remote.
pub const SERVER_KEYS_PATH: &str = "/_matrix/key/v2/server";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to access key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file does not contain a base64 ed25519 seed")]
    Malformed,
    #[error("failed to store key: {0}")]
    Db(#[from] adieu_db::DbError),
    #[error("failed to sign key response: {0}")]
    Signing(#[from] SignatureError),
    #[error("key response rejected: {0}")]
    Rejected(String),
}

/// Reads the key seed at `path`, generating and writing one if absent.
pub fn load_or_generate(path: &Path) -> Result<SigningKey, KeyError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let raw = STANDARD_NO_PAD
                .decode(contents.trim().trim_end_matches('='))
                .map_err(|_| KeyError::Malformed)?;
            let seed: [u8; 32] = raw.try_into().map_err(|_| KeyError::Malformed)?;
            Ok(SigningKey::from_bytes(&seed))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = SigningKey::generate(&mut rand::rngs::OsRng);
            std::fs::write(path, STANDARD_NO_PAD.encode(key.to_bytes()))?;
            tracing::info!(path = %path.display(), "generated new signing key");
            Ok(key)
        }
        Err(e) => Err(KeyError::Io(e)),
    }
}

/// Records our own verify key in the key table.
pub fn record_local_key(
    pool: &DbPool,
    server_name: &ServerName,
    key: &ServerSigningKey,
) -> Result<(), KeyError> {
    let conn = pool.get().map_err(adieu_db::DbError::from)?;
    upsert_server_key(
        &conn,
        &ServerKey {
            server_name: server_name.to_owned(),
            key_id: key.key_id().to_string(),
            public_key: key.public_key().to_string(),
            valid_until_ts: u64::MAX,
        },
    )?;
    Ok(())
}

/// Builds the signed key response published to other servers.
pub fn server_key_response(
    server_name: &ServerName,
    key: &ServerSigningKey,
    now_ms: u64,
) -> Result<Value, KeyError> {
    let mut response = json!({
        "server_name": server_name.as_str(),
        "valid_until_ts": now_ms + KEY_VALIDITY_MS,
        "verify_keys": {
            key.key_id(): { "key": key.public_key() }
        },
        "old_verify_keys": {}
    });
    sign_json(server_name, key, &mut response)?;
    Ok(response)
}

/// Handler for `GET /_matrix/key/v2/server`.
pub async fn get_server_keys_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    match server_key_response(&state.server_name, &state.signing_key, now_millis()) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => {
            tracing::error!(error = %e, "failed to build key response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "errcode": "M_UNKNOWN", "error": "Internal server error" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyKey {
    key: String,
}

#[derive(Debug, Deserialize)]
struct OldVerifyKey {
    key: String,
    expired_ts: u64,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    server_name: String,
    valid_until_ts: u64,
    #[serde(default)]
    verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default)]
    old_verify_keys: BTreeMap<String, OldVerifyKey>,
}

/// Checks a key response fetched from `server` and returns the keys to store.
///
/// The response must name `server` and carry a valid self-signature from
/// every key in `verify_keys`. Old keys are kept with their expiry as the
/// end of their validity.
pub fn parse_key_response(server: &ServerName, response: &Value) -> Result<Vec<ServerKey>, KeyError> {
    let parsed: KeyResponse = serde_json::from_value(response.clone())
        .map_err(|e| KeyError::Rejected(e.to_string()))?;
    if parsed.server_name != server.as_str() {
        return Err(KeyError::Rejected(format!(
            "response is for {}, not {server}",
            parsed.server_name
        )));
    }
    if parsed.verify_keys.is_empty() {
        return Err(KeyError::Rejected("no verify keys".to_string()));
    }
    for (key_id, verify_key) in &parsed.verify_keys {
        verify_json(server, key_id, &verify_key.key, response)
            .map_err(|e| KeyError::Rejected(format!("self-signature with {key_id}: {e}")))?;
    }

    let current = parsed.verify_keys.into_iter().map(|(key_id, k)| ServerKey {
        server_name: server.to_owned(),
        key_id,
        public_key: k.key,
        valid_until_ts: parsed.valid_until_ts,
    });
    let old = parsed.old_verify_keys.into_iter().map(|(key_id, k)| ServerKey {
        server_name: server.to_owned(),
        key_id,
        public_key: k.key,
        valid_until_ts: k.expired_ts,
    });
    Ok(current.chain(old).collect())
}

/// Source of other servers' published key responses.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Returns the raw key response `server` publishes.
    async fn fetch(&self, server: &ServerName) -> Result<Value, ServiceError>;
}

/// Fetches keys directly from each server over HTTPS.
#[derive(Clone)]
pub struct HttpKeyFetcher {
    client: reqwest::Client,
}

impl HttpKeyFetcher {
    pub fn new() -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError(format!("failed to build key client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, server: &ServerName) -> Result<Value, ServiceError> {
        let url = format!("https://{server}{SERVER_KEYS_PATH}");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError(format!("{url}: {e}")))?;
        if !response.status().is_success() {
            return Err(ServiceError(format!(
                "{url} returned status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError(format!("{url}: {e}")))
    }
}
