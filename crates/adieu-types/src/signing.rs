//! ed25519 signing of JSON objects and events.
//!
//! Signing and verification go through `ruma::signatures`; this module adapts
//! them to the server's `serde_json::Value` events and its single
//! `ed25519-dalek` signing key.

use crate::canonical::{self, CanonicalError};
use crate::room_version::RoomVersionRules;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use ruma::canonical_json::{CanonicalJsonObject, CanonicalJsonValue};
use ruma::serde::Base64;
use ruma::signatures::{self, Ed25519KeyPair, PublicKeyMap, PublicKeySet};
use ruma::{OwnedEventId, ServerName};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Algorithm prefix of every key id this server understands.
pub const ED25519: &str = "ed25519";

/// Errors produced while signing or verifying JSON.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed key id: {0}")]
    MalformedKeyId(String),
    #[error("malformed verify key: {0}")]
    MalformedKey(String),
    #[error("no signature from {server} with key {key_id}")]
    MissingSignature { server: String, key_id: String },
    #[error(transparent)]
    Signatures(#[from] signatures::Error),
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

/// A server's ed25519 signing key under its published key id.
pub struct ServerSigningKey {
    key_id: String,
    public_key: String,
    pair: Ed25519KeyPair,
}

impl ServerSigningKey {
    /// Wraps `key` for signing under `key_id`, which must look like
    /// `ed25519:<version>`.
    pub fn new(key: &SigningKey, key_id: &str) -> Result<Self, SignatureError> {
        let version = key_id
            .strip_prefix("ed25519:")
            .filter(|version| !version.is_empty())
            .ok_or_else(|| SignatureError::MalformedKeyId(key_id.to_string()))?;
        let der = key
            .to_pkcs8_der()
            .map_err(|e| SignatureError::MalformedKey(e.to_string()))?;
        let pair = Ed25519KeyPair::from_der(der.as_bytes(), version.to_string())?;

        Ok(Self {
            key_id: key_id.to_string(),
            public_key: encode_verify_key(key.verifying_key().as_bytes()),
            pair,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The verify key as it is published: unpadded standard base64.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }
}

impl fmt::Debug for ServerSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSigningKey")
            .field("key_id", &self.key_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Encodes raw verify key bytes the way keys are published.
pub fn encode_verify_key(bytes: &[u8]) -> String {
    let encoded: Base64 = Base64::new(bytes.to_vec());
    encoded.encode()
}

/// Adds `signatures.{server}.{key_id}` to a JSON object.
pub fn sign_json(
    server: &ServerName,
    key: &ServerSigningKey,
    value: &mut Value,
) -> Result<(), SignatureError> {
    let mut obj = canonical::to_canonical_object(value)?;
    signatures::sign_json(server.as_str(), &key.pair, &mut obj)?;
    *value = canonical::from_canonical_object(obj)?;
    Ok(())
}

/// Returns the ed25519 signatures `server` attached to a JSON object as
/// `(key_id, signature)` pairs.
pub fn signatures_from(value: &Value, server: &ServerName) -> Vec<(String, String)> {
    value
        .get("signatures")
        .and_then(|s| s.get(server.as_str()))
        .and_then(Value::as_object)
        .map(|by_key| {
            by_key
                .iter()
                .filter(|(key_id, _)| key_id.starts_with("ed25519:"))
                .filter_map(|(key_id, sig)| Some((key_id.clone(), sig.as_str()?.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Verifies the signature `server` made with `key_id` over a JSON object.
///
/// Signatures by other servers or under other key ids are ignored.
pub fn verify_json(
    server: &ServerName,
    key_id: &str,
    public_key: &str,
    value: &Value,
) -> Result<(), SignatureError> {
    let signature = signatures_from(value, server)
        .into_iter()
        .find(|(id, _)| id == key_id)
        .map(|(_, sig)| sig)
        .ok_or_else(|| SignatureError::MissingSignature {
            server: server.to_string(),
            key_id: key_id.to_string(),
        })?;

    let mut by_key = CanonicalJsonObject::new();
    by_key.insert(key_id.to_string(), CanonicalJsonValue::String(signature));
    let mut by_server = CanonicalJsonObject::new();
    by_server.insert(server.to_string(), CanonicalJsonValue::Object(by_key));
    let mut obj = canonical::to_canonical_object(value)?;
    obj.insert("signatures".to_string(), CanonicalJsonValue::Object(by_server));

    let key = Base64::parse(public_key).map_err(|e| SignatureError::MalformedKey(e.to_string()))?;
    let mut keys = PublicKeySet::new();
    keys.insert(key_id.to_string(), key);
    let mut key_map = PublicKeyMap::new();
    key_map.insert(server.to_string(), keys);

    signatures::verify_json(&key_map, &obj)?;
    Ok(())
}

/// Hashes, signs and identifies an event draft on behalf of `server`.
///
/// For server-assigned id formats the draft must already carry `event_id`.
/// Returns the event id and the event in its wire form.
pub fn finalize_event(
    rules: &dyn RoomVersionRules,
    draft: Value,
    server: &ServerName,
    key: &ServerSigningKey,
) -> Result<(OwnedEventId, Value), SignatureError> {
    let mut obj = canonical::to_canonical_object(&canonical::to_wire(rules, &draft)?)?;
    signatures::hash_and_sign_event(server.as_str(), &key.pair, &mut obj, rules.id())?;
    let event = canonical::from_canonical_object(obj)?;

    let event_id = canonical::event_id(rules, &event)?;
    Ok((event_id, event))
}
