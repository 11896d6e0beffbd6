//! Canonical JSON, redaction and event hashing.
//!
//! Events travel as `serde_json::Value` through the server; this module moves
//! them in and out of ruma's [`CanonicalJsonObject`], which enforces the
//! canonical JSON rules (sorted keys, no floats, integers within the safe
//! range) and backs redaction, content hashes and reference hashes.

use crate::room_version::RoomVersionRules;
use ruma::canonical_json::{
    redact as redact_object, to_canonical_value, CanonicalJsonError, CanonicalJsonObject,
    CanonicalJsonValue, RedactionError,
};
use ruma::{EventId, IdParseError, OwnedEventId};
use serde_json::Value;
use thiserror::Error;

/// Largest event accepted over federation, in canonical JSON bytes.
pub const MAX_PDU_BYTES: usize = 65_536;

/// Errors produced while canonicalizing or hashing an event.
#[derive(Debug, Error)]
pub enum CanonicalError {
    #[error("event JSON must be an object")]
    NotAnObject,
    #[error("value is not canonical JSON: {0}")]
    Json(#[from] CanonicalJsonError),
    #[error("event is {0} bytes, exceeding the 65536 byte limit")]
    TooLarge(usize),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid event id: {0}")]
    InvalidEventId(#[from] IdParseError),
    #[error("redaction failed: {0}")]
    Redaction(#[from] RedactionError),
    #[error("hashing failed: {0}")]
    Hashing(#[from] ruma::signatures::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Converts a JSON object into ruma's canonical representation.
pub fn to_canonical_object(value: &Value) -> Result<CanonicalJsonObject, CanonicalError> {
    match to_canonical_value(value)? {
        CanonicalJsonValue::Object(obj) => Ok(obj),
        _ => Err(CanonicalError::NotAnObject),
    }
}

/// Converts a canonical object back into plain JSON.
pub fn from_canonical_object(obj: CanonicalJsonObject) -> Result<Value, CanonicalError> {
    Ok(serde_json::to_value(obj)?)
}

/// Encodes `value` as canonical JSON bytes.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    Ok(to_canonical_value(value)?.to_string().into_bytes())
}

/// Fails if the canonical form of `value` exceeds [`MAX_PDU_BYTES`].
pub fn ensure_pdu_size(value: &Value) -> Result<usize, CanonicalError> {
    let len = canonical_json(value)?.len();
    if len > MAX_PDU_BYTES {
        return Err(CanonicalError::TooLarge(len));
    }
    Ok(len)
}

/// Strips an event down to the subset that is covered by signatures.
pub fn redact(rules: &dyn RoomVersionRules, value: &Value) -> Result<Value, CanonicalError> {
    let redacted = redact_object(to_canonical_object(value)?, rules.id(), None)?;
    from_canonical_object(redacted)
}

/// Computes the unpadded base64 sha256 content hash of an event.
pub fn content_hash(value: &Value) -> Result<String, CanonicalError> {
    let hash = ruma::signatures::content_hash(&to_canonical_object(value)?)?;
    Ok(hash.encode())
}

/// Returns `true` if `hashes.sha256` matches the event's content.
pub fn verify_content_hash(value: &Value) -> Result<bool, CanonicalError> {
    let claimed = value
        .get("hashes")
        .and_then(|h| h.get("sha256"))
        .and_then(Value::as_str)
        .ok_or(CanonicalError::MissingField("hashes.sha256"))?;
    Ok(content_hash(value)? == claimed)
}

/// Determines the id of an event according to the room version.
///
/// Server-assigned formats read `event_id` from the body; hash formats derive
/// it from the redacted event and ignore any `event_id` present.
pub fn event_id(rules: &dyn RoomVersionRules, value: &Value) -> Result<OwnedEventId, CanonicalError> {
    if rules.event_id_in_body() {
        let raw = value
            .get("event_id")
            .and_then(Value::as_str)
            .ok_or(CanonicalError::MissingField("event_id"))?;
        return Ok(EventId::parse(raw)?);
    }
    let wire = to_canonical_object(&to_wire(rules, value)?)?;
    let hash = ruma::signatures::reference_hash(&wire, rules.id())?;
    Ok(EventId::parse(format!("${hash}"))?)
}

/// Returns the event as it travels over federation for this room version.
///
/// Hash-format versions never carry `event_id` on the wire.
pub fn to_wire(rules: &dyn RoomVersionRules, value: &Value) -> Result<Value, CanonicalError> {
    let mut obj = value.as_object().ok_or(CanonicalError::NotAnObject)?.clone();
    if !rules.event_id_in_body() {
        obj.remove("event_id");
    }
    Ok(Value::Object(obj))
}

/// Returns the event with its id embedded, the form used for storage.
pub fn with_event_id(value: &Value, event_id: &EventId) -> Result<Value, CanonicalError> {
    let mut obj = value.as_object().ok_or(CanonicalError::NotAnObject)?.clone();
    obj.insert(
        "event_id".to_string(),
        Value::String(event_id.as_str().to_string()),
    );
    Ok(Value::Object(obj))
}
