//! The `make_leave` / `send_leave` handshake.
//!
//! `make_leave` drafts an unsigned leave for a user on the calling server;
//! the calling server signs it and hands it back through `send_leave`, which
//! validates it and passes it on to ingestion. Validation in `send_leave` is
//! strictly ordered and nothing is persisted until every check has passed.

use crate::error::LeaveError;
use crate::services::{
    IngestError, IngestOutcome, LeaveContext, ResolveError, VerifyJsonRequest,
};
use adieu_types::canonical::{self, CanonicalError};
use adieu_types::{
    now_millis, parse_room_version, EventDraft, LeaveTemplate, MemberContent, Membership,
    MembershipEvent, OwnedRoomId, RoomId, RoomVersionId, RoomVersionRules, ServerName, UserId,
    VersionedEvent, MEMBER_EVENT_TYPE,
};
use serde::Serialize;
use serde_json::Value;

/// Response to `make_leave`.
#[derive(Debug, Clone, Serialize)]
pub struct MakeLeaveResponse {
    pub room_version: RoomVersionId,
    pub event: LeaveTemplate,
}

async fn resolve_version(
    ctx: &LeaveContext<'_>,
    room_id: &RoomId,
) -> Result<&'static dyn RoomVersionRules, LeaveError> {
    match ctx.resolver.room_version(room_id).await {
        Ok(tag) => parse_room_version(&tag).map_err(|e| LeaveError::UnsupportedRoomVersion(e.0)),
        Err(ResolveError::UnknownRoom) => Err(LeaveError::RoomUnknown),
        Err(ResolveError::Transport(e)) => Err(LeaveError::internal("room version lookup", e)),
    }
}

fn parse_room_id(room_id: &str) -> Result<OwnedRoomId, LeaveError> {
    RoomId::parse(room_id).map_err(|e| LeaveError::MalformedPayload(format!("Invalid RoomID: {e}")))
}

/// Drafts an unsigned leave event for `user_id` on behalf of `origin`.
///
/// The draft is dry-run through the authorization evaluator before it is
/// returned. Nothing is stored.
pub async fn make_leave(
    ctx: &LeaveContext<'_>,
    origin: &ServerName,
    room_id: &str,
    user_id: &str,
) -> Result<MakeLeaveResponse, LeaveError> {
    let room_id = parse_room_id(room_id)?;
    let rules = resolve_version(ctx, &room_id).await?;

    let user = UserId::parse(user_id)
        .map_err(|e| LeaveError::MalformedPayload(format!("Invalid UserID: {e}")))?;
    if user.server_name() != origin {
        tracing::info!(%room_id, %user, %origin, "make_leave for a user on another server");
        return Err(LeaveError::OriginMismatch(
            "The leave must be sent by the server of the user",
        ));
    }

    let snapshot = ctx
        .state
        .snapshot(&room_id)
        .await
        .map_err(|e| LeaveError::internal("room state lookup", e))?
        .ok_or(LeaveError::RoomUnknown)?;
    if snapshot.state.create.is_none() || snapshot.prev_events.is_empty() {
        return Err(LeaveError::RoomUnknown);
    }

    let event = EventDraft {
        room_id: room_id.clone(),
        sender: user.clone(),
        kind: MEMBER_EVENT_TYPE.to_string(),
        state_key: user.to_string(),
        origin: origin.to_owned(),
        origin_server_ts: now_millis(),
        content: MemberContent::leave(),
        prev_events: snapshot.prev_events.clone(),
        auth_events: snapshot.state.auth_events_for(&user),
        depth: snapshot.max_depth + 1,
    };

    let value = serde_json::to_value(&event)
        .map_err(|e| LeaveError::MalformedContent(e.to_string()))?;
    canonical::ensure_pdu_size(&value).map_err(|e| LeaveError::MalformedContent(e.to_string()))?;

    ctx.authorizer
        .is_allowed(rules, &event, &snapshot.state)
        .map_err(|rejection| {
            tracing::info!(%room_id, %user, reason = %rejection, "make_leave not authorized");
            LeaveError::NotAuthorized(rejection.0)
        })?;

    let room_version = rules.id().clone();
    tracing::debug!(%room_id, %user, %room_version, "drafted leave event");
    Ok(MakeLeaveResponse {
        room_version,
        event,
    })
}

/// Parses an untrusted leave payload according to the room version.
///
/// An event whose content no longer matches its content hash is redacted
/// rather than rejected; the signature check still decides whether it is
/// accepted.
fn parse_payload(
    rules: &'static dyn RoomVersionRules,
    payload: &[u8],
) -> Result<VersionedEvent, LeaveError> {
    let malformed = |e: &dyn std::fmt::Display| {
        LeaveError::MalformedPayload(format!(
            "The request body could not be decoded into valid JSON. {e}"
        ))
    };

    let value: Value = serde_json::from_slice(payload).map_err(|e| malformed(&e))?;
    canonical::ensure_pdu_size(&value).map_err(|e| malformed(&e))?;
    let mut wire = canonical::to_wire(rules, &value).map_err(|e| malformed(&e))?;

    match canonical::verify_content_hash(&wire) {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!("leave content does not match its hash, redacting");
            wire = canonical::redact(rules, &wire).map_err(|e| malformed(&e))?;
        }
        Err(e) => return Err(malformed(&e)),
    }

    let event_id = canonical::event_id(rules, &wire).map_err(|e: CanonicalError| malformed(&e))?;
    let json = canonical::with_event_id(&wire, &event_id).map_err(|e| malformed(&e))?;
    let event: MembershipEvent = serde_json::from_value(json.clone()).map_err(|e| malformed(&e))?;
    if event.draft.kind != MEMBER_EVENT_TYPE {
        return Err(malformed(&format!(
            "expected event type {MEMBER_EVENT_TYPE}, got {}",
            event.draft.kind
        )));
    }

    Ok(VersionedEvent { rules, event, json })
}

/// Validates a signed leave from `origin` and hands it to ingestion.
///
/// Checks run in a fixed order and stop at the first failure: room version,
/// payload shape, room ID, event ID, origin, sender domain, signature,
/// membership, and finally authorization against live state inside
/// ingestion.
pub async fn send_leave(
    ctx: &LeaveContext<'_>,
    origin: &ServerName,
    room_id: &str,
    event_id: &str,
    payload: &[u8],
) -> Result<(), LeaveError> {
    let room_id = parse_room_id(room_id)?;
    let rules = match resolve_version(ctx, &room_id).await {
        Ok(rules) => rules,
        Err(LeaveError::RoomUnknown) => {
            return Err(LeaveError::UnsupportedRoomVersion(format!(
                "no room version known for {room_id}"
            )))
        }
        Err(e) => return Err(e),
    };

    let versioned = parse_payload(rules, payload)?;
    let event = &versioned.event;

    if event.room_id() != &*room_id {
        return Err(LeaveError::RoomIdMismatch);
    }
    if event.event_id.as_str() != event_id {
        return Err(LeaveError::EventIdMismatch);
    }
    if event.origin() != origin {
        tracing::info!(%room_id, event_id, %origin, claimed = %event.origin(), "send_leave from a server that did not author the event");
        return Err(LeaveError::OriginMismatch(
            "The leave must be sent by the server it originated on",
        ));
    }
    let target = UserId::parse(event.state_key())
        .map_err(|e| LeaveError::MalformedPayload(format!("Invalid state_key: {e}")))?;
    if event.sender().server_name() != origin || target.server_name() != origin {
        tracing::info!(%room_id, event_id, %origin, sender = %event.sender(), "send_leave for a user on another server");
        return Err(LeaveError::OriginMismatch(
            "The sender does not match the server that originated the request",
        ));
    }

    let redacted = canonical::to_wire(rules, &versioned.json)
        .and_then(|wire| canonical::redact(rules, &wire))
        .and_then(|redacted| canonical::canonical_json(&redacted))
        .map_err(|e| LeaveError::internal("redacting leave event", e))?;
    let requests = [VerifyJsonRequest {
        server_name: origin.to_owned(),
        message: redacted,
        at_ts: event.draft.origin_server_ts,
        strict_validity: true,
    }];
    let results = ctx
        .verifier
        .verify_json(&requests)
        .await
        .map_err(|e| LeaveError::internal("verifying leave signature", e))?;
    let result = results
        .into_iter()
        .next()
        .ok_or_else(|| LeaveError::internal("verifying leave signature", "no result returned"))?;
    if let Some(reason) = result.error {
        tracing::info!(%room_id, event_id, %origin, %reason, "leave signature rejected");
        return Err(LeaveError::SignatureInvalid(reason));
    }

    if event.content().membership != Membership::Leave {
        return Err(LeaveError::MembershipMismatch);
    }

    // This server is responsible for telling the rest of the room.
    match ctx
        .ingestion
        .submit(vec![versioned.clone()], ctx.server_name, None)
        .await
    {
        Ok(IngestOutcome::Accepted) => {
            tracing::info!(%room_id, event_id, %origin, "accepted leave");
            Ok(())
        }
        Ok(IngestOutcome::Duplicate) => {
            tracing::debug!(%room_id, event_id, "leave already stored");
            Ok(())
        }
        Err(IngestError::Rejected(reason)) => {
            tracing::info!(%room_id, event_id, %reason, "leave rejected by authorization");
            Err(LeaveError::NotAuthorized(reason))
        }
        Err(IngestError::Internal(e)) => Err(LeaveError::internal("submitting leave event", e)),
    }
}
