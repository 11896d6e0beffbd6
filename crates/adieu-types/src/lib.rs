//! Shared types for the Adieu federation server.
//!
//! This crate provides the foundational types used across all Adieu crates:
//! the room event model, room version rules, canonical JSON with redaction and
//! hashing, and ed25519 JSON signatures. Identifiers and the canonical JSON
//! machinery come from ruma and are re-exported here.
//!
//! No crate in the workspace depends on anything *except* `adieu-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

pub mod canonical;
pub mod event;
pub mod room_version;
pub mod signing;
pub mod state;

pub use canonical::CanonicalError;
pub use event::{
    CreateContent, CreateEvent, EventDraft, EventHashes, LeaveTemplate, MemberContent,
    Membership, MembershipEvent, SignedPdu, VersionedEvent, CREATE_EVENT_TYPE,
    MEMBER_EVENT_TYPE,
};
pub use room_version::{
    parse_room_version, rules_for, RoomVersionId, RoomVersionRules, UnsupportedRoomVersion,
};
pub use ruma::{
    EventId, IdParseError, OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomId,
    ServerName, UserId,
};
pub use signing::{ServerSigningKey, SignatureError};
pub use state::{RoomSnapshot, RoomState};

/// Milliseconds since the Unix epoch, the timestamp unit used in events.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
