//! Room event model.
//!
//! Content is typed per event kind ([`MemberContent`], [`CreateContent`]); the
//! generic [`EventDraft`] / [`SignedPdu`] pair carries the envelope fields.

use crate::room_version::RoomVersionRules;
use ruma::{OwnedEventId, OwnedRoomId, OwnedServerName, OwnedUserId, RoomId, ServerName, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `m.room.member`
pub const MEMBER_EVENT_TYPE: &str = "m.room.member";
/// `m.room.create`
pub const CREATE_EVENT_TYPE: &str = "m.room.create";

/// Membership states a user can hold in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Leave,
    Invite,
    Ban,
    Knock,
}

impl Membership {
    /// Returns the wire value for this membership.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Invite => "invite",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of an `m.room.member` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_authorised_via_users_server: Option<OwnedUserId>,
}

impl MemberContent {
    /// Content for a plain leave.
    pub fn leave() -> Self {
        Self {
            membership: Membership::Leave,
            displayname: None,
            avatar_url: None,
            reason: None,
            join_authorised_via_users_server: None,
        }
    }
}

fn default_federate() -> bool {
    true
}

/// Content of an `m.room.create` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<OwnedUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(rename = "m.federate", default = "default_federate")]
    pub federate: bool,
}

/// Content hashes of a signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHashes {
    pub sha256: String,
}

/// `server -> key id -> unpadded base64 signature`.
pub type Signatures = BTreeMap<OwnedServerName, BTreeMap<String, String>>;

/// An event before it has been hashed and signed.
///
/// This is the template `make_leave` hands to the leaving user's server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft<C> {
    pub room_id: OwnedRoomId,
    pub sender: OwnedUserId,
    #[serde(rename = "type")]
    pub kind: String,
    pub state_key: String,
    pub origin: OwnedServerName,
    pub origin_server_ts: u64,
    pub content: C,
    pub prev_events: Vec<OwnedEventId>,
    pub auth_events: Vec<OwnedEventId>,
    pub depth: u64,
}

/// A hashed, signed and identified event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPdu<C> {
    pub event_id: OwnedEventId,
    #[serde(flatten)]
    pub draft: EventDraft<C>,
    pub hashes: EventHashes,
    #[serde(default)]
    pub signatures: Signatures,
}

impl<C> SignedPdu<C> {
    pub fn room_id(&self) -> &RoomId {
        &self.draft.room_id
    }

    pub fn sender(&self) -> &UserId {
        &self.draft.sender
    }

    pub fn origin(&self) -> &ServerName {
        &self.draft.origin
    }

    pub fn state_key(&self) -> &str {
        &self.draft.state_key
    }

    pub fn content(&self) -> &C {
        &self.draft.content
    }
}

/// The unsigned leave template returned by `make_leave`.
pub type LeaveTemplate = EventDraft<MemberContent>;

/// A signed `m.room.member` event.
pub type MembershipEvent = SignedPdu<MemberContent>;

/// A signed `m.room.create` event.
pub type CreateEvent = SignedPdu<CreateContent>;

/// A parsed event together with its room version's rules and the exact JSON
/// it arrived as.
///
/// `json` is what gets stored and forwarded; re-serializing `event` would drop
/// fields this server does not model and break the origin's signature.
#[derive(Debug, Clone)]
pub struct VersionedEvent {
    pub rules: &'static dyn RoomVersionRules,
    pub event: MembershipEvent,
    pub json: serde_json::Value,
}
