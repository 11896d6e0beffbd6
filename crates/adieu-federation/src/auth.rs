//! Authorization rules for membership transitions.
//!
//! The rules are evaluated against a borrowed [`RoomState`] and the room
//! version's [`RoomVersionRules`]; the evaluator itself holds no state.

use adieu_types::{
    EventDraft, MemberContent, Membership, RoomState, RoomVersionRules, UserId, MEMBER_EVENT_TYPE,
};
use thiserror::Error;

/// An event was not allowed by the room's authorization rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AuthRejection(pub String);

impl AuthRejection {
    fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Decides whether a membership event is allowed given the room's state.
pub trait AuthorizationEvaluator: Send + Sync {
    fn is_allowed(
        &self,
        rules: &dyn RoomVersionRules,
        event: &EventDraft<MemberContent>,
        state: &RoomState,
    ) -> Result<(), AuthRejection>;
}

/// The membership rules this server enforces.
///
/// Only self-initiated leaves are accepted; every other membership transition
/// is rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct MembershipRules;

impl AuthorizationEvaluator for MembershipRules {
    fn is_allowed(
        &self,
        rules: &dyn RoomVersionRules,
        event: &EventDraft<MemberContent>,
        state: &RoomState,
    ) -> Result<(), AuthRejection> {
        let create = state
            .create
            .as_ref()
            .ok_or_else(|| AuthRejection::new("room has no create event"))?;

        if create.room_id() != &*event.room_id {
            return Err(AuthRejection::new(format!(
                "create event belongs to {}, not {}",
                create.room_id(),
                event.room_id
            )));
        }

        if !create.content().federate
            && event.sender.server_name() != create.sender().server_name()
        {
            return Err(AuthRejection::new(
                "room is not federated and the sender is on another server",
            ));
        }

        if event.kind != MEMBER_EVENT_TYPE {
            return Err(AuthRejection::new(format!(
                "expected {MEMBER_EVENT_TYPE}, got {}",
                event.kind
            )));
        }

        let target = UserId::parse(event.state_key.as_str())
            .map_err(|e| AuthRejection::new(format!("state_key is not a user ID: {e}")))?;

        match event.content.membership {
            Membership::Leave => {}
            other => {
                return Err(AuthRejection::new(format!(
                    "membership {other} is not accepted here"
                )))
            }
        }

        if event.sender != target {
            return Err(AuthRejection::new(
                "a user may only change their own membership to leave",
            ));
        }

        match state.membership_of(&target) {
            Some(Membership::Join) | Some(Membership::Invite) => Ok(()),
            Some(Membership::Knock) if rules.allows_knocking() => Ok(()),
            Some(Membership::Knock) => Err(AuthRejection::new(
                "knocking is not supported by this room version",
            )),
            Some(Membership::Ban) => Err(AuthRejection::new("banned users cannot leave")),
            Some(Membership::Leave) => Err(AuthRejection::new("user has already left the room")),
            None => Err(AuthRejection::new("user is not a member of the room")),
        }
    }
}
