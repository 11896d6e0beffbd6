//! Room state as seen by authorization and event construction.

use crate::event::{CreateEvent, Membership, MembershipEvent};
use ruma::{OwnedEventId, OwnedUserId, UserId};
use std::collections::BTreeMap;

/// The membership-relevant current state of a room.
///
/// Owned by the storage side; the handshake only ever borrows it for the
/// duration of one authorization check.
#[derive(Debug, Clone, Default)]
pub struct RoomState {
    /// The room's `m.room.create` event, if known.
    pub create: Option<CreateEvent>,
    /// Current `m.room.member` event per user.
    pub members: BTreeMap<OwnedUserId, MembershipEvent>,
}

impl RoomState {
    /// Current membership of `user`, if they have ever had one.
    pub fn membership_of(&self, user: &UserId) -> Option<Membership> {
        self.members.get(user).map(|ev| ev.content().membership)
    }

    /// Users whose current membership is `join`.
    pub fn joined_members(&self) -> impl Iterator<Item = &UserId> {
        self.members
            .iter()
            .filter(|(_, ev)| ev.content().membership == Membership::Join)
            .map(|(user, _)| user.as_ref())
    }

    /// The state events a membership change by `user` is authorized against:
    /// the create event and the user's own current membership.
    pub fn auth_events_for(&self, user: &UserId) -> Vec<OwnedEventId> {
        let mut ids = Vec::with_capacity(2);
        if let Some(create) = &self.create {
            ids.push(create.event_id.clone());
        }
        if let Some(member) = self.members.get(user) {
            ids.push(member.event_id.clone());
        }
        ids
    }
}

/// Everything needed to build a new event on top of a room.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub state: RoomState,
    /// Current forward extremities, used as `prev_events`.
    pub prev_events: Vec<OwnedEventId>,
    /// Depth of the deepest forward extremity.
    pub max_depth: u64,
}
