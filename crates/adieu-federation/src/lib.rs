//! The federated leave handshake.
//!
//! A user on a remote server asks this server, which is resident in the room,
//! to draft a leave event ([`make_leave`]). The remote server signs the draft
//! and submits it back ([`send_leave`]), and this server validates it and
//! hands it to ingestion for storage and propagation to the rest of the room.
//!
//! Room-version-specific behaviour is selected once per request from
//! [`adieu_types::RoomVersionRules`]. Everything the handshake needs from the
//! rest of the server is reached through the traits in [`services`], so the
//! handshake itself never touches storage or the network.

pub mod auth;
pub mod error;
pub mod leave;
pub mod services;

#[cfg(test)]
mod testing;

pub use auth::{AuthRejection, AuthorizationEvaluator, MembershipRules};
pub use error::LeaveError;
pub use leave::{make_leave, send_leave, MakeLeaveResponse};
pub use services::{
    EventIngestion, IngestError, IngestOutcome, LeaveContext, ResolveError, RoomStateSource,
    RoomVersionResolver, ServiceError, SignatureVerifier, VerifyJsonRequest, VerifyResult,
};
