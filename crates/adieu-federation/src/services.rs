//! Contracts for the services the leave handshake depends on.
//!
//! Every collaborator is passed in explicitly through [`LeaveContext`]; the
//! handshake never reaches for process-wide state. Each call may block, fail
//! or be cancelled by dropping the request future.

use crate::auth::AuthorizationEvaluator;
use adieu_types::{OwnedServerName, RoomId, RoomSnapshot, ServerName, VersionedEvent};
use async_trait::async_trait;
use thiserror::Error;

/// Failure to resolve a room's version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("room is not known to this server")]
    UnknownRoom,
    #[error("room version lookup failed: {0}")]
    Transport(String),
}

/// An unexpected failure inside a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

/// Maps room IDs to their version tag.
#[async_trait]
pub trait RoomVersionResolver: Send + Sync {
    async fn room_version(&self, room_id: &RoomId) -> Result<String, ResolveError>;
}

/// Reads the current state and forward extremities of a room.
#[async_trait]
pub trait RoomStateSource: Send + Sync {
    /// Returns `None` if this server holds no state for the room.
    async fn snapshot(&self, room_id: &RoomId) -> Result<Option<RoomSnapshot>, ServiceError>;
}

/// One JSON object to check for a server's signature.
#[derive(Debug, Clone)]
pub struct VerifyJsonRequest {
    /// The server whose signature must be present.
    pub server_name: OwnedServerName,
    /// Canonical JSON of the signed object, signatures included.
    pub message: Vec<u8>,
    /// Time (ms since epoch) the signature claims to have been made at.
    pub at_ts: u64,
    /// Require the signing key to have been valid at `at_ts`.
    pub strict_validity: bool,
}

/// Outcome of verifying one [`VerifyJsonRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub error: Option<String>,
}

impl VerifyResult {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Batched signature verification against a key ring.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Returns exactly one result per request, in order. `Err` means the key
    /// ring itself failed, not that a signature was bad.
    async fn verify_json(
        &self,
        requests: &[VerifyJsonRequest],
    ) -> Result<Vec<VerifyResult>, ServiceError>;
}

/// What ingestion did with a submitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The event was authorized, stored and queued for propagation.
    Accepted,
    /// The event was already stored; nothing changed.
    Duplicate,
}

/// Why ingestion refused an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    #[error("event rejected: {0}")]
    Rejected(String),
    #[error("ingestion failed: {0}")]
    Internal(String),
}

/// Authorizes, persists and propagates validated events.
///
/// Submitting an event that is already stored must return
/// [`IngestOutcome::Duplicate`] without side effects.
#[async_trait]
pub trait EventIngestion: Send + Sync {
    async fn submit(
        &self,
        events: Vec<VersionedEvent>,
        send_as: &ServerName,
        extra_destinations: Option<Vec<OwnedServerName>>,
    ) -> Result<IngestOutcome, IngestError>;
}

/// Capability handles for one handshake request.
#[derive(Clone, Copy)]
pub struct LeaveContext<'a> {
    /// This server's name; outbound federation is attributed to it.
    pub server_name: &'a ServerName,
    pub resolver: &'a dyn RoomVersionResolver,
    pub state: &'a dyn RoomStateSource,
    pub authorizer: &'a dyn AuthorizationEvaluator,
    pub verifier: &'a dyn SignatureVerifier,
    pub ingestion: &'a dyn EventIngestion,
}
