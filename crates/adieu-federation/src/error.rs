use thiserror::Error;

/// Errors returned by the leave handshake.
///
/// Every variant except [`LeaveError::Internal`] is a validation failure that
/// is reported to the remote server as-is. `Internal` keeps its detail for
/// logs only; its `Display` never includes the detail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaveError {
    #[error("Room does not exist")]
    RoomUnknown,
    #[error("Unsupported room version: {0}")]
    UnsupportedRoomVersion(String),
    #[error("{0}")]
    OriginMismatch(&'static str),
    #[error("The room ID in the request path must match the room ID in the leave event JSON")]
    RoomIdMismatch,
    #[error("The event ID in the request path must match the event ID in the leave event JSON")]
    EventIdMismatch,
    #[error("The leave must be signed by the server it originated on: {0}")]
    SignatureInvalid(String),
    #[error("The membership in the event content must be set to leave")]
    MembershipMismatch,
    #[error("{0}")]
    MalformedPayload(String),
    #[error("{0}")]
    MalformedContent(String),
    #[error("{0}")]
    NotAuthorized(String),
    #[error("Internal server error")]
    Internal(String),
}

impl LeaveError {
    /// Builds an [`LeaveError::Internal`] and logs the detail for operators.
    pub(crate) fn internal(context: &str, detail: impl std::fmt::Display) -> Self {
        tracing::error!(context, error = %detail, "leave handshake internal failure");
        Self::Internal(format!("{context}: {detail}"))
    }

    /// Short machine-readable name of the error kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomUnknown => "room_unknown",
            Self::UnsupportedRoomVersion(_) => "unsupported_room_version",
            Self::OriginMismatch(_) => "origin_mismatch",
            Self::RoomIdMismatch => "room_id_mismatch",
            Self::EventIdMismatch => "event_id_mismatch",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::MembershipMismatch => "membership_mismatch",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::MalformedContent(_) => "malformed_content",
            Self::NotAuthorized(_) => "not_authorized",
            Self::Internal(_) => "internal",
        }
    }
}
