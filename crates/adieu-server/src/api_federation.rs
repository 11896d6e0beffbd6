//! Federation endpoints of the leave handshake.

use crate::middleware::FederationOrigin;
use crate::AppState;
use adieu_federation::{make_leave, send_leave, LeaveError, MakeLeaveResponse};
use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// A handshake failure rendered as a Matrix error response.
#[derive(Debug)]
pub struct ApiError(pub LeaveError);

impl From<LeaveError> for ApiError {
    fn from(err: LeaveError) -> Self {
        Self(err)
    }
}

impl ApiError {
    /// HTTP status and Matrix `errcode` for the wrapped error.
    pub fn status_and_errcode(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            LeaveError::RoomUnknown => (StatusCode::NOT_FOUND, "M_NOT_FOUND"),
            LeaveError::UnsupportedRoomVersion(_) => {
                (StatusCode::BAD_REQUEST, "M_UNSUPPORTED_ROOM_VERSION")
            }
            LeaveError::OriginMismatch(_)
            | LeaveError::SignatureInvalid(_)
            | LeaveError::NotAuthorized(_) => (StatusCode::FORBIDDEN, "M_FORBIDDEN"),
            LeaveError::RoomIdMismatch
            | LeaveError::EventIdMismatch
            | LeaveError::MembershipMismatch
            | LeaveError::MalformedContent(_) => (StatusCode::BAD_REQUEST, "M_BAD_JSON"),
            LeaveError::MalformedPayload(_) => (StatusCode::BAD_REQUEST, "M_NOT_JSON"),
            LeaveError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, errcode) = self.status_and_errcode();
        tracing::debug!(kind = self.0.kind(), %status, "leave handshake failed");
        (
            status,
            Json(json!({ "errcode": errcode, "error": self.0.to_string() })),
        )
            .into_response()
    }
}

/// Handler for `GET /_matrix/federation/v1/make_leave/{roomId}/{userId}`.
pub async fn make_leave_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path((room_id, user_id)): Path<(String, String)>,
) -> Result<Json<MakeLeaveResponse>, ApiError> {
    let ctx = state.leave_context();
    let response = make_leave(&ctx, &origin, &room_id, &user_id).await?;
    Ok(Json(response))
}

async fn accept_leave(
    state: &AppState,
    origin: &adieu_types::ServerName,
    room_id: &str,
    event_id: &str,
    body: &[u8],
) -> Result<(), ApiError> {
    let ctx = state.leave_context();
    send_leave(&ctx, origin, room_id, event_id, body).await?;
    Ok(())
}

/// Handler for `PUT /_matrix/federation/v1/send_leave/{roomId}/{eventId}`.
///
/// The v1 API wraps its acknowledgement as `[200, {}]`.
pub async fn send_leave_v1_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path((room_id, event_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    accept_leave(&state, &origin, &room_id, &event_id, &body).await?;
    Ok(Json(json!([200, {}])))
}

/// Handler for `PUT /_matrix/federation/v2/send_leave/{roomId}/{eventId}`.
pub async fn send_leave_v2_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(FederationOrigin(origin)): Extension<FederationOrigin>,
    Path((room_id, event_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    accept_leave(&state, &origin, &room_id, &event_id, &body).await?;
    Ok(Json(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_matrix_codes() {
        let cases = [
            (LeaveError::RoomUnknown, 404, "M_NOT_FOUND"),
            (
                LeaveError::UnsupportedRoomVersion("x".into()),
                400,
                "M_UNSUPPORTED_ROOM_VERSION",
            ),
            (LeaveError::OriginMismatch("nope"), 403, "M_FORBIDDEN"),
            (LeaveError::SignatureInvalid("bad".into()), 403, "M_FORBIDDEN"),
            (LeaveError::NotAuthorized("banned".into()), 403, "M_FORBIDDEN"),
            (LeaveError::EventIdMismatch, 400, "M_BAD_JSON"),
            (LeaveError::MembershipMismatch, 400, "M_BAD_JSON"),
            (LeaveError::MalformedPayload("junk".into()), 400, "M_NOT_JSON"),
            (LeaveError::Internal("db gone".into()), 500, "M_UNKNOWN"),
        ];
        for (err, status, errcode) in cases {
            let (got_status, got_errcode) = ApiError(err).status_and_errcode();
            assert_eq!(got_status.as_u16(), status);
            assert_eq!(got_errcode, errcode);
        }
    }

    #[tokio::test]
    async fn internal_errors_are_opaque() {
        let response = ApiError(LeaveError::Internal("disk I/O at /var/db".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Internal server error");
    }
}
